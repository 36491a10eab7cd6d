// cli/src/lanzatool/config.rs: lzbt.toml plus command line overrides
//
// Precedence: command line flag, then config file, then built-in default.
// Keys and certificates have no default; an install without them is refused.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{InstallError, Result};

pub const CONFIG_ENV: &str = "LZBT_CONFIG";
pub const DEFAULT_ESP: &str = "/boot";
pub const DEFAULT_STORE_DIR: &str = "/nix/store";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub esp: Option<PathBuf>,
    pub stub: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub configuration_limit: Option<usize>,
    pub systemd_boot: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub allowed_kernel_cmdline_items: Option<Vec<String>>,
    pub loader: Option<LoaderConfig>,
}

/// `[loader]` table, rendered into `loader/loader.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoaderConfig {
    pub timeout: Option<u32>,
    #[serde(default)]
    pub editor: bool,
    pub default: Option<String>,
    pub console_mode: Option<String>,
}

/// Values given on the command line. `None` defers to the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub esp: Option<PathBuf>,
    pub stub: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub configuration_limit: Option<usize>,
    pub systemd_boot: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
}

/// Fully resolved settings for an install run.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub esp: PathBuf,
    pub stub: PathBuf,
    pub public_key: PathBuf,
    pub private_key: PathBuf,
    /// Distinct generation numbers to keep; `None` keeps all.
    pub configuration_limit: Option<usize>,
    pub systemd_boot: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub allowed_kernel_cmdline_items: Option<HashSet<String>>,
    pub loader: Option<LoaderConfig>,
}

impl FileConfig {
    /// Without a path every setting comes from flags and defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        debug!(path = %path.display(), "reading configuration");
        let text = fs::read_to_string(path)
            .map_err(|e| InstallError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text).map_err(|e| match e {
            InstallError::Config(msg) => InstallError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| InstallError::Config(e.to_string()))
    }

    pub fn esp(&self, over: Option<PathBuf>) -> PathBuf {
        over.or_else(|| self.esp.clone()).unwrap_or_else(|| PathBuf::from(DEFAULT_ESP))
    }
}

impl InstallConfig {
    pub fn resolve(file: FileConfig, over: Overrides) -> Result<Self> {
        let esp = file.esp(over.esp);
        let stub = require("stub", over.stub.or(file.stub))?;
        let public_key = require("public-key", over.public_key.or(file.public_key))?;
        let private_key = require("private-key", over.private_key.or(file.private_key))?;

        let configuration_limit = over.configuration_limit.or(file.configuration_limit);
        if configuration_limit == Some(0) {
            return Err(InstallError::Config("configuration-limit must be at least 1".into()));
        }

        Ok(Self {
            esp,
            stub,
            public_key,
            private_key,
            configuration_limit,
            systemd_boot: over.systemd_boot.or(file.systemd_boot),
            store_dir: over
                .store_dir
                .or(file.store_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR)),
            allowed_kernel_cmdline_items: file
                .allowed_kernel_cmdline_items
                .map(|items| items.into_iter().collect()),
            loader: file.loader,
        })
    }
}

fn require(key: &str, value: Option<PathBuf>) -> Result<PathBuf> {
    value.ok_or_else(|| InstallError::Config(format!("`{key}` is not set in the config file or on the command line")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
esp = "/efi"
stub = "/run/lanzaboote/stub.efi"
public-key = "/etc/secureboot/db.pem"
private-key = "/etc/secureboot/db.key"
configuration-limit = 5
allowed-kernel-cmdline-items = ["quiet", "splash"]

[loader]
timeout = 3
default = "nixos-*"
"#;

    #[test]
    fn parses_file() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(file.esp.as_deref(), Some(Path::new("/efi")));
        assert_eq!(file.configuration_limit, Some(5));
        assert_eq!(
            file.loader,
            Some(LoaderConfig { timeout: Some(3), editor: false, default: Some("nixos-*".into()), console_mode: None })
        );
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(FileConfig::parse("espp = \"/efi\""), Err(InstallError::Config(_))));
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let over = Overrides {
            esp: Some("/boot2".into()),
            configuration_limit: Some(2),
            ..Default::default()
        };
        let config = InstallConfig::resolve(file, over).unwrap();
        assert_eq!(config.esp, PathBuf::from("/boot2"));
        assert_eq!(config.configuration_limit, Some(2));
        assert_eq!(config.store_dir, PathBuf::from(DEFAULT_STORE_DIR));
        assert!(config.allowed_kernel_cmdline_items.unwrap().contains("quiet"));
    }

    #[test]
    fn keys_are_required() {
        let err = InstallConfig::resolve(FileConfig::default(), Overrides {
            stub: Some("/stub.efi".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("public-key"));
    }

    #[test]
    fn zero_limit_rejected() {
        let over = Overrides { configuration_limit: Some(0), ..Default::default() };
        let file = FileConfig::parse(SAMPLE).unwrap();
        assert!(matches!(InstallConfig::resolve(file, over), Err(InstallError::Config(_))));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
        assert_eq!(FileConfig::load(None).unwrap(), FileConfig::default());
    }
}
