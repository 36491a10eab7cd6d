// cli/src/lanzatool/bootspec.rs: bootspec v1 documents
//
// A generation's profile link holds `boot.json`. Only the v1 schema is
// accepted. Specialisations are nested documents of the same shape; only
// one level is honoured.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use lanzaboote_shared::layout::valid_specialisation_name;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{InstallError, Result};

pub const BOOTSPEC_FILE: &str = "boot.json";
pub const BOOTSPEC_V1: &str = "org.nixos.bootspec.v1";
pub const SPECIALISATION_V1: &str = "org.nixos.specialisation.v1";

/// The `org.nixos.bootspec.v1` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootJson {
    pub system: String,
    pub init: PathBuf,
    pub initrd: Option<PathBuf>,
    pub initrd_secrets: Option<PathBuf>,
    pub kernel: PathBuf,
    #[serde(default)]
    pub kernel_params: Vec<String>,
    pub label: String,
    pub toplevel: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(rename = "org.nixos.bootspec.v1")]
    v1: Option<BootJson>,
    #[serde(rename = "org.nixos.specialisation.v1", default)]
    specialisations: BTreeMap<String, Document>,
}

/// A parsed bootspec plus its direct specialisations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootspec {
    pub boot: BootJson,
    pub specialisations: BTreeMap<String, BootJson>,
}

impl Bootspec {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| InstallError::malformed_bootspec(path, e.to_string()))?;
        Self::parse(&text, path)
    }

    /// `origin` only labels errors.
    pub fn parse(json: &str, origin: &Path) -> Result<Self> {
        let doc: Document =
            serde_json::from_str(json).map_err(|e| InstallError::malformed_bootspec(origin, e.to_string()))?;
        let boot = doc
            .v1
            .ok_or_else(|| InstallError::malformed_bootspec(origin, format!("no `{BOOTSPEC_V1}` object")))?;

        let mut specialisations = BTreeMap::new();
        for (name, nested) in doc.specialisations {
            if !valid_specialisation_name(&name) {
                return Err(InstallError::malformed_bootspec(
                    origin,
                    format!("specialisation name {name:?} is not allowed"),
                ));
            }
            if !nested.specialisations.is_empty() {
                warn!(specialisation = %name, "ignoring nested specialisations");
            }
            let nested_boot = nested.v1.ok_or_else(|| {
                InstallError::malformed_bootspec(origin, format!("specialisation {name} has no `{BOOTSPEC_V1}` object"))
            })?;
            specialisations.insert(name, nested_boot);
        }

        Ok(Self { boot, specialisations })
    }
}

impl BootJson {
    /// `initrd` is optional in bootspec but the stub always hands one over.
    pub fn initrd(&self, origin: &Path) -> Result<&Path> {
        self.initrd
            .as_deref()
            .ok_or_else(|| InstallError::malformed_bootspec(origin, "no initrd"))
    }

    /// Store paths a signature over this boot entry vouches for.
    pub fn store_paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.kernel.as_path(), self.init.as_path(), self.toplevel.as_path()];
        paths.extend(self.initrd.as_deref());
        paths.extend(self.initrd_secrets.as_deref());
        paths
    }

    /// Lexical check that every path stays inside `store_dir`, then an
    /// existence check. The first is a malformed document, the second a
    /// garbage-collected closure.
    pub fn validate(&self, store_dir: &Path, origin: &Path) -> Result<()> {
        self.initrd(origin)?;
        // The label lands in os-release text, one key per line.
        if self.label.chars().any(char::is_control) {
            return Err(InstallError::malformed_bootspec(origin, "label contains control characters"));
        }
        for path in self.store_paths() {
            if !inside(store_dir, path) {
                return Err(InstallError::malformed_bootspec(
                    origin,
                    format!("{} is outside {}", path.display(), store_dir.display()),
                ));
            }
        }
        for path in self.store_paths() {
            if !path.exists() {
                return Err(InstallError::MissingStorePath(path.to_path_buf()));
            }
        }
        Ok(())
    }
}

fn inside(dir: &Path, path: &Path) -> bool {
    path.is_absolute()
        && path.starts_with(dir)
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir | Component::CurDir))
}
