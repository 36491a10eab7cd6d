// cli/src/lanzatool/generation.rs: profile links and the generations they hold

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate};
use lanzaboote_shared::GenerationId;

use super::bootspec::{BootJson, Bootspec, BOOTSPEC_FILE};
use super::error::{InstallError, Result};

/// `/nix/var/nix/profiles/system-<N>-link`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLink {
    pub number: u64,
    pub path: PathBuf,
}

impl GenerationLink {
    pub fn from_path(path: &Path) -> Result<Self> {
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_link_name)
            .ok_or_else(|| InstallError::malformed_bootspec(path, "cannot derive a generation number from the link name"))?;
        Ok(Self { number, path: path.to_path_buf() })
    }

    pub fn bootspec_path(&self) -> PathBuf {
        self.path.join(BOOTSPEC_FILE)
    }

    /// Date the link was created, which is when the generation was built.
    pub fn build_date(&self) -> Result<NaiveDate> {
        let modified = fs::symlink_metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(InstallError::io(format!("stat {}", self.path.display())))?;
        Ok(DateTime::<Local>::from(modified).date_naive())
    }
}

/// `system-42-link` -> 42
pub fn parse_link_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("system-")?.strip_suffix("-link")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// One boot entry: a generation or one of its specialisations.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: GenerationId,
    pub boot: BootJson,
    pub build_date: NaiveDate,
    /// Where the bootspec came from, for error messages.
    pub origin: PathBuf,
}

impl Generation {
    /// The base generation first, then specialisations by name.
    pub fn load(link: &GenerationLink) -> Result<Vec<Generation>> {
        let origin = link.bootspec_path();
        let bootspec = Bootspec::from_file(&origin)?;
        let build_date = link.build_date()?;

        let mut out = Vec::with_capacity(1 + bootspec.specialisations.len());
        out.push(Generation {
            id: GenerationId::new(link.number),
            boot: bootspec.boot,
            build_date,
            origin: origin.clone(),
        });
        for (name, boot) in bootspec.specialisations {
            let id = GenerationId::specialised(link.number, &name)
                .ok_or_else(|| InstallError::malformed_bootspec(&origin, format!("bad specialisation {name:?}")))?;
            out.push(Generation { id, boot, build_date, origin: origin.clone() });
        }
        Ok(out)
    }

    /// `Generation 42-specialisation-gaming, Built on 2024-05-01`
    pub fn version_id(&self) -> String {
        let mut version = format!("Generation {}", self.id.number);
        if let Some(name) = &self.id.specialisation {
            version.push_str("-specialisation-");
            version.push_str(name);
        }
        format!("{version}, Built on {}", self.build_date.format("%Y-%m-%d"))
    }

    /// Boot menu title.
    pub fn pretty_name(&self) -> String {
        match &self.id.specialisation {
            Some(name) => format!("{} ({name})", self.boot.label),
            None => self.boot.label.clone(),
        }
    }
}
