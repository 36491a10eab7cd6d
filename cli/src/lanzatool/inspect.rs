// cli/src/lanzatool/inspect.rs: `lzbt status`
//
// Reads every managed UKI on the ESP and checks its artifacts the way the
// stub will at boot: path must decode, file must exist, digest must match.

use colored::Colorize;
use lanzaboote_shared::layout::{from_uefi_path, parse_uki_file_name, LINUX_DIR};
use lanzaboote_shared::pe::PeImage;
use lanzaboote_shared::{artifact_digest, ArtifactKind, Digest, EmbeddedConfig};
use serde::Serialize;

use super::error::Result;
use super::esp::Esp;
use super::uki::os_release_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactState {
    Ok,
    Missing,
    DigestMismatch,
    BadPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub kind: String,
    pub path: String,
    pub digest: String,
    pub state: ArtifactState,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub file: String,
    pub generation: u64,
    pub specialisation: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
    pub cmdline: Option<String>,
    pub artifacts: Vec<ArtifactStatus>,
    /// Set when the UKI itself cannot be decoded.
    pub error: Option<String>,
}

impl EntryStatus {
    pub fn bootable(&self) -> bool {
        self.error.is_none() && self.artifacts.iter().all(|a| a.state == ArtifactState::Ok)
    }
}

/// Newest generation first.
pub fn inspect_esp(esp: &Esp) -> Result<Vec<EntryStatus>> {
    let mut entries = Vec::new();
    for name in esp.list(LINUX_DIR)? {
        let Some(id) = parse_uki_file_name(&name) else {
            continue;
        };
        let file = format!("{LINUX_DIR}/{name}");
        let mut entry = EntryStatus {
            file: file.clone(),
            generation: id.number,
            specialisation: id.specialisation.clone(),
            title: None,
            version: None,
            cmdline: None,
            artifacts: Vec::new(),
            error: None,
        };
        match decode(esp, &file) {
            Ok(config) => {
                entry.title = os_release_value(&config.os_release, "PRETTY_NAME");
                entry.version = os_release_value(&config.os_release, "VERSION_ID");
                for kind in [ArtifactKind::Kernel, ArtifactKind::Initrd] {
                    let (path, digest) = config.artifact(kind);
                    entry.artifacts.push(check_artifact(esp, kind, path, digest));
                }
                entry.cmdline = Some(config.cmdline);
            }
            Err(reason) => entry.error = Some(reason),
        }
        entries.push(entry);
    }
    entries.sort_by(|a, b| {
        b.generation
            .cmp(&a.generation)
            .then_with(|| a.specialisation.cmp(&b.specialisation))
    });
    Ok(entries)
}

fn decode(esp: &Esp, file: &str) -> std::result::Result<EmbeddedConfig, String> {
    let image = esp.read(file).map_err(|e| e.to_string())?;
    let pe = PeImage::parse(&image).map_err(|e| e.to_string())?;
    EmbeddedConfig::from_image(&pe).map_err(|e| e.to_string())
}

fn check_artifact(esp: &Esp, kind: ArtifactKind, uefi_path: &str, expected: &Digest) -> ArtifactStatus {
    let status = |path: String, state| ArtifactStatus {
        kind: kind.to_string(),
        path,
        digest: expected.to_string(),
        state,
    };
    let Some(path) = from_uefi_path(uefi_path) else {
        return status(uefi_path.to_string(), ArtifactState::BadPath);
    };
    let state = match esp.read(&path) {
        Err(_) => ArtifactState::Missing,
        Ok(data) if artifact_digest(&data) == *expected => ArtifactState::Ok,
        Ok(_) => ArtifactState::DigestMismatch,
    };
    status(path, state)
}

pub fn print_human(entries: &[EntryStatus]) {
    if entries.is_empty() {
        println!("[status] no lanzaboote entries on the ESP");
        return;
    }
    for entry in entries {
        let mark = if entry.bootable() { "ok".green().bold() } else { "BROKEN".red().bold() };
        println!("[{mark}] {}", entry.file.bold());
        if let Some(title) = &entry.title {
            println!("      title    {title}");
        }
        if let Some(version) = &entry.version {
            println!("      version  {version}");
        }
        if let Some(cmdline) = &entry.cmdline {
            println!("      cmdline  {cmdline}");
        }
        for artifact in &entry.artifacts {
            let state = match artifact.state {
                ArtifactState::Ok => "ok".green(),
                ArtifactState::Missing => "missing".red(),
                ArtifactState::DigestMismatch => "digest mismatch".red(),
                ArtifactState::BadPath => "bad path".red(),
            };
            println!("      {:<8} {} [{state}]", artifact.kind, artifact.path);
        }
        if let Some(error) = &entry.error {
            println!("      {}", error.red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanzaboote_shared::layout::to_uefi_path;
    use lanzaboote_shared::pe::append_sections;
    use lanzaboote_shared::pe::testing::minimal_efi_image;
    use lanzaboote_shared::GenerationId;
    use pretty_assertions::assert_eq;

    fn install(esp: &Esp, id: &GenerationId) -> EmbeddedConfig {
        let kd = artifact_digest(b"kernel");
        let idg = artifact_digest(b"initrd");
        let kp = id.artifact_path(ArtifactKind::Kernel, &kd);
        let ip = id.artifact_path(ArtifactKind::Initrd, &idg);
        esp.write_atomic(&kp, b"kernel").unwrap();
        esp.write_atomic(&ip, b"initrd").unwrap();
        let config = EmbeddedConfig {
            os_release: "ID=nixos\nPRETTY_NAME=\"NixOS\"\nVERSION_ID=\"Generation 1\"\n".into(),
            cmdline: "init=/init quiet".into(),
            kernel_path: to_uefi_path(&kp),
            kernel_digest: kd,
            initrd_path: to_uefi_path(&ip),
            initrd_digest: idg,
        };
        let uki = append_sections(&minimal_efi_image(), &config.sections()).unwrap();
        esp.write_atomic(&id.uki_path(), &uki).unwrap();
        config
    }

    #[test]
    fn healthy_entry() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        install(&esp, &GenerationId::new(1));

        let entries = inspect_esp(&esp).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].bootable());
        assert_eq!(entries[0].title.as_deref(), Some("NixOS"));
        assert_eq!(entries[0].cmdline.as_deref(), Some("init=/init quiet"));
    }

    #[test]
    fn tampered_and_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        let config = install(&esp, &GenerationId::new(1));
        let kernel = from_uefi_path(&config.kernel_path).unwrap();
        let initrd = from_uefi_path(&config.initrd_path).unwrap();
        esp.write_atomic(&kernel, b"evil kernel").unwrap();
        esp.remove(&initrd).unwrap();

        let entries = inspect_esp(&esp).unwrap();
        let states: Vec<_> = entries[0].artifacts.iter().map(|a| a.state).collect();
        assert_eq!(states, vec![ArtifactState::DigestMismatch, ArtifactState::Missing]);
        assert!(!entries[0].bootable());
    }

    #[test]
    fn sorted_newest_first_and_garbage_reported() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        install(&esp, &GenerationId::new(2));
        install(&esp, &GenerationId::new(10));
        esp.write_atomic("EFI/Linux/nixos-generation-5.efi", b"junk").unwrap();

        let entries = inspect_esp(&esp).unwrap();
        assert_eq!(entries.iter().map(|e| e.generation).collect::<Vec<_>>(), vec![10, 5, 2]);
        assert!(entries[1].error.is_some());
    }
}
