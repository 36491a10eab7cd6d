// cli/src/lanzatool/gc.rs: remove what no retained generation needs
//
// UKIs are kept or removed by generation id. Artifacts are kept when any
// surviving UKI references them, where references are read back from the
// UKIs on the ESP rather than recomputed, so a retained generation that
// failed to reinstall keeps the files its old UKI points at.

use std::collections::{BTreeSet, HashSet};

use lanzaboote_shared::layout::{
    from_uefi_path, is_managed_artifact, is_temp_file, parse_uki_file_name, ARTIFACT_DIR, FALLBACK_DIR,
    LINUX_DIR, SYSTEMD_DIR,
};
use lanzaboote_shared::pe::PeImage;
use lanzaboote_shared::{EmbeddedConfig, GenerationId};
use serde::Serialize;
use tracing::{info, warn};

use super::error::Result;
use super::esp::Esp;

const LOADER_DIR: &str = "loader";

/// Which generation ids survive this run.
#[derive(Debug, Clone, Default)]
pub struct Retention {
    numbers: BTreeSet<u64>,
    dropped: BTreeSet<GenerationId>,
}

impl Retention {
    pub fn new(numbers: impl IntoIterator<Item = u64>) -> Self {
        Self { numbers: numbers.into_iter().collect(), dropped: BTreeSet::new() }
    }

    /// Exclude one id of an otherwise retained generation, e.g. because its
    /// store paths were garbage collected.
    pub fn drop_id(&mut self, id: GenerationId) {
        self.dropped.insert(id);
    }

    /// Retain an extra generation number, e.g. an older entry standing in
    /// for one that could not be installed.
    pub fn keep_number(&mut self, number: u64) {
        self.numbers.insert(number);
    }

    pub fn retains(&self, id: &GenerationId) -> bool {
        self.numbers.contains(&id.number) && !self.dropped.contains(id)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub removed: Vec<String>,
    /// Set when a retained UKI could not be read, so no artifact was removed.
    pub artifacts_skipped: bool,
}

pub fn collect_garbage(esp: &Esp, retention: &Retention) -> Result<GcReport> {
    let mut report = GcReport::default();

    for dir in [LINUX_DIR, ARTIFACT_DIR, SYSTEMD_DIR, FALLBACK_DIR, LOADER_DIR] {
        for name in esp.list(dir)? {
            if is_temp_file(&name) {
                remove(esp, &format!("{dir}/{name}"), &mut report)?;
            }
        }
    }

    let mut kept_ukis = Vec::new();
    for name in esp.list(LINUX_DIR)? {
        let Some(id) = parse_uki_file_name(&name) else {
            continue;
        };
        let path = format!("{LINUX_DIR}/{name}");
        if retention.retains(&id) {
            kept_ukis.push(path);
        } else {
            remove(esp, &path, &mut report)?;
        }
    }

    let Some(referenced) = referenced_artifacts(esp, &kept_ukis) else {
        report.artifacts_skipped = true;
        return Ok(report);
    };

    for name in esp.list(ARTIFACT_DIR)? {
        let path = format!("{ARTIFACT_DIR}/{name}");
        if is_managed_artifact(&name) && !referenced.contains(&path) {
            remove(esp, &path, &mut report)?;
        }
    }

    Ok(report)
}

/// `None` if any UKI cannot be decoded.
fn referenced_artifacts(esp: &Esp, ukis: &[String]) -> Option<HashSet<String>> {
    let mut referenced = HashSet::new();
    for uki in ukis {
        match read_references(esp, uki) {
            Ok(paths) => referenced.extend(paths),
            Err(reason) => {
                warn!(%uki, %reason, "cannot read artifact references, keeping all artifacts");
                return None;
            }
        }
    }
    Some(referenced)
}

fn read_references(esp: &Esp, uki: &str) -> std::result::Result<[String; 2], String> {
    let image = esp.read(uki).map_err(|e| e.to_string())?;
    let pe = PeImage::parse(&image).map_err(|e| e.to_string())?;
    let config = EmbeddedConfig::from_image(&pe).map_err(|e| e.to_string())?;
    let esp_path = |p: &str| from_uefi_path(p).ok_or_else(|| format!("bad path {p}"));
    Ok([esp_path(&config.kernel_path)?, esp_path(&config.initrd_path)?])
}

fn remove(esp: &Esp, path: &str, report: &mut GcReport) -> Result<()> {
    esp.remove(path)?;
    info!(%path, "removed");
    report.removed.push(path.to_string());
    Ok(())
}

/// Generation ids that have a UKI on the ESP.
pub fn installed_generations(esp: &Esp) -> Result<Vec<GenerationId>> {
    Ok(esp
        .list(LINUX_DIR)?
        .iter()
        .filter_map(|name| parse_uki_file_name(name))
        .collect())
}

/// For every retained generation that will have no UKI after this run, keep
/// the newest older entry that is still on the ESP, chosen from
/// `candidates` (numbers the profile still has but the limit cut off).
/// Returns the numbers kept in addition.
pub fn backfill_retention(esp: &Esp, retention: &mut Retention, candidates: &[u64]) -> Result<Vec<u64>> {
    let on_esp: BTreeSet<u64> = installed_generations(esp)?
        .into_iter()
        .filter(|id| id.specialisation.is_none())
        .map(|id| id.number)
        .collect();

    let missing = retention
        .numbers
        .iter()
        .filter(|&&n| {
            let id = GenerationId::new(n);
            !retention.retains(&id) || !on_esp.contains(&n)
        })
        .count();
    if missing == 0 {
        return Ok(Vec::new());
    }

    let mut available: Vec<u64> = candidates
        .iter()
        .copied()
        .filter(|n| on_esp.contains(n) && !retention.numbers.contains(n))
        .collect();
    available.sort_unstable_by(|a, b| b.cmp(a));
    available.dedup();
    available.truncate(missing);

    for &n in &available {
        warn!(generation = n, "keeping older entry in place of one that is not bootable");
        retention.keep_number(n);
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanzaboote_shared::layout::to_uefi_path;
    use lanzaboote_shared::pe::append_sections;
    use lanzaboote_shared::pe::testing::minimal_efi_image;
    use lanzaboote_shared::{artifact_digest, ArtifactKind};
    use pretty_assertions::assert_eq;

    /// Install a fake generation: artifacts plus a UKI that references them.
    fn install(esp: &Esp, id: &GenerationId, kernel: &[u8]) {
        let kd = artifact_digest(kernel);
        let id_ = artifact_digest(b"initrd");
        let kernel_path = id.artifact_path(ArtifactKind::Kernel, &kd);
        let initrd_path = id.artifact_path(ArtifactKind::Initrd, &id_);
        esp.write_atomic(&kernel_path, kernel).unwrap();
        esp.write_atomic(&initrd_path, b"initrd").unwrap();
        let config = EmbeddedConfig {
            os_release: "ID=nixos\n".into(),
            cmdline: "init=/init".into(),
            kernel_path: to_uefi_path(&kernel_path),
            kernel_digest: kd,
            initrd_path: to_uefi_path(&initrd_path),
            initrd_digest: id_,
        };
        let uki = append_sections(&minimal_efi_image(), &config.sections()).unwrap();
        esp.write_atomic(&id.uki_path(), &uki).unwrap();
    }

    fn files(esp: &Esp) -> Vec<String> {
        let mut all = Vec::new();
        for dir in [LINUX_DIR, ARTIFACT_DIR] {
            all.extend(esp.list(dir).unwrap().into_iter().map(|n| format!("{dir}/{n}")));
        }
        all
    }

    #[test]
    fn removes_only_non_retained() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        for n in 1..=3 {
            install(&esp, &GenerationId::new(n), format!("kernel-{n}").as_bytes());
        }

        let report = collect_garbage(&esp, &Retention::new([2, 3])).unwrap();
        assert!(!report.artifacts_skipped);
        assert_eq!(report.removed.len(), 3);

        let left = files(&esp);
        assert!(left.iter().all(|f| !f.contains("generation-1")));
        assert_eq!(left.iter().filter(|f| f.contains("generation-2")).count(), 3);
        assert_eq!(left.iter().filter(|f| f.contains("generation-3")).count(), 3);
    }

    #[test]
    fn dropped_specialisation_removed() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        let special = GenerationId::specialised(5, "gaming").unwrap();
        install(&esp, &GenerationId::new(5), b"k");
        install(&esp, &special, b"k");

        let mut retention = Retention::new([5]);
        retention.drop_id(special.clone());
        collect_garbage(&esp, &retention).unwrap();
        assert_eq!(installed_generations(&esp).unwrap(), vec![GenerationId::new(5)]);
    }

    #[test]
    fn zero_padded_names_are_not_ours() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        install(&esp, &GenerationId::new(42), b"k");
        esp.write_atomic("EFI/Linux/nixos-generation-042.efi", b"foreign").unwrap();

        collect_garbage(&esp, &Retention::new([42])).unwrap();
        assert_eq!(installed_generations(&esp).unwrap(), vec![GenerationId::new(42)]);
        assert!(esp.exists("EFI/Linux/nixos-generation-042.efi"));
    }

    #[test]
    fn older_entry_stands_in_for_missing_one() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        for n in 1..=3 {
            install(&esp, &GenerationId::new(n), format!("kernel-{n}").as_bytes());
        }

        // Limit 2 over [1..=4]; generation 4 never made it onto the ESP.
        let mut retention = Retention::new([4, 3]);
        let kept = backfill_retention(&esp, &mut retention, &[2, 1]).unwrap();
        assert_eq!(kept, vec![2]);
        collect_garbage(&esp, &retention).unwrap();

        let mut left = installed_generations(&esp).unwrap();
        left.sort();
        assert_eq!(left, vec![GenerationId::new(2), GenerationId::new(3)]);
    }

    #[test]
    fn dropped_generation_is_backfilled_too() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        for n in 1..=2 {
            install(&esp, &GenerationId::new(n), format!("kernel-{n}").as_bytes());
        }

        let mut retention = Retention::new([2]);
        retention.drop_id(GenerationId::new(2));
        assert_eq!(backfill_retention(&esp, &mut retention, &[1]).unwrap(), vec![1]);
        assert!(retention.retains(&GenerationId::new(1)));
    }

    #[test]
    fn nothing_backfilled_when_all_present() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        for n in 1..=2 {
            install(&esp, &GenerationId::new(n), format!("kernel-{n}").as_bytes());
        }
        let mut retention = Retention::new([2]);
        assert!(backfill_retention(&esp, &mut retention, &[1]).unwrap().is_empty());
        assert!(!retention.retains(&GenerationId::new(1)));
    }

    #[test]
    fn stale_temp_files_and_orphans_removed() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        install(&esp, &GenerationId::new(1), b"k");
        esp.write_atomic("EFI/Linux/.lzbt-crashed", b"").unwrap();
        esp.write_atomic("EFI/nixos/generation-1-kernel-0000000000000000.efi", b"old").unwrap();
        esp.write_atomic("EFI/nixos/unrelated.efi", b"keep").unwrap();
        esp.write_atomic("EFI/Linux/other-distro.efi", b"keep").unwrap();

        let report = collect_garbage(&esp, &Retention::new([1])).unwrap();
        assert_eq!(
            report.removed,
            vec!["EFI/Linux/.lzbt-crashed", "EFI/nixos/generation-1-kernel-0000000000000000.efi"]
        );
        assert!(esp.exists("EFI/nixos/unrelated.efi"));
        assert!(esp.exists("EFI/Linux/other-distro.efi"));
    }

    #[test]
    fn unreadable_uki_keeps_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let esp = Esp::open(dir.path()).unwrap();
        install(&esp, &GenerationId::new(1), b"k");
        esp.write_atomic("EFI/Linux/nixos-generation-2.efi", b"garbage").unwrap();
        esp.write_atomic("EFI/nixos/generation-9-kernel-0000000000000000.efi", b"orphan").unwrap();

        let report = collect_garbage(&esp, &Retention::new([1, 2])).unwrap();
        assert!(report.artifacts_skipped);
        assert!(esp.exists("EFI/nixos/generation-9-kernel-0000000000000000.efi"));
    }
}
