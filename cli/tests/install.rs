// cli/tests/install.rs: end-to-end runs of `lzbt` against a scratch ESP
//
// sbsign is replaced by a shell script on PATH that copies its input, and
// refuses any image containing the marker SIGNFAIL.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use lanzaboote_shared::pe::testing::minimal_efi_image;
use lanzatool::esp::Esp;
use lanzatool::lock::EspLock;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tempfile::TempDir;

const FAKE_SBSIGN: &str = r#"#!/bin/sh
while [ $# -gt 1 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --key|--cert) shift 2 ;;
    *) break ;;
  esac
done
if grep -q SIGNFAIL "$1"; then
  echo "refusing to sign $1" >&2
  exit 1
fi
cp "$1" "$out"
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["bin", "esp", "nix/store", "profiles"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        let sbsign = root.join("bin/sbsign");
        fs::write(&sbsign, FAKE_SBSIGN).unwrap();
        fs::set_permissions(&sbsign, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("db.key"), "key").unwrap();
        fs::write(root.join("db.pem"), "cert").unwrap();
        fs::write(root.join("stub.efi"), minimal_efi_image()).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn esp(&self) -> PathBuf {
        self.root().join("esp")
    }

    fn store(&self) -> PathBuf {
        self.root().join("nix/store")
    }

    fn link(&self, n: u64) -> PathBuf {
        self.root().join(format!("profiles/system-{n}-link"))
    }

    /// Store closure plus profile link for generation `n`.
    fn generation(&self, n: u64, kernel: &str) -> PathBuf {
        let store = self.store();
        let (linux, initrd, system) = (
            store.join(format!("linux-{n}")),
            store.join(format!("initrd-{n}")),
            store.join(format!("nixos-system-{n}")),
        );
        for dir in [&linux, &initrd, &system] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(linux.join("bzImage"), kernel).unwrap();
        fs::write(initrd.join("initrd"), format!("initrd-{n}")).unwrap();
        fs::write(system.join("init"), "#!/bin/sh").unwrap();

        let link = self.link(n);
        fs::create_dir_all(&link).unwrap();
        let boot = serde_json::json!({
            "org.nixos.bootspec.v1": {
                "system": "x86_64-linux",
                "init": system.join("init"),
                "initrd": initrd.join("initrd"),
                "kernel": linux.join("bzImage"),
                "kernelParams": ["quiet", format!("generation={n}")],
                "label": "NixOS 24.05",
                "toplevel": system,
            }
        });
        fs::write(link.join("boot.json"), boot.to_string()).unwrap();
        link
    }

    fn lzbt(&self) -> Command {
        let mut cmd = Command::cargo_bin("lzbt").unwrap();
        let path = format!("{}:{}", self.root().join("bin").display(), std::env::var("PATH").unwrap_or_default());
        cmd.env("PATH", path).env_remove("LZBT_CONFIG").env_remove("LZBT_LOG");
        cmd
    }

    fn install(&self, limit: Option<usize>, links: &[PathBuf]) -> Command {
        let mut cmd = self.lzbt();
        cmd.arg("install")
            .arg("--esp")
            .arg(self.esp())
            .arg("--stub")
            .arg(self.root().join("stub.efi"))
            .arg("--public-key")
            .arg(self.root().join("db.pem"))
            .arg("--private-key")
            .arg(self.root().join("db.key"))
            .arg("--store-dir")
            .arg(self.store());
        if let Some(limit) = limit {
            cmd.arg("--configuration-limit").arg(limit.to_string());
        }
        cmd.args(links);
        cmd
    }

    fn status(&self) -> Vec<Value> {
        let output = self.lzbt().arg("status").arg("--esp").arg(self.esp()).arg("--json").output().unwrap();
        let value: Value = serde_json::from_slice(&output.stdout).unwrap();
        value.as_array().unwrap().clone()
    }

    /// Visible files in an ESP directory; skips the lock file.
    fn files(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.esp().join(dir)) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .filter(|name| !name.starts_with('.'))
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn read_esp(&self, relative: &str) -> Vec<u8> {
        fs::read(self.esp().join(relative)).unwrap()
    }
}

#[test]
fn generation_42_produces_its_uki() {
    let fx = Fixture::new();
    let link = fx.generation(42, "kernel-42");
    fx.install(None, &[link]).assert().success();

    assert_eq!(fx.files("EFI/Linux"), vec!["nixos-generation-42.efi"]);
    let artifacts = fx.files("EFI/nixos");
    assert_eq!(artifacts.iter().filter(|n| n.starts_with("generation-42-kernel-")).count(), 1);
    assert_eq!(artifacts.iter().filter(|n| n.starts_with("generation-42-initrd-")).count(), 1);
}

#[test]
fn status_reads_back_what_install_wrote() {
    let fx = Fixture::new();
    let link = fx.generation(7, "kernel-7");
    fx.install(None, &[link]).assert().success();

    let entries = fx.status();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["generation"], 7);
    assert_eq!(entry["title"], "NixOS 24.05");
    let cmdline = entry["cmdline"].as_str().unwrap();
    assert!(cmdline.starts_with("init="));
    assert!(cmdline.ends_with(" quiet generation=7"));
    for artifact in entry["artifacts"].as_array().unwrap() {
        assert_eq!(artifact["state"], "ok");
    }
}

#[test]
fn rerun_is_unchanged() {
    let fx = Fixture::new();
    let link = fx.generation(1, "kernel-1");
    fx.install(None, &[link.clone()]).assert().success();
    let before = fx.read_esp("EFI/Linux/nixos-generation-1.efi");

    let out = fx.install(None, &[link]).assert().success();
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("unchanged"));
    assert_eq!(fx.read_esp("EFI/Linux/nixos-generation-1.efi"), before);
}

#[test]
fn gc_keeps_only_retained_generations() {
    let fx = Fixture::new();
    let links: Vec<PathBuf> = (1..=3).map(|n| fx.generation(n, &format!("kernel-{n}"))).collect();
    fx.install(None, &links).assert().success();
    assert_eq!(fx.files("EFI/Linux").len(), 3);

    fx.install(Some(2), &links).assert().success();
    assert_eq!(
        fx.files("EFI/Linux"),
        vec!["nixos-generation-2.efi", "nixos-generation-3.efi"]
    );
    assert!(fx.files("EFI/nixos").iter().all(|n| !n.starts_with("generation-1-")));
    assert_eq!(fx.files("EFI/nixos").len(), 4);
}

#[test]
fn failed_generation_keeps_previous_entry() {
    let fx = Fixture::new();
    let links: Vec<PathBuf> = (1..=2).map(|n| fx.generation(n, &format!("kernel-{n}"))).collect();
    fx.install(None, &links).assert().success();
    let old_uki = fx.read_esp("EFI/Linux/nixos-generation-2.efi");
    let old_artifacts = fx.files("EFI/nixos");

    // Generation 2 can no longer be signed; generation 3 is new.
    fs::write(fx.store().join("linux-2/bzImage"), "kernel-2 SIGNFAIL").unwrap();
    let third = fx.generation(3, "kernel-3");
    let mut all = links.clone();
    all.push(third);
    fx.install(None, &all).assert().code(1);

    assert_eq!(fx.read_esp("EFI/Linux/nixos-generation-2.efi"), old_uki);
    let artifacts = fx.files("EFI/nixos");
    for name in old_artifacts {
        assert!(artifacts.contains(&name), "{name} was removed");
    }
    let entries = fx.status();
    let generations: Vec<u64> = entries.iter().map(|e| e["generation"].as_u64().unwrap()).collect();
    assert_eq!(generations, vec![3, 2, 1]);
    for entry in &entries {
        assert!(entry["error"].is_null());
        for artifact in entry["artifacts"].as_array().unwrap() {
            assert_eq!(artifact["state"], "ok");
        }
    }
}

#[test]
fn failed_newest_generation_does_not_cost_an_old_entry() {
    let fx = Fixture::new();
    let links: Vec<PathBuf> = (1..=2).map(|n| fx.generation(n, &format!("kernel-{n}"))).collect();
    fx.install(Some(2), &links).assert().success();

    // Generation 3 cannot be signed, so with limit 2 only generation 2 would
    // remain bootable; generation 1 has to stay.
    let third = fx.generation(3, "kernel-3 SIGNFAIL");
    let mut all = links.clone();
    all.push(third);
    let out = fx.install(Some(2), &all).assert().code(1);
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("generation 1"));

    assert_eq!(
        fx.files("EFI/Linux"),
        vec!["nixos-generation-1.efi", "nixos-generation-2.efi"]
    );
    let entries = fx.status();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert!(entry["error"].is_null());
        for artifact in entry["artifacts"].as_array().unwrap() {
            assert_eq!(artifact["state"], "ok");
        }
    }
}

#[test]
fn malformed_bootspec_fails_that_generation_only() {
    let fx = Fixture::new();
    let good = fx.generation(1, "kernel-1");
    let bad = fx.generation(2, "kernel-2");
    fs::write(bad.join("boot.json"), "{ \"org.nixos.bootspec.v1\": ").unwrap();

    let out = fx.install(None, &[good, bad]).assert().code(1);
    let stdout = String::from_utf8_lossy(&out.get_output().stdout).to_string();
    assert!(stdout.contains("generation 2"));
    assert_eq!(fx.files("EFI/Linux"), vec!["nixos-generation-1.efi"]);
}

#[test]
fn vanished_generation_is_dropped() {
    let fx = Fixture::new();
    let links: Vec<PathBuf> = (1..=2).map(|n| fx.generation(n, &format!("kernel-{n}"))).collect();
    fx.install(None, &links).assert().success();

    fs::remove_dir_all(fx.store().join("linux-1")).unwrap();
    fx.install(None, &links).assert().success();
    assert_eq!(fx.files("EFI/Linux"), vec!["nixos-generation-2.efi"]);
}

#[test]
fn locked_esp_is_left_alone() {
    let fx = Fixture::new();
    let link = fx.generation(1, "kernel-1");
    let esp = Esp::open(&fx.esp()).unwrap();
    let _held = EspLock::acquire(&esp).unwrap();

    fx.install(None, &[link]).assert().code(2);
    assert!(fx.files("EFI/Linux").is_empty());
}

#[test]
fn json_report_lists_installed_generations() {
    let fx = Fixture::new();
    let link = fx.generation(5, "kernel-5");
    let out = fx.install(None, &[link]).arg("--json").assert().success();
    let report: Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(report["installed"], serde_json::json!(["generation 5"]));
    assert_eq!(report["failed"], serde_json::json!([]));
}
