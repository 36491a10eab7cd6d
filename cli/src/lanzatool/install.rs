// cli/src/lanzatool/install.rs: one install run over a set of generation links
//
// Per generation: validate, policy check, sign kernel, write artifacts, then
// assemble, sign and publish the UKI. A failing generation is recorded and
// skipped; its previous files stay because GC retains by generation id.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use lanzaboote_shared::layout::Architecture;
use lanzaboote_shared::{artifact_digest, ArtifactKind};
use serde::Serialize;
use tracing::{error, info, warn};

use super::config::InstallConfig;
use super::error::{InstallError, Result};
use super::esp::Esp;
use super::gc::{backfill_retention, collect_garbage, GcReport, Retention};
use super::generation::{Generation, GenerationLink};
use super::loader::{install_systemd_boot, write_loader_conf};
use super::lock::EspLock;
use super::policy::{Policy, TrivialPolicy};
use super::signer::{SbsignSigner, Signer};
use super::uki::{self, EspArtifact, StubParameters};

#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub target: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Generations whose store paths are gone; their entries are removed.
    pub dropped: Vec<String>,
    /// Older generations kept past the limit because a retained one has no
    /// bootable entry.
    pub kept: Vec<u64>,
    pub failed: Vec<Failure>,
    pub gc: Option<GcReport>,
}

impl InstallReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, target: impl Into<String>, e: InstallError) {
        let target = target.into();
        error!(%target, error = %e, "install failed");
        self.failed.push(Failure { target, kind: e.kind(), error: e.to_string() });
    }
}

pub struct Installer<S: Signer, P: Policy> {
    config: InstallConfig,
    esp: Esp,
    signer: S,
    policy: P,
    stub: Vec<u8>,
}

impl Installer<SbsignSigner, TrivialPolicy> {
    pub fn from_config(config: InstallConfig) -> Result<Self> {
        let signer = SbsignSigner::new(&config.private_key, &config.public_key)?;
        let policy = TrivialPolicy { allowed_kernel_cmdline_items: config.allowed_kernel_cmdline_items.clone() };
        Self::new(config, signer, policy)
    }
}

impl<S: Signer, P: Policy> Installer<S, P> {
    pub fn new(config: InstallConfig, signer: S, policy: P) -> Result<Self> {
        let esp = Esp::open(&config.esp)?;
        let stub = fs::read(&config.stub).map_err(|e| InstallError::MalformedStub {
            path: config.stub.clone(),
            reason: e.to_string(),
        })?;
        uki::validate_stub(&stub, &config.stub)?;
        Ok(Self { config, esp, signer, policy, stub })
    }

    /// Only a locked ESP or an empty link list fails the whole run;
    /// everything else ends up in the report.
    pub fn install(&self, links: &[PathBuf]) -> Result<InstallReport> {
        let _lock = EspLock::acquire(&self.esp)?;
        let mut report = InstallReport::default();

        let mut parsed = Vec::with_capacity(links.len());
        for path in links {
            match GenerationLink::from_path(path) {
                Ok(link) => parsed.push(link),
                Err(e) => report.fail(path.display().to_string(), e),
            }
        }
        let numbers: Vec<u64> = parsed.iter().map(|l| l.number).collect();
        let retained = select_retained(parsed, self.config.configuration_limit);
        if retained.is_empty() {
            return Err(InstallError::Config("no usable generation links given".into()));
        }
        info!(
            generations = ?retained.iter().map(|l| l.number).collect::<Vec<_>>(),
            "retaining"
        );

        let mut retention = Retention::new(retained.iter().map(|l| l.number));
        let mut newest_system = None;

        for link in &retained {
            let generations = match Generation::load(link) {
                Ok(generations) => generations,
                Err(e) => {
                    report.fail(format!("generation {}", link.number), e);
                    continue;
                }
            };
            for generation in generations {
                if newest_system.is_none() && generation.id.specialisation.is_none() {
                    newest_system = Some(generation.boot.system.clone());
                }
                match self.install_generation(&generation) {
                    Ok(true) => {
                        info!(generation = %generation.id, "installed");
                        report.installed.push(generation.id.to_string());
                    }
                    Ok(false) => report.unchanged.push(generation.id.to_string()),
                    Err(InstallError::MissingStorePath(path)) => {
                        warn!(generation = %generation.id, path = %path.display(), "store path gone, dropping entry");
                        report.dropped.push(generation.id.to_string());
                        retention.drop_id(generation.id);
                    }
                    Err(e) => report.fail(generation.id.to_string(), e),
                }
            }
        }

        self.install_loader(newest_system.as_deref(), &mut report);

        let cut_off: Vec<u64> = numbers
            .into_iter()
            .filter(|n| !retained.iter().any(|l| l.number == *n))
            .collect();
        match backfill_retention(&self.esp, &mut retention, &cut_off) {
            Ok(kept) => report.kept = kept,
            Err(e) => {
                // Without knowing what is on the ESP, removing anything is unsafe.
                report.fail("garbage collection", e);
                return Ok(report);
            }
        }

        match collect_garbage(&self.esp, &retention) {
            Ok(gc) => report.gc = Some(gc),
            Err(e) => report.fail("garbage collection", e),
        }
        Ok(report)
    }

    /// Returns whether anything on the ESP changed.
    fn install_generation(&self, generation: &Generation) -> Result<bool> {
        generation.boot.validate(&self.config.store_dir, &generation.origin)?;
        uki::check_stub_machine(&self.stub, &self.config.stub, &generation.boot.system)?;
        let params = StubParameters::new(generation, &self.config.stub)?;
        self.policy.trusted_stub_parameters(&params)?;

        let kernel = read_store_file(&params.kernel_store_path)?;
        let signed_kernel = self.signer.sign_bytes(&kernel, &params.kernel_store_path)?;
        let initrd = self.read_initrd(generation, &params.initrd_store_path)?;

        let kernel_artifact = EspArtifact::new(&params.id, ArtifactKind::Kernel, artifact_digest(&signed_kernel));
        let initrd_artifact = EspArtifact::new(&params.id, ArtifactKind::Initrd, artifact_digest(&initrd));
        let config = params.embedded_config(&kernel_artifact, &initrd_artifact);

        let uki_path = params.id.uki_path();
        let unsigned = uki::assemble(&self.stub, &self.config.stub, &config)?;
        let signed_uki = self.signer.sign_bytes(&unsigned, Path::new(&uki_path))?;

        // Artifacts before the UKI that references them.
        let mut changed = self.esp.write_if_changed(&kernel_artifact.path, &signed_kernel)?;
        changed |= self.esp.write_if_changed(&initrd_artifact.path, &initrd)?;
        changed |= self.esp.write_if_changed(&uki_path, &signed_uki)?;
        Ok(changed)
    }

    /// The store initrd, with secrets appended when the bootspec names an
    /// `initrdSecrets` script.
    fn read_initrd(&self, generation: &Generation, initrd: &Path) -> Result<Vec<u8>> {
        let Some(script) = &generation.boot.initrd_secrets else {
            return read_store_file(initrd);
        };
        let context = format!("append initrd secrets with {}", script.display());
        let scratch = tempfile::NamedTempFile::new().map_err(InstallError::io(context.clone()))?;
        fs::copy(initrd, scratch.path()).map_err(InstallError::io(context.clone()))?;
        let status = Command::new(script)
            .arg(scratch.path())
            .status()
            .map_err(InstallError::io(context.clone()))?;
        if !status.success() {
            return Err(InstallError::Io {
                context,
                source: std::io::Error::other(format!("exited with {status}")),
            });
        }
        fs::read(scratch.path()).map_err(InstallError::io(context))
    }

    fn install_loader(&self, system: Option<&str>, report: &mut InstallReport) {
        if let Some(source) = &self.config.systemd_boot {
            let result = system
                .and_then(Architecture::from_nix_system)
                .ok_or_else(|| InstallError::Config(format!("no EFI architecture for system {system:?}")))
                .and_then(|arch| install_systemd_boot(&self.esp, &self.signer, source, arch));
            if let Err(e) = result {
                report.fail("systemd-boot", e);
            }
        }
        if let Some(loader) = &self.config.loader {
            if let Err(e) = write_loader_conf(&self.esp, loader) {
                report.fail("loader.conf", e);
            }
        }
    }
}

fn read_store_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InstallError::MissingStorePath(path.to_path_buf()),
        _ => InstallError::io(format!("read {}", path.display()))(e),
    })
}

/// Newest first, one link per number, at most `limit` numbers.
pub fn select_retained(mut links: Vec<GenerationLink>, limit: Option<usize>) -> Vec<GenerationLink> {
    links.sort_by(|a, b| b.number.cmp(&a.number));
    links.dedup_by_key(|l| l.number);
    if let Some(limit) = limit {
        links.truncate(limit);
    }
    links
}
