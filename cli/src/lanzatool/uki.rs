// cli/src/lanzatool/uki.rs: stub parameters and UKI assembly
//
// The UKI is the lanzaboote stub with six sections appended. Kernel and
// initrd are referenced by ESP path and digest, never embedded.

use std::path::{Path, PathBuf};

use lanzaboote_shared::layout::{to_uefi_path, Architecture};
use lanzaboote_shared::pe::{append_sections, PeImage};
use lanzaboote_shared::{ArtifactKind, Digest, EmbeddedConfig, GenerationId};

use super::error::{InstallError, Result};
use super::generation::Generation;

/// Everything a signature over one boot entry vouches for, known before
/// anything is read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubParameters {
    pub id: GenerationId,
    pub stub_path: PathBuf,
    pub kernel_store_path: PathBuf,
    pub initrd_store_path: PathBuf,
    pub kernel_cmdline: Vec<String>,
    pub os_release: String,
}

/// An artifact placed on the ESP, as the stub will find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspArtifact {
    pub kind: ArtifactKind,
    /// Relative to the ESP root, `/` separated.
    pub path: String,
    pub digest: Digest,
}

impl EspArtifact {
    pub fn new(id: &GenerationId, kind: ArtifactKind, digest: Digest) -> Self {
        Self { kind, path: id.artifact_path(kind, &digest), digest }
    }
}

impl StubParameters {
    pub fn new(generation: &Generation, stub_path: &Path) -> Result<Self> {
        Ok(Self {
            id: generation.id.clone(),
            stub_path: stub_path.to_path_buf(),
            kernel_store_path: generation.boot.kernel.clone(),
            initrd_store_path: generation.boot.initrd(&generation.origin)?.to_path_buf(),
            kernel_cmdline: kernel_cmdline(&generation.boot.init, &generation.boot.kernel_params),
            os_release: os_release(generation),
        })
    }

    pub fn embedded_config(&self, kernel: &EspArtifact, initrd: &EspArtifact) -> EmbeddedConfig {
        EmbeddedConfig {
            os_release: self.os_release.clone(),
            cmdline: self.kernel_cmdline.join(" "),
            kernel_path: to_uefi_path(&kernel.path),
            kernel_digest: kernel.digest,
            initrd_path: to_uefi_path(&initrd.path),
            initrd_digest: initrd.digest,
        }
    }
}

/// `init=<init>` first, then the bootspec's parameters in order.
pub fn kernel_cmdline(init: &Path, params: &[String]) -> Vec<String> {
    let mut cmdline = Vec::with_capacity(params.len() + 1);
    cmdline.push(format!("init={}", init.display()));
    cmdline.extend(params.iter().cloned());
    cmdline
}

/// os-release(5) text for the `.osrel` section. systemd-boot takes the
/// entry title from PRETTY_NAME and the version from VERSION_ID.
pub fn os_release(generation: &Generation) -> String {
    format!(
        "ID=nixos\nPRETTY_NAME={}\nVERSION_ID={}\n",
        quote(&generation.pretty_name()),
        quote(&generation.version_id())
    )
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Read back a key from os-release text, undoing [`quote`].
pub fn os_release_value(text: &str, key: &str) -> Option<String> {
    let raw = text.lines().find_map(|line| line.strip_prefix(key)?.strip_prefix('='))?;
    let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) else {
        return Some(raw.to_string());
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Check the stub once per run before any generation is processed.
pub fn validate_stub(stub: &[u8], stub_path: &Path) -> Result<()> {
    let pe = PeImage::parse(stub).map_err(|e| malformed(stub_path, e.to_string()))?;
    if !pe.is_efi_application() {
        return Err(malformed(stub_path, format!("subsystem {} is not an EFI application", pe.subsystem())));
    }
    Ok(())
}

/// The stub must be built for the machine the generation's `system` runs on.
pub fn check_stub_machine(stub: &[u8], stub_path: &Path, system: &str) -> Result<()> {
    let pe = PeImage::parse(stub).map_err(|e| malformed(stub_path, e.to_string()))?;
    let arch = Architecture::from_nix_system(system)
        .ok_or_else(|| malformed(stub_path, format!("no EFI architecture for system {system}")))?;
    if pe.machine() != arch.pe_machine() {
        return Err(malformed(
            stub_path,
            format!("machine {:#06x} cannot boot {system}", pe.machine()),
        ));
    }
    Ok(())
}

/// Unsigned UKI: stub plus embedded configuration. Any signature already on
/// the stub is dropped.
pub fn assemble(stub: &[u8], stub_path: &Path, config: &EmbeddedConfig) -> Result<Vec<u8>> {
    validate_stub(stub, stub_path)?;
    append_sections(stub, &config.sections()).map_err(|e| malformed(stub_path, e.to_string()))
}

fn malformed(path: &Path, reason: String) -> InstallError {
    InstallError::MalformedStub { path: path.to_path_buf(), reason }
}
