//! ESP layout: the naming contract between lzbt and the stub.
//!
//! Paths are relative to the ESP root and use `/`. The stub receives them in
//! UEFI form (`\EFI\nixos\...`) through its embedded configuration.
//!
//!   EFI/Linux/nixos-generation-<N>[-specialisation-<S>].efi          UKI
//!   EFI/nixos/generation-<N>[-specialisation-<S>]-<kind>-<h16>.efi  artifact
//!   EFI/nixos/.lzbt.lock                                             run lock
//!   <dir>/.lzbt-*                                                    temp files

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::digest::Digest;
use crate::pe::{COFF_MACHINE_ARM64, COFF_MACHINE_X86_64};

pub const LINUX_DIR: &str = "EFI/Linux";
pub const ARTIFACT_DIR: &str = "EFI/nixos";
pub const SYSTEMD_DIR: &str = "EFI/systemd";
pub const FALLBACK_DIR: &str = "EFI/BOOT";
pub const LOADER_CONF: &str = "loader/loader.conf";
pub const LOCK_FILE: &str = "EFI/nixos/.lzbt.lock";
pub const TEMP_PREFIX: &str = ".lzbt-";

const UKI_PREFIX: &str = "nixos-generation-";
const ARTIFACT_PREFIX: &str = "generation-";
const SPECIALISATION_INFIX: &str = "-specialisation-";
const EFI_SUFFIX: &str = ".efi";
const SHORT_HASH_LEN: usize = 16;

/// Files a generation references besides its UKI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Kernel,
    Initrd,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::Initrd => "initrd",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generation number plus an optional specialisation name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId {
    pub number: u64,
    pub specialisation: Option<String>,
}

impl GenerationId {
    pub fn new(number: u64) -> Self {
        Self { number, specialisation: None }
    }

    /// Returns `None` if `name` is not a valid specialisation name.
    pub fn specialised(number: u64, name: &str) -> Option<Self> {
        valid_specialisation_name(name).then(|| Self {
            number,
            specialisation: Some(String::from(name)),
        })
    }

    fn suffix(&self) -> String {
        match &self.specialisation {
            Some(s) => format!("{}{SPECIALISATION_INFIX}{s}", self.number),
            None => format!("{}", self.number),
        }
    }

    /// File stem of the UKI, e.g. `nixos-generation-42`.
    pub fn stem(&self) -> String {
        format!("{UKI_PREFIX}{}", self.suffix())
    }

    pub fn uki_path(&self) -> String {
        format!("{LINUX_DIR}/{}{EFI_SUFFIX}", self.stem())
    }

    /// Content-addressed artifact path. A re-signed kernel gets a new name,
    /// so the UKI that references the old file keeps booting until replaced.
    pub fn artifact_path(&self, kind: ArtifactKind, digest: &Digest) -> String {
        format!(
            "{ARTIFACT_DIR}/{ARTIFACT_PREFIX}{}-{}-{}{EFI_SUFFIX}",
            self.suffix(),
            kind.as_str(),
            digest.short_hex(SHORT_HASH_LEN)
        )
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specialisation {
            Some(s) => write!(f, "generation {} (specialisation {s})", self.number),
            None => write!(f, "generation {}", self.number),
        }
    }
}

/// Specialisation names end up in file names, so only a safe subset is allowed.
pub fn valid_specialisation_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// Inverse of [`GenerationId::stem`] + `.efi`, for UKIs found on the ESP.
pub fn parse_uki_file_name(name: &str) -> Option<GenerationId> {
    let rest = name.strip_prefix(UKI_PREFIX)?.strip_suffix(EFI_SUFFIX)?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let number: u64 = rest[..digits].parse().ok()?;
    let id = match &rest[digits..] {
        "" => GenerationId::new(number),
        tail => GenerationId::specialised(number, tail.strip_prefix(SPECIALISATION_INFIX)?)?,
    };
    // Only the exact name lzbt writes, so `-042` is not taken for `-42`.
    (id.stem() == name[..name.len() - EFI_SUFFIX.len()]).then_some(id)
}

/// True for kernel/initrd files lzbt owns in `EFI/nixos`.
pub fn is_managed_artifact(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(EFI_SUFFIX)
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

/// `EFI/nixos/x.efi` -> `\EFI\nixos\x.efi`
pub fn to_uefi_path(relative: &str) -> String {
    let mut out = String::with_capacity(relative.len() + 1);
    for component in relative.split('/').filter(|c| !c.is_empty()) {
        out.push('\\');
        out.push_str(component);
    }
    out
}

/// `\EFI\nixos\x.efi` -> `EFI/nixos/x.efi`. Rejects anything that could
/// leave the ESP root or smuggle separators: relative paths, empty, `.` and
/// `..` components, forward slashes and NULs.
pub fn from_uefi_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix('\\')?;
    let mut components: Vec<&str> = Vec::new();
    for c in rest.split('\\') {
        if c.is_empty() || c == "." || c == ".." || c.contains(|ch| ch == '/' || ch == '\0') {
            return None;
        }
        components.push(c);
    }
    if components.is_empty() {
        return None;
    }
    Some(components.join("/"))
}

/// UEFI architecture suffix for boot loader file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X64,
    Aa64,
}

impl Architecture {
    /// From a Nix system double like `x86_64-linux`.
    pub fn from_nix_system(system: &str) -> Option<Self> {
        match system.split('-').next()? {
            "x86_64" => Some(Architecture::X64),
            "aarch64" => Some(Architecture::Aa64),
            _ => None,
        }
    }

    /// COFF machine type of EFI binaries for this architecture.
    pub fn pe_machine(&self) -> u16 {
        match self {
            Architecture::X64 => COFF_MACHINE_X86_64,
            Architecture::Aa64 => COFF_MACHINE_ARM64,
        }
    }

    pub fn efi_suffix(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::Aa64 => "aa64",
        }
    }

    pub fn systemd_boot_path(&self) -> String {
        format!("{SYSTEMD_DIR}/systemd-boot{}{EFI_SUFFIX}", self.efi_suffix())
    }

    /// Removable-media fallback path firmware boots without a boot entry.
    pub fn fallback_path(&self) -> String {
        format!("{FALLBACK_DIR}/BOOT{}.EFI", self.efi_suffix().to_ascii_uppercase())
    }
}
