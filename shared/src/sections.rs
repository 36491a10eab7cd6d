//! Configuration lzbt embeds into the stub as PE sections.
//!
//! The stub is built once; everything generation-specific is appended by
//! lzbt and then covered by the Secure Boot signature over the whole image.

use alloc::string::String;
use core::fmt;

use crate::digest::Digest;
use crate::layout::{from_uefi_path, ArtifactKind};
use crate::pe::{PeError, PeImage};

pub const OS_RELEASE: &str = ".osrel";
pub const CMDLINE: &str = ".cmdline";
pub const KERNEL_PATH: &str = ".kernelp";
pub const INITRD_PATH: &str = ".initrdp";
pub const KERNEL_DIGEST: &str = ".kernelh";
pub const INITRD_DIGEST: &str = ".initrdh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Image(PeError),
    MissingSection(&'static str),
    NotUtf8(&'static str),
    BadDigest(&'static str),
    UnsafePath(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Image(e) => write!(f, "unreadable image: {e}"),
            ConfigError::MissingSection(s) => write!(f, "section {s} missing, was the stub assembled by lzbt?"),
            ConfigError::NotUtf8(s) => write!(f, "section {s} is not UTF-8"),
            ConfigError::BadDigest(s) => write!(f, "section {s} does not hold a 32-byte digest"),
            ConfigError::UnsafePath(s) => write!(f, "section {s} holds a path outside the ESP root"),
        }
    }
}

impl From<PeError> for ConfigError {
    fn from(e: PeError) -> Self {
        ConfigError::Image(e)
    }
}

/// Generation-specific stub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedConfig {
    pub os_release: String,
    /// Kernel command line, UTF-8, space separated.
    pub cmdline: String,
    /// `\EFI\nixos\...` path of the signed kernel, relative to the stub's volume.
    pub kernel_path: String,
    pub kernel_digest: Digest,
    pub initrd_path: String,
    pub initrd_digest: Digest,
}

impl EmbeddedConfig {
    /// Section name/contents pairs, in the order lzbt appends them.
    pub fn sections(&self) -> [(&'static str, &[u8]); 6] {
        [
            (OS_RELEASE, self.os_release.as_bytes()),
            (CMDLINE, self.cmdline.as_bytes()),
            (INITRD_PATH, self.initrd_path.as_bytes()),
            (KERNEL_PATH, self.kernel_path.as_bytes()),
            (INITRD_DIGEST, self.initrd_digest.as_bytes()),
            (KERNEL_DIGEST, self.kernel_digest.as_bytes()),
        ]
    }

    /// Decode from an assembled image. Paths that are not absolute UEFI
    /// paths below the volume root are rejected here, before any file is
    /// opened.
    pub fn from_image(pe: &PeImage<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            os_release: string_section(pe, OS_RELEASE)?,
            cmdline: string_section(pe, CMDLINE)?,
            kernel_path: path_section(pe, KERNEL_PATH)?,
            kernel_digest: digest_section(pe, KERNEL_DIGEST)?,
            initrd_path: path_section(pe, INITRD_PATH)?,
            initrd_digest: digest_section(pe, INITRD_DIGEST)?,
        })
    }

    pub fn artifact(&self, kind: ArtifactKind) -> (&str, &Digest) {
        match kind {
            ArtifactKind::Kernel => (&self.kernel_path, &self.kernel_digest),
            ArtifactKind::Initrd => (&self.initrd_path, &self.initrd_digest),
        }
    }
}

fn raw_section<'a>(pe: &PeImage<'a>, name: &'static str) -> Result<&'a [u8], ConfigError> {
    pe.section_data(name)?.ok_or(ConfigError::MissingSection(name))
}

fn string_section(pe: &PeImage<'_>, name: &'static str) -> Result<String, ConfigError> {
    let raw = raw_section(pe, name)?;
    let text = core::str::from_utf8(raw).map_err(|_| ConfigError::NotUtf8(name))?;
    Ok(String::from(text.trim_end_matches('\0')))
}

fn path_section(pe: &PeImage<'_>, name: &'static str) -> Result<String, ConfigError> {
    let path = string_section(pe, name)?;
    from_uefi_path(&path).ok_or(ConfigError::UnsafePath(name))?;
    Ok(path)
}

fn digest_section(pe: &PeImage<'_>, name: &'static str) -> Result<Digest, ConfigError> {
    Digest::from_slice(raw_section(pe, name)?).ok_or(ConfigError::BadDigest(name))
}
