//! Stub boot flow: Start -> Locate -> Verify -> Load -> Handoff, or Abort.
//!
//! The stub drives a [`BootFlow`] and every failure becomes an [`Abort`]
//! tagged with the stage it happened in. There is no transition out of a
//! failed stage other than Abort, and no way to reach Load without passing
//! Verify.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::digest::{artifact_digest, Digest};
use crate::layout::ArtifactKind;
use crate::sections::{ConfigError, EmbeddedConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    Locate,
    Verify,
    Load,
    Handoff,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Start => Some(Stage::Locate),
            Stage::Locate => Some(Stage::Verify),
            Stage::Verify => Some(Stage::Load),
            Stage::Load => Some(Stage::Handoff),
            Stage::Handoff => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Locate => "locate",
            Stage::Verify => "verify",
            Stage::Load => "load",
            Stage::Handoff => "handoff",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure: where it happened and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort<E> {
    pub stage: Stage,
    pub reason: E,
}

impl<E: fmt::Display> fmt::Display for Abort<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boot aborted during {}: {}", self.stage, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Why the stub gave up. Firmware status codes are kept raw so this type
/// stays independent of the UEFI bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    /// Embedded configuration missing or malformed.
    Config(ConfigError),
    /// Kernel or initrd could not be opened or read.
    FileAccess { path: String, status: usize },
    /// Digest mismatch against the signed configuration.
    VerificationFailure(VerificationFailure),
    /// Firmware refused the kernel's Secure Boot signature.
    KernelRejected { status: usize },
    /// A firmware call needed to load or start the kernel failed.
    LoadFailure { operation: &'static str, status: usize },
}

impl StubError {
    /// Integrity failures, as opposed to I/O or firmware trouble.
    pub fn is_verification(&self) -> bool {
        matches!(self, StubError::VerificationFailure(_) | StubError::KernelRejected { .. })
    }
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubError::Config(e) => write!(f, "embedded configuration: {e}"),
            StubError::FileAccess { path, status } => write!(f, "cannot read {path} (status {status:#x})"),
            StubError::VerificationFailure(e) => write!(f, "{e}"),
            StubError::KernelRejected { status } => {
                write!(f, "firmware rejected the kernel signature (status {status:#x})")
            }
            StubError::LoadFailure { operation, status } => write!(f, "{operation} failed (status {status:#x})"),
        }
    }
}

const EFI_ERROR: usize = 1 << (usize::BITS - 1);
pub const STATUS_ACCESS_DENIED: usize = EFI_ERROR | 15;
pub const STATUS_SECURITY_VIOLATION: usize = EFI_ERROR | 26;

/// Classify a failed LoadImage.
pub fn load_image_failure(status: usize) -> StubError {
    match status {
        STATUS_SECURITY_VIOLATION | STATUS_ACCESS_DENIED => StubError::KernelRejected { status },
        _ => StubError::LoadFailure { operation: "LoadImage", status },
    }
}

/// LoadImage keeps the image loaded when it fails Secure Boot with
/// SECURITY_VIOLATION; the caller has to unload it. Every other failure
/// leaves nothing behind.
pub fn leaves_image_handle(status: usize) -> bool {
    status == STATUS_SECURITY_VIOLATION
}

/// Entries of `after` missing from `before`.
pub fn appeared<T: PartialEq + Copy>(before: &[T], after: &[T]) -> Vec<T> {
    after.iter().copied().filter(|h| !before.contains(h)).collect()
}

impl From<ConfigError> for StubError {
    fn from(e: ConfigError) -> Self {
        StubError::Config(e)
    }
}

impl From<VerificationFailure> for StubError {
    fn from(e: VerificationFailure) -> Self {
        StubError::VerificationFailure(e)
    }
}

/// Linear stage tracker.
#[derive(Debug)]
pub struct BootFlow {
    stage: Stage,
}

impl Default for BootFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl BootFlow {
    pub fn new() -> Self {
        Self { stage: Stage::Start }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `to`, which must be the immediate successor.
    pub fn advance(&mut self, to: Stage) -> Result<(), InvalidTransition> {
        if self.stage.next() != Some(to) {
            return Err(InvalidTransition { from: self.stage, to });
        }
        self.stage = to;
        Ok(())
    }

    pub fn abort<E>(&self, reason: E) -> Abort<E> {
        Abort { stage: self.stage, reason }
    }
}

/// A loaded artifact whose contents do not match the signed digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationFailure {
    pub artifact: ArtifactKind,
    pub expected: Digest,
    pub actual: Digest,
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} digest mismatch: expected {}, got {}",
            self.artifact, self.expected, self.actual
        )
    }
}

pub fn verify_artifact(artifact: ArtifactKind, expected: &Digest, data: &[u8]) -> Result<(), VerificationFailure> {
    let actual = artifact_digest(data);
    if actual != *expected {
        return Err(VerificationFailure { artifact, expected: *expected, actual });
    }
    Ok(())
}

/// Both artifacts must match; kernel is checked first.
pub fn verify_artifacts(config: &EmbeddedConfig, kernel: &[u8], initrd: &[u8]) -> Result<(), VerificationFailure> {
    verify_artifact(ArtifactKind::Kernel, &config.kernel_digest, kernel)?;
    verify_artifact(ArtifactKind::Initrd, &config.initrd_digest, initrd)
}
