// cli/src/lanzatool/error.rs: installer error taxonomy

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("malformed bootspec {path}: {reason}")]
    MalformedBootspec { path: PathBuf, reason: String },

    #[error("store path {0} does not exist")]
    MissingStorePath(PathBuf),

    #[error("refusing to sign untrusted parameters: {0}")]
    UntrustedParameters(String),

    #[error("malformed stub {path}: {reason}")]
    MalformedStub { path: PathBuf, reason: String },

    #[error("signing {path} failed: {reason}")]
    SigningFailure { path: PathBuf, reason: String },

    #[error("cannot write {path}: {source}")]
    EspWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ESP at {0} is locked by another lzbt run")]
    EspLocked(PathBuf),

    #[error("configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = InstallError> = std::result::Result<T, E>;

impl InstallError {
    pub fn malformed_bootspec(path: &Path, reason: impl Into<String>) -> Self {
        InstallError::MalformedBootspec { path: path.to_path_buf(), reason: reason.into() }
    }

    pub fn esp_write(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| InstallError::EspWriteFailure { path: path.to_path_buf(), source }
    }

    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| InstallError::Io { context, source }
    }

    /// Short machine-readable tag used in JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::MalformedBootspec { .. } => "malformed-bootspec",
            InstallError::MissingStorePath(_) => "missing-store-path",
            InstallError::UntrustedParameters(_) => "untrusted-parameters",
            InstallError::MalformedStub { .. } => "malformed-stub",
            InstallError::SigningFailure { .. } => "signing-failure",
            InstallError::EspWriteFailure { .. } => "esp-write-failure",
            InstallError::EspLocked(_) => "esp-locked",
            InstallError::Config(_) => "config",
            InstallError::Io { .. } => "io",
        }
    }
}
