// cli/src/lanzatool/signer.rs: Authenticode signing through sbsign

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::error::{InstallError, Result};

pub trait Signer {
    /// Sign the PE image at `input`, writing the signed image to `output`.
    fn sign(&self, input: &Path, output: &Path) -> Result<()>;

    /// Sign an in-memory image. `label` names the image in errors.
    fn sign_bytes(&self, image: &[u8], label: &Path) -> Result<Vec<u8>> {
        let failure = |reason: String| InstallError::SigningFailure { path: label.to_path_buf(), reason };
        let scratch = tempfile::Builder::new()
            .prefix("lzbt-sign")
            .tempdir()
            .map_err(|e| failure(format!("scratch directory: {e}")))?;
        let input = scratch.path().join("unsigned.efi");
        let output = scratch.path().join("signed.efi");
        fs::write(&input, image).map_err(|e| failure(format!("write {}: {e}", input.display())))?;
        self.sign(&input, &output)?;
        fs::read(&output).map_err(|e| failure(format!("signer produced no output: {e}")))
    }
}

/// Signs with `sbsign --key <private> --cert <public>`.
#[derive(Debug, Clone)]
pub struct SbsignSigner {
    program: PathBuf,
    private_key: PathBuf,
    public_key: PathBuf,
}

impl SbsignSigner {
    /// Fails up front if either key file is unreadable.
    pub fn new(private_key: &Path, public_key: &Path) -> Result<Self> {
        for key in [private_key, public_key] {
            if let Err(e) = fs::metadata(key) {
                return Err(InstallError::SigningFailure {
                    path: key.to_path_buf(),
                    reason: format!("key material unavailable: {e}"),
                });
            }
        }
        Ok(Self {
            program: PathBuf::from("sbsign"),
            private_key: private_key.to_path_buf(),
            public_key: public_key.to_path_buf(),
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Signer for SbsignSigner {
    fn sign(&self, input: &Path, output: &Path) -> Result<()> {
        let failure = |reason: String| InstallError::SigningFailure { path: input.to_path_buf(), reason };
        debug!(input = %input.display(), "sbsign");

        let result = Command::new(&self.program)
            .arg("--key")
            .arg(&self.private_key)
            .arg("--cert")
            .arg(&self.public_key)
            .arg("--output")
            .arg(output)
            .arg(input)
            .output()
            .map_err(|e| failure(format!("cannot run {}: {e}", self.program.display())))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(failure(format!("{} exited with {}: {}", self.program.display(), result.status, stderr.trim())));
        }
        if !output.is_file() {
            return Err(failure(format!("{} wrote no output", self.program.display())));
        }
        Ok(())
    }
}
