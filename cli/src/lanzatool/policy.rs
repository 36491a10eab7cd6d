// cli/src/lanzatool/policy.rs: what lzbt is willing to sign

use std::collections::HashSet;
use std::path::Path;

use tracing::trace;

use super::error::{InstallError, Result};
use super::uki::StubParameters;

pub trait Policy {
    /// Is this store path trusted to be signed for?
    fn trusted_store_path(&self, store_path: &Path) -> bool;

    /// Are these stub parameters trusted to be signed?
    fn trusted_stub_parameters(&self, parameters: &StubParameters) -> Result<()>;
}

/// Trusts whatever exists in the local store, optionally restricting the
/// kernel command line to an allow-list.
///
/// Kernel and initrd ESP paths need no check: the stub only boots files
/// whose digest matches the one signed here.
#[derive(Debug, Clone, Default)]
pub struct TrivialPolicy {
    pub allowed_kernel_cmdline_items: Option<HashSet<String>>,
}

impl Policy for TrivialPolicy {
    fn trusted_store_path(&self, store_path: &Path) -> bool {
        let exists = store_path.exists();
        trace!(path = %store_path.display(), exists, "trusted store path");
        exists
    }

    fn trusted_stub_parameters(&self, parameters: &StubParameters) -> Result<()> {
        for path in [
            &parameters.stub_path,
            &parameters.kernel_store_path,
            &parameters.initrd_store_path,
        ] {
            if !self.trusted_store_path(path) {
                return Err(InstallError::UntrustedParameters(format!(
                    "{} is not in the local store",
                    path.display()
                )));
            }
        }

        if let Some(allowed) = &self.allowed_kernel_cmdline_items {
            // init= is generated from the bootspec, not user supplied.
            for item in parameters.kernel_cmdline.iter().skip(1) {
                if !allowed.contains(item) {
                    trace!(%item, "untrusted command line item");
                    return Err(InstallError::UntrustedParameters(format!(
                        "kernel command line item {item:?} is not allowed"
                    )));
                }
            }
        }
        Ok(())
    }
}
