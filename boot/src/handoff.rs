//! Loading and starting the verified kernel.
//!
//! The kernel goes through LoadImage so firmware checks its Secure Boot
//! signature as well; `lzbt` signed it before computing the digest.

use alloc::vec::Vec;

use lanzaboote_shared::boot::{appeared, leaves_image_handle, load_image_failure};
use lanzaboote_shared::StubError;
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;
use uefi::table::boot::{LoadImageSource, SearchType};
use uefi::{CString16, Identify};

/// A loaded kernel image. Unloaded on drop unless it never returns.
pub struct KernelImage<'a> {
    bs: &'a BootServices,
    handle: Handle,
    /// Load options point into this buffer until the kernel exits.
    cmdline: CString16,
}

impl<'a> KernelImage<'a> {
    pub fn load(bs: &'a BootServices, parent: Handle, kernel: &[u8], cmdline: &str) -> Result<Self, StubError> {
        let cmdline = CString16::try_from(cmdline).map_err(|_| StubError::LoadFailure {
            operation: "encode kernel command line",
            status: Status::INVALID_PARAMETER.0,
        })?;
        let options_size = u32::try_from(cmdline.num_bytes()).map_err(|_| StubError::LoadFailure {
            operation: "encode kernel command line",
            status: Status::BAD_BUFFER_SIZE.0,
        })?;

        let before = loaded_images(bs);
        let handle = bs
            .load_image(parent, LoadImageSource::FromBuffer { buffer: kernel, file_path: None })
            .map_err(|e| {
                let status = e.status().0;
                if leaves_image_handle(status) {
                    unload_new_images(bs, &before);
                }
                load_image_failure(status)
            })?;
        let image = KernelImage { bs, handle, cmdline };

        {
            let mut loaded = bs
                .open_protocol_exclusive::<LoadedImage>(handle)
                .map_err(|e| StubError::LoadFailure { operation: "open kernel LoadedImage", status: e.status().0 })?;
            // SAFETY: the options buffer lives in `image` and outlives the
            // kernel's use of it.
            unsafe {
                loaded.set_load_options(image.cmdline.as_ptr() as *const u8, options_size);
            }
        }
        Ok(image)
    }

    /// Runs the kernel. Returns only if it exits.
    pub fn start(&self) -> Status {
        match self.bs.start_image(self.handle) {
            Ok(()) => Status::SUCCESS,
            Err(e) => e.status(),
        }
    }
}

fn loaded_images(bs: &BootServices) -> Vec<Handle> {
    bs.locate_handle_buffer(SearchType::ByProtocol(&LoadedImage::GUID))
        .map(|handles| handles.to_vec())
        .unwrap_or_default()
}

/// The firmware does not hand back the handle of a rejected image, so find
/// it by what appeared since `before`.
fn unload_new_images(bs: &BootServices, before: &[Handle]) {
    for handle in appeared(before, &loaded_images(bs)) {
        match bs.unload_image(handle) {
            Ok(()) => log::debug!("unloaded rejected kernel image"),
            Err(e) => log::warn!("cannot unload rejected kernel image: {:?}", e.status()),
        }
    }
}

impl Drop for KernelImage<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bs.unload_image(self.handle) {
            log::warn!("cannot unload kernel image: {:?}", e.status());
        }
    }
}
