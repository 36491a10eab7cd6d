//! Serves the verified initrd to the kernel over LoadFile2.
//!
//! Linux's EFI stub locates a handle whose device path is the
//! LINUX_EFI_INITRD_MEDIA vendor node and calls LoadFile2 on it. We install
//! both protocols on a fresh handle and hand out the buffer that already
//! passed verification, so the kernel never reads the ESP itself.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ffi::c_void;

use lanzaboote_shared::StubError;
use uefi::prelude::*;
use uefi::proto::device_path::build::{self, DevicePathBuilder};
use uefi::proto::device_path::DevicePath;
use uefi::{guid, Guid, Identify};

const LOAD_FILE2_GUID: Guid = guid!("4006c0c1-fcb3-403e-996d-4a6c8724e06d");
const LINUX_EFI_INITRD_MEDIA_GUID: Guid = guid!("5568e427-68fc-4f3d-ac74-ca555231cc68");

/// Vendor media node with the initrd media GUID, then an end node. The
/// kernel's EFI stub looks for LoadFile2 on exactly this path.
fn initrd_device_path() -> Result<Vec<u8>, build::BuildError> {
    let mut path = Vec::new();
    DevicePathBuilder::with_vec(&mut path)
        .push(&build::media::Vendor { vendor_guid: LINUX_EFI_INITRD_MEDIA_GUID, vendor_defined_data: &[] })?
        .finalize()?;
    Ok(path)
}

#[repr(C)]
struct LoadFile2 {
    load_file: unsafe extern "efiapi" fn(
        this: *mut LoadFile2,
        file_path: *const c_void,
        boot_policy: u8,
        buffer_size: *mut usize,
        buffer: *mut c_void,
    ) -> Status,
}

/// Protocol first so firmware's interface pointer is also ours.
#[repr(C)]
struct Interface {
    protocol: LoadFile2,
    initrd: Vec<u8>,
}

unsafe extern "efiapi" fn load_file(
    this: *mut LoadFile2,
    _file_path: *const c_void,
    boot_policy: u8,
    buffer_size: *mut usize,
    buffer: *mut c_void,
) -> Status {
    if this.is_null() || buffer_size.is_null() {
        return Status::INVALID_PARAMETER;
    }
    if boot_policy != 0 {
        return Status::UNSUPPORTED;
    }
    // SAFETY: `this` is the interface pointer we installed, which points at
    // an `Interface` kept alive by `InitrdLoader`.
    let initrd = unsafe { &(*this.cast::<Interface>()).initrd };
    // SAFETY: the caller passes a valid size pointer, checked non-null above.
    let available = unsafe { *buffer_size };
    if buffer.is_null() || available < initrd.len() {
        unsafe { *buffer_size = initrd.len() };
        return Status::BUFFER_TOO_SMALL;
    }
    // SAFETY: the caller's buffer holds at least `available` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(initrd.as_ptr(), buffer.cast::<u8>(), initrd.len());
        *buffer_size = initrd.len();
    }
    Status::SUCCESS
}

/// Installed initrd protocols; uninstalled on drop.
pub struct InitrdLoader<'a> {
    bs: &'a BootServices,
    handle: Handle,
    interface: Box<Interface>,
    /// Installed as the handle's device path; the heap buffer never moves.
    device_path: Vec<u8>,
}

impl<'a> InitrdLoader<'a> {
    pub fn install(bs: &'a BootServices, initrd: Vec<u8>) -> Result<Self, StubError> {
        let mut interface = Box::new(Interface { protocol: LoadFile2 { load_file }, initrd });
        let failure = |operation: &'static str, e: uefi::Error| StubError::LoadFailure { operation, status: e.status().0 };
        let mut device_path = initrd_device_path().map_err(|_| StubError::LoadFailure {
            operation: "build initrd device path",
            status: Status::INVALID_PARAMETER.0,
        })?;
        let path_ptr = device_path.as_mut_ptr().cast::<c_void>();

        // SAFETY: the buffer lives in the returned loader until `drop`
        // uninstalls it, and nothing writes through it.
        let handle = unsafe { bs.install_protocol_interface(None, &DevicePath::GUID, path_ptr) }
            .map_err(|e| failure("install initrd device path", e))?;

        let interface_ptr = (&mut *interface as *mut Interface).cast::<c_void>();
        // SAFETY: the box stays alive and in place until `drop` uninstalls it.
        let installed = unsafe { bs.install_protocol_interface(Some(handle), &LOAD_FILE2_GUID, interface_ptr) };
        if let Err(e) = installed {
            // SAFETY: undoing the install above with the same pointer.
            let _ = unsafe { bs.uninstall_protocol_interface(handle, &DevicePath::GUID, path_ptr) };
            return Err(failure("install LoadFile2", e));
        }
        log::debug!("initrd served over LoadFile2 ({} bytes)", interface.initrd.len());
        Ok(Self { bs, handle, interface, device_path })
    }
}

impl Drop for InitrdLoader<'_> {
    fn drop(&mut self) {
        let interface_ptr = (&mut *self.interface as *mut Interface).cast::<c_void>();
        let path_ptr = self.device_path.as_mut_ptr().cast::<c_void>();
        // SAFETY: same handle and pointers that were installed.
        unsafe {
            if self.bs.uninstall_protocol_interface(self.handle, &LOAD_FILE2_GUID, interface_ptr).is_err() {
                log::warn!("cannot uninstall LoadFile2 from the initrd handle");
            }
            if self.bs.uninstall_protocol_interface(self.handle, &DevicePath::GUID, path_ptr).is_err() {
                log::warn!("cannot uninstall the initrd device path");
            }
        }
    }
}
