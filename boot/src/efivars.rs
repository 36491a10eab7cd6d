//! systemd loader interface variables the stub exports.

use alloc::format;
use alloc::string::{String, ToString};

use bitflags::bitflags;
use lanzaboote_shared::measure::{PCR_KERNEL_IMAGE, PCR_KERNEL_PARAMETERS};
use log::warn;
use uefi::prelude::*;
use uefi::proto::device_path::media::PartitionSignature;
use uefi::proto::device_path::{DevicePath, DevicePathNodeEnum};
use uefi::proto::loaded_image::LoadedImage;
use uefi::table::boot::{OpenProtocolAttributes, OpenProtocolParams};
use uefi::table::runtime::{VariableAttributes, VariableVendor};
use uefi::{cstr16, guid, CStr16, CString16};

const LOADER_VENDOR: VariableVendor = VariableVendor(guid!("4a67b082-0a4c-41cf-b6c7-440b29bb8c4f"));

bitflags! {
    /// `StubFeatures`, as defined by systemd-stub.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StubFeatures: u64 {
        const REPORT_BOOT_PARTITION = 1 << 0;
        const PICK_UP_CREDENTIALS = 1 << 1;
        const PICK_UP_SYSEXTS = 1 << 2;
    }
}

const SUPPORTED: StubFeatures = StubFeatures::REPORT_BOOT_PARTITION
    .union(StubFeatures::PICK_UP_CREDENTIALS)
    .union(StubFeatures::PICK_UP_SYSEXTS);

fn set(rt: &RuntimeServices, name: &CStr16, data: &[u8]) {
    let attributes = VariableAttributes::BOOTSERVICE_ACCESS | VariableAttributes::RUNTIME_ACCESS;
    if let Err(e) = rt.set_variable(name, &LOADER_VENDOR, attributes, data) {
        warn!("cannot set {}: {:?}", name, e.status());
    }
}

fn set_string(rt: &RuntimeServices, name: &CStr16, value: &str) {
    match CString16::try_from(value) {
        Ok(value) => set(rt, name, value.as_bytes()),
        Err(_) => warn!("{} value is not UCS-2", name),
    }
}

/// Best effort; a firmware that refuses variables still boots.
pub fn export(st: &SystemTable<Boot>, image: Handle) {
    let rt = st.runtime_services();
    set_string(rt, cstr16!("StubInfo"), &format!("lanzaboote {}", env!("CARGO_PKG_VERSION")));
    set(rt, cstr16!("StubFeatures"), &SUPPORTED.bits().to_le_bytes());

    // systemd-boot sets this when it started us; only fill it in otherwise.
    let name = cstr16!("LoaderDevicePartUUID");
    let already_set = match rt.get_variable(name, &LOADER_VENDOR, &mut [0u8; 0]) {
        Err(e) => e.status() != Status::NOT_FOUND,
        Ok(_) => true,
    };
    if !already_set {
        match boot_partition_uuid(st.boot_services(), image) {
            Some(uuid) => set_string(rt, name, &uuid),
            None => warn!("boot partition is not a GPT partition, LoaderDevicePartUUID left unset"),
        }
    }
}

/// Tell userspace which PCRs hold what we measured, so it can predict them.
pub fn export_pcrs(st: &SystemTable<Boot>, kernel_image: bool, kernel_parameters: bool) {
    let rt = st.runtime_services();
    if kernel_image {
        set(rt, cstr16!("StubPcrKernelImage"), &PCR_KERNEL_IMAGE.to_le_bytes());
    }
    if kernel_parameters {
        set(rt, cstr16!("StubPcrKernelParameters"), &PCR_KERNEL_PARAMETERS.to_le_bytes());
    }
}

/// GPT partition GUID of the device the stub was loaded from, uppercase as
/// systemd writes it.
fn boot_partition_uuid(bs: &BootServices, image: Handle) -> Option<String> {
    let device = {
        let loaded = bs.open_protocol_exclusive::<LoadedImage>(image).ok()?;
        loaded.device()
    };
    // SAFETY: read-only use of the device path while we hold no other
    // reference to it; GetProtocol leaves the drivers bound to it alone.
    let path = unsafe {
        bs.open_protocol::<DevicePath>(
            OpenProtocolParams { handle: device, agent: image, controller: None },
            OpenProtocolAttributes::GetProtocol,
        )
    }
    .ok()?;
    path.node_iter().find_map(|node| match node.as_enum() {
        Ok(DevicePathNodeEnum::MediaHardDrive(hd)) => match hd.partition_signature() {
            PartitionSignature::Guid(guid) => Some(guid.to_string().to_uppercase()),
            _ => None,
        },
        _ => None,
    })
}
