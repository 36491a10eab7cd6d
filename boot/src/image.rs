//! The stub's own image, as mapped by firmware.

use lanzaboote_shared::measure::{measured_sections, PCR_KERNEL_IMAGE};
use lanzaboote_shared::pe::PeImage;
use lanzaboote_shared::sections::ConfigError;
use lanzaboote_shared::{EmbeddedConfig, StubError};
use uefi::prelude::*;
use uefi::proto::loaded_image::LoadedImage;

use crate::tpm::Tpm;

fn own_image(bs: &BootServices) -> Result<&[u8], StubError> {
    let loaded = bs
        .open_protocol_exclusive::<LoadedImage>(bs.image_handle())
        .map_err(|e| StubError::LoadFailure { operation: "open own LoadedImage", status: e.status().0 })?;
    let (base, size) = loaded.info();
    let size = usize::try_from(size)
        .map_err(|_| StubError::LoadFailure { operation: "size own image", status: Status::BAD_BUFFER_SIZE.0 })?;

    // SAFETY: firmware mapped this image at `base` for `size` bytes and keeps
    // it there until we exit. Nothing writes to headers or sections.
    Ok(unsafe { core::slice::from_raw_parts(base as *const u8, size) })
}

/// Decodes the configuration sections `lzbt` appended to this image.
pub fn embedded_config(bs: &BootServices) -> Result<EmbeddedConfig, StubError> {
    let pe = PeImage::parse_loaded(own_image(bs)?).map_err(ConfigError::from)?;
    Ok(EmbeddedConfig::from_image(&pe)?)
}

/// Measures the unified sections of this image into the kernel image PCR.
/// Returns whether anything was measured.
pub fn measure(bs: &BootServices, tpm: &mut Tpm<'_>) -> bool {
    let sections = own_image(bs)
        .ok()
        .and_then(|image| PeImage::parse_loaded(image).ok())
        .map(|pe| measured_sections(&pe));
    match sections {
        Some(Ok(sections)) => sections
            .into_iter()
            .fold(false, |measured, (name, data)| tpm.measure(PCR_KERNEL_IMAGE, data, name) | measured),
        Some(Err(e)) => {
            log::warn!("cannot read sections to measure: {e}");
            false
        }
        None => {
            log::warn!("cannot parse own image, nothing measured");
            false
        }
    }
}
