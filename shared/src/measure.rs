//! What the stub measures into the TPM, and where.

use alloc::vec::Vec;

use crate::pe::{PeImage, PeResult};

/// Unified kernel image sections.
pub const PCR_KERNEL_IMAGE: u32 = 11;
/// Companion initrds: credentials and system extensions.
pub const PCR_KERNEL_PARAMETERS: u32 = 12;

/// Sections of a unified kernel image that are measured when present.
pub const UNIFIED_SECTIONS: [&str; 8] =
    [".linux", ".osrel", ".cmdline", ".initrd", ".splash", ".dtb", ".pcrsig", ".pcrpkey"];

/// `(name, contents)` of each unified section in `pe`, in image order.
pub fn measured_sections<'a>(pe: &PeImage<'a>) -> PeResult<Vec<(&'static str, &'a [u8])>> {
    let mut measured = Vec::new();
    for section in pe.sections() {
        let name = crate::pe::section_name(section);
        let Some(&unified) = UNIFIED_SECTIONS.iter().find(|s| s.as_bytes() == name) else {
            continue;
        };
        if let Some(data) = pe.section_data(unified)? {
            measured.push((unified, data));
        }
    }
    Ok(measured)
}
