//! PE/COFF access and section appender
//!
//! Headers, section table and data directories are read with goblin. The
//! appender is ours: it adds initialized-data sections to a stub image and
//! strips any Authenticode certificate table, since the result is re-signed
//! anyway.
//!
//! Layout offsets the appender patches (little-endian):
//!   e_lfanew        "PE\0\0"
//!   +4              COFF file header (20 bytes)
//!   +24             optional header (PE32 or PE32+), data directories last
//!   +24+opt_size    section table, 40 bytes per entry

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use goblin::pe::optional_header::{MAGIC_32, MAGIC_64};
use goblin::pe::options::ParseOptions;
use goblin::pe::section_table::SectionTable;
use goblin::pe::PE;

pub use goblin::pe::header::{COFF_MACHINE_ARM64, COFF_MACHINE_X86_64};

const COFF_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;

// Optional header field offsets shared by PE32 and PE32+.
const OPT_SIZE_OF_IMAGE: usize = 56;
const OPT_CHECKSUM: usize = 64;

const DIRECTORY_SECURITY: usize = 4;

pub const SUBSYSTEM_EFI_APPLICATION: u16 = 10;

const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const SCN_MEM_READ: u32 = 0x4000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeError {
    /// goblin refused the headers.
    Malformed(String),
    NoOptionalHeader,
    UnknownOptionalHeader(u16),
    BadAlignment,
    SectionOutOfBounds,
    NoRoomForSectionHeaders,
    DuplicateSection,
    InvalidSectionName,
    TooLarge,
}

impl fmt::Display for PeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeError::Malformed(reason) => write!(f, "malformed PE image: {reason}"),
            PeError::NoOptionalHeader => f.write_str("no optional header"),
            PeError::UnknownOptionalHeader(m) => write!(f, "unknown optional header magic {m:#x}"),
            PeError::BadAlignment => f.write_str("file or section alignment is not a power of two"),
            PeError::SectionOutOfBounds => f.write_str("section data outside of image"),
            PeError::NoRoomForSectionHeaders => f.write_str("no room left for section headers"),
            PeError::DuplicateSection => f.write_str("section already present"),
            PeError::InvalidSectionName => f.write_str("section names must be 1-8 bytes"),
            PeError::TooLarge => f.write_str("image exceeds 4 GiB"),
        }
    }
}

pub type PeResult<T> = Result<T, PeError>;

/// How the bytes handed to [`PeImage`] are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// As stored in a file: sections at `PointerToRawData`.
    File,
    /// As mapped by the firmware loader: sections at their RVA.
    Memory,
}

/// Section name without NUL padding.
pub fn section_name(section: &SectionTable) -> &[u8] {
    let len = section.name.iter().position(|&c| c == 0).unwrap_or(8);
    &section.name[..len]
}

fn raw_end(section: &SectionTable) -> u64 {
    u64::from(section.pointer_to_raw_data) + u64::from(section.size_of_raw_data)
}

fn virtual_end(section: &SectionTable) -> u64 {
    u64::from(section.virtual_address) + u64::from(section.virtual_size.max(section.size_of_raw_data))
}

/// Parsed view over a PE image.
pub struct PeImage<'a> {
    data: &'a [u8],
    layout: ImageLayout,
    pe: PE<'a>,
}

impl<'a> PeImage<'a> {
    /// An image as stored on disk.
    pub fn parse(data: &'a [u8]) -> PeResult<Self> {
        Self::parse_as(data, ImageLayout::File)
    }

    /// An image as mapped by the firmware loader, e.g. the running stub.
    pub fn parse_loaded(data: &'a [u8]) -> PeResult<Self> {
        Self::parse_as(data, ImageLayout::Memory)
    }

    fn parse_as(data: &'a [u8], layout: ImageLayout) -> PeResult<Self> {
        let mut opts = ParseOptions::default();
        // RVAs only need translating to file offsets in file layout.
        opts.resolve_rva = layout == ImageLayout::File;
        // The certificate table is never mapped, and we only ever strip it.
        opts.parse_attribute_certificates = false;
        let pe = PE::parse_with_opts(data, &opts).map_err(|e| PeError::Malformed(e.to_string()))?;
        if pe.header.optional_header.is_none() {
            return Err(PeError::NoOptionalHeader);
        }
        Ok(Self { data, layout, pe })
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    pub fn machine(&self) -> u16 {
        self.pe.header.coff_header.machine
    }

    pub fn subsystem(&self) -> u16 {
        self.pe
            .header
            .optional_header
            .as_ref()
            .map_or(0, |opt| opt.windows_fields.subsystem)
    }

    pub fn is_efi_application(&self) -> bool {
        self.subsystem() == SUBSYSTEM_EFI_APPLICATION
    }

    pub fn sections(&self) -> &[SectionTable] {
        &self.pe.sections
    }

    pub fn find_section(&self, name: &str) -> Option<&SectionTable> {
        self.pe.sections.iter().find(|s| section_name(s) == name.as_bytes())
    }

    /// Contents of the named section. `Ok(None)` if there is no such section,
    /// an error if the section table points outside the data.
    pub fn section_data(&self, name: &str) -> PeResult<Option<&'a [u8]>> {
        let Some(section) = self.find_section(name) else {
            return Ok(None);
        };
        let (start, len) = match self.layout {
            ImageLayout::File => {
                let len = match section.virtual_size {
                    0 => section.size_of_raw_data,
                    v => v.min(section.size_of_raw_data),
                };
                (section.pointer_to_raw_data as usize, len as usize)
            }
            ImageLayout::Memory => (section.virtual_address as usize, section.virtual_size as usize),
        };
        let end = start.checked_add(len).ok_or(PeError::SectionOutOfBounds)?;
        self.data
            .get(start..end)
            .map(Some)
            .ok_or(PeError::SectionOutOfBounds)
    }

    /// Authenticode certificate table as (file offset, size), if present.
    pub fn certificate_table(&self) -> Option<(u32, u32)> {
        let opt = self.pe.header.optional_header.as_ref()?;
        match opt.data_directories.get_certificate_table() {
            Some(dir) if dir.size != 0 => Some((dir.virtual_address, dir.size)),
            _ => None,
        }
    }

    /// File offsets the appender patches.
    fn header_offsets(&self) -> PeResult<HeaderOffsets> {
        let opt = self.pe.header.optional_header.as_ref().ok_or(PeError::NoOptionalHeader)?;
        let dirs_offset = match opt.standard_fields.magic {
            MAGIC_32 => 96,
            MAGIC_64 => 112,
            other => return Err(PeError::UnknownOptionalHeader(other)),
        };
        let opt_size = usize::from(self.pe.header.coff_header.size_of_optional_header);
        let coff = self.pe.header.dos_header.pe_pointer as usize + 4;
        let optional = coff + COFF_HEADER_LEN;
        let security_end = dirs_offset + (DIRECTORY_SECURITY + 1) * 8;
        Ok(HeaderOffsets {
            coff,
            optional,
            section_table: optional + opt_size,
            security_dir: (security_end <= opt_size).then_some(optional + dirs_offset + DIRECTORY_SECURITY * 8),
            section_alignment: opt.windows_fields.section_alignment,
            file_alignment: opt.windows_fields.file_alignment,
            size_of_headers: opt.windows_fields.size_of_headers,
        })
    }
}

struct HeaderOffsets {
    coff: usize,
    optional: usize,
    section_table: usize,
    security_dir: Option<usize>,
    section_alignment: u32,
    file_alignment: u32,
    size_of_headers: u32,
}

/// Append `(name, contents)` sections to a file-layout PE image.
///
/// The returned image has no certificate table and a zero checksum; it is
/// meant to be signed afterwards.
pub fn append_sections(image: &[u8], new_sections: &[(&str, &[u8])]) -> PeResult<Vec<u8>> {
    let pe = PeImage::parse(image)?;
    let at = pe.header_offsets()?;

    for (i, (name, _)) in new_sections.iter().enumerate() {
        if name.is_empty() || name.len() > 8 {
            return Err(PeError::InvalidSectionName);
        }
        let repeated = new_sections[..i].iter().any(|(other, _)| other == name);
        if repeated || pe.find_section(name).is_some() {
            return Err(PeError::DuplicateSection);
        }
    }

    let file_alignment = u64::from(at.file_alignment);
    let section_alignment = u64::from(at.section_alignment);
    if !file_alignment.is_power_of_two() || !section_alignment.is_power_of_two() {
        return Err(PeError::BadAlignment);
    }

    let existing = pe.sections().len();
    let total = existing + new_sections.len();
    let table_end = at.section_table + total * SECTION_HEADER_LEN;
    let first_raw = pe
        .sections()
        .iter()
        .filter(|s| s.size_of_raw_data != 0)
        .map(|s| s.pointer_to_raw_data as usize)
        .min()
        .unwrap_or(usize::MAX);
    if table_end > at.size_of_headers as usize || table_end > first_raw {
        return Err(PeError::NoRoomForSectionHeaders);
    }
    let number_of_sections = u16::try_from(total).map_err(|_| PeError::NoRoomForSectionHeaders)?;

    // Everything past the last section's raw data (certificate table,
    // overlays) is dropped.
    let data_end = pe
        .sections()
        .iter()
        .map(raw_end)
        .max()
        .unwrap_or(0)
        .max(u64::from(at.size_of_headers));
    let data_end = usize::try_from(data_end).map_err(|_| PeError::TooLarge)?;
    let mut out = image.get(..data_end).ok_or(PeError::SectionOutOfBounds)?.to_vec();
    out.resize(align_up(out.len() as u64, file_alignment) as usize, 0);

    let mut next_va = align_up(
        pe.sections()
            .iter()
            .map(virtual_end)
            .max()
            .unwrap_or(u64::from(at.size_of_headers)),
        section_alignment,
    );

    for (i, (name, contents)) in new_sections.iter().enumerate() {
        let raw_ptr = out.len();
        let raw_size = align_up(contents.len() as u64, file_alignment) as usize;
        out.extend_from_slice(contents);
        out.resize(raw_ptr + raw_size, 0);

        let mut header = [0u8; SECTION_HEADER_LEN];
        header[..name.len()].copy_from_slice(name.as_bytes());
        put_u32(&mut header, 8, to_u32(contents.len() as u64)?);
        put_u32(&mut header, 12, to_u32(next_va)?);
        put_u32(&mut header, 16, to_u32(raw_size as u64)?);
        put_u32(&mut header, 20, if raw_size == 0 { 0 } else { to_u32(raw_ptr as u64)? });
        put_u32(&mut header, 36, SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ);

        let entry = at.section_table + (existing + i) * SECTION_HEADER_LEN;
        out[entry..entry + SECTION_HEADER_LEN].copy_from_slice(&header);

        next_va = align_up(next_va + (contents.len() as u64).max(1), section_alignment);
    }

    to_u32(out.len() as u64)?;
    out[at.coff + 2..at.coff + 4].copy_from_slice(&number_of_sections.to_le_bytes());
    put_u32(&mut out, at.optional + OPT_SIZE_OF_IMAGE, to_u32(next_va)?);
    put_u32(&mut out, at.optional + OPT_CHECKSUM, 0);
    if let Some(dir) = at.security_dir {
        put_u32(&mut out, dir, 0);
        put_u32(&mut out, dir + 4, 0);
    }

    Ok(out)
}

fn put_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn to_u32(value: u64) -> PeResult<u32> {
    u32::try_from(value).map_err(|_| PeError::TooLarge)
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Tiny but valid PE32+ EFI application, for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use alloc::vec;
    use alloc::vec::Vec;

    pub const HEADERS_SIZE: usize = 0x400;
    pub const PE_OFFSET: usize = 0x80;
    pub const OPT_OFFSET: usize = PE_OFFSET + 4 + 20;
    pub const SECTION_TABLE_OFFSET: usize = OPT_OFFSET + 0xF0;

    /// One `.text` section holding a single `ret`.
    pub fn minimal_efi_image() -> Vec<u8> {
        let mut image = vec![0u8; HEADERS_SIZE + 0x200];
        image[..2].copy_from_slice(b"MZ");
        image[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let coff = PE_OFFSET + 4;
        image[coff..coff + 2].copy_from_slice(&super::COFF_MACHINE_X86_64.to_le_bytes());
        image[coff + 2..coff + 4].copy_from_slice(&1u16.to_le_bytes());
        image[coff + 16..coff + 18].copy_from_slice(&0xF0u16.to_le_bytes());
        image[coff + 18..coff + 20].copy_from_slice(&0x22u16.to_le_bytes());

        let opt = OPT_OFFSET;
        let put = |image: &mut Vec<u8>, at: usize, v: u32| {
            image[at..at + 4].copy_from_slice(&v.to_le_bytes());
        };
        image[opt..opt + 2].copy_from_slice(&goblin::pe::optional_header::MAGIC_64.to_le_bytes());
        put(&mut image, opt + 16, 0x1000);
        put(&mut image, opt + 32, 0x1000);
        put(&mut image, opt + 36, 0x200);
        put(&mut image, opt + 56, 0x2000);
        put(&mut image, opt + 60, HEADERS_SIZE as u32);
        image[opt + 68..opt + 70].copy_from_slice(&super::SUBSYSTEM_EFI_APPLICATION.to_le_bytes());
        put(&mut image, opt + 108, 16);

        let s = SECTION_TABLE_OFFSET;
        image[s..s + 5].copy_from_slice(b".text");
        put(&mut image, s + 8, 0x10);
        put(&mut image, s + 12, 0x1000);
        put(&mut image, s + 16, 0x200);
        put(&mut image, s + 20, HEADERS_SIZE as u32);
        put(&mut image, s + 36, 0x6000_0020);

        image[HEADERS_SIZE] = 0xC3;
        image
    }

    /// Lay a file-layout image out the way the firmware loader maps it.
    pub fn map_into_memory(file: &[u8]) -> Vec<u8> {
        let pe = super::PeImage::parse(file).expect("valid test image");
        let size = pe
            .sections()
            .iter()
            .map(|s| super::virtual_end(s) as usize)
            .max()
            .unwrap_or(HEADERS_SIZE);
        let mut memory = vec![0u8; size];
        memory[..HEADERS_SIZE].copy_from_slice(&file[..HEADERS_SIZE]);
        for s in pe.sections() {
            let raw = &file[s.pointer_to_raw_data as usize..][..s.size_of_raw_data as usize];
            let va = s.virtual_address as usize;
            memory[va..va + raw.len()].copy_from_slice(raw);
        }
        memory
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn parses_minimal_image() {
        let image = minimal_efi_image();
        let pe = PeImage::parse(&image).unwrap();
        assert_eq!(pe.machine(), COFF_MACHINE_X86_64);
        assert!(pe.is_efi_application());
        assert_eq!(pe.layout(), ImageLayout::File);
        assert_eq!(pe.sections().len(), 1);
        assert_eq!(section_name(&pe.sections()[0]), b".text");
        assert_eq!(pe.section_data(".text").unwrap().unwrap()[0], 0xC3);
        assert_eq!(pe.section_data(".nope").unwrap(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(PeImage::parse(b"").err(), Some(PeError::Malformed(_))));
        let mut image = minimal_efi_image();
        image[PE_OFFSET] = b'X';
        assert!(matches!(PeImage::parse(&image).err(), Some(PeError::Malformed(_))));
        let mut image = minimal_efi_image();
        image[0x3C..0x40].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        assert!(matches!(PeImage::parse(&image).err(), Some(PeError::Malformed(_))));
    }

    #[test]
    fn appended_sections_are_readable_in_both_layouts() {
        let image = minimal_efi_image();
        let out = append_sections(&image, &[(".cmdline", b"quiet"), (".kernelh", &[9u8; 32])]).unwrap();

        let pe = PeImage::parse(&out).unwrap();
        assert_eq!(pe.sections().len(), 3);
        assert_eq!(pe.section_data(".cmdline").unwrap(), Some(&b"quiet"[..]));
        assert_eq!(pe.section_data(".kernelh").unwrap(), Some(&[9u8; 32][..]));

        let cmdline = pe.find_section(".cmdline").unwrap();
        assert_eq!(cmdline.virtual_address, 0x2000);
        assert_eq!(cmdline.pointer_to_raw_data % 0x200, 0);
        let size_of_image = u32::from_le_bytes(out[OPT_OFFSET + 56..OPT_OFFSET + 60].try_into().unwrap());
        assert_eq!(size_of_image, 0x4000);

        let memory = map_into_memory(&out);
        let mapped = PeImage::parse_loaded(&memory).unwrap();
        assert_eq!(mapped.layout(), ImageLayout::Memory);
        assert_eq!(mapped.section_data(".cmdline").unwrap(), Some(&b"quiet"[..]));
    }

    #[test]
    fn empty_section_contents() {
        let out = append_sections(&minimal_efi_image(), &[(".cmdline", b"")]).unwrap();
        let pe = PeImage::parse(&out).unwrap();
        assert_eq!(pe.section_data(".cmdline").unwrap(), Some(&b""[..]));
    }

    #[test]
    fn certificate_table_is_stripped() {
        let mut image = minimal_efi_image();
        let cert_offset = image.len() as u32;
        image.extend_from_slice(&[0xAB; 64]);
        let dir = OPT_OFFSET + 112 + 4 * 8;
        image[dir..dir + 4].copy_from_slice(&cert_offset.to_le_bytes());
        image[dir + 4..dir + 8].copy_from_slice(&64u32.to_le_bytes());
        assert_eq!(PeImage::parse(&image).unwrap().certificate_table(), Some((cert_offset, 64)));

        let out = append_sections(&image, &[(".osrel", b"ID=nixos\n")]).unwrap();
        let pe = PeImage::parse(&out).unwrap();
        assert_eq!(pe.certificate_table(), None);
        assert!(!out.windows(64).any(|w| w == [0xAB; 64]));
    }

    #[test]
    fn duplicate_and_bad_names_rejected() {
        let image = minimal_efi_image();
        assert_eq!(append_sections(&image, &[(".text", b"x")]).err(), Some(PeError::DuplicateSection));
        assert_eq!(
            append_sections(&image, &[(".a", b"x"), (".a", b"y")]).err(),
            Some(PeError::DuplicateSection)
        );
        assert_eq!(
            append_sections(&image, &[(".waytoolong", b"x")]).err(),
            Some(PeError::InvalidSectionName)
        );
    }

    #[test]
    fn header_space_is_enforced() {
        let image = minimal_efi_image();
        let names: Vec<alloc::string::String> = (0..20).map(|i| alloc::format!(".s{i}")).collect();
        let sections: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
        assert_eq!(append_sections(&image, &sections).err(), Some(PeError::NoRoomForSectionHeaders));
    }

    #[test]
    fn section_pointing_outside_is_an_error() {
        let mut image = minimal_efi_image();
        let s = SECTION_TABLE_OFFSET;
        image[s + 20..s + 24].copy_from_slice(&0x10_0000u32.to_le_bytes());
        match PeImage::parse(&image) {
            Ok(pe) => assert_eq!(pe.section_data(".text").err(), Some(PeError::SectionOutOfBounds)),
            Err(e) => assert!(matches!(e, PeError::Malformed(_))),
        }
    }
}
