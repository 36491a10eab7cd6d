//! Companion initrds: credentials and system extensions the stub picks up
//! from the ESP, packed into cpio archives and appended after the verified
//! initrd.
//!
//! Files are not covered by the UKI signature. They are measured into the
//! kernel parameters PCR instead, so a TPM policy can tell them apart.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::cpio::{pad4, CpioError, CpioWriter};
use crate::measure::PCR_KERNEL_PARAMETERS;

/// ESP directory whose credentials apply to every entry.
pub const GLOBAL_CREDENTIALS_DIR: &str = "\\loader\\credentials";

/// Per-entry directory suffix, next to the UKI.
const EXTRA_DIR_SUFFIX: &str = ".extra.d";

const DIR_MODE: u32 = 0o500;
const FILE_MODE: u32 = 0o400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionKind {
    /// `*.cred` in the UKI's `.extra.d` directory.
    Credentials,
    /// `*.cred` in [`GLOBAL_CREDENTIALS_DIR`].
    GlobalCredentials,
    /// `*.raw` in the UKI's `.extra.d` directory.
    SystemExtensions,
}

impl CompanionKind {
    pub const ALL: [CompanionKind; 3] =
        [CompanionKind::Credentials, CompanionKind::GlobalCredentials, CompanionKind::SystemExtensions];

    pub fn suffix(&self) -> &'static str {
        match self {
            CompanionKind::Credentials | CompanionKind::GlobalCredentials => ".cred",
            CompanionKind::SystemExtensions => ".raw",
        }
    }

    /// Where the files land inside the initrd.
    pub fn target_dir(&self) -> &'static str {
        match self {
            CompanionKind::Credentials => ".extra/credentials",
            CompanionKind::GlobalCredentials => ".extra/global_credentials",
            CompanionKind::SystemExtensions => ".extra/sysext",
        }
    }

    /// Event description in the TPM log.
    pub fn description(&self) -> &'static str {
        match self {
            CompanionKind::Credentials => "Credentials initrd",
            CompanionKind::GlobalCredentials => "Global credentials initrd",
            CompanionKind::SystemExtensions => "System extension initrd",
        }
    }

    pub fn pcr(&self) -> u32 {
        PCR_KERNEL_PARAMETERS
    }

    /// Source directory on the ESP, in UEFI form. `image_path` is the path
    /// the stub was loaded from.
    pub fn source_dir(&self, image_path: &str) -> String {
        match self {
            CompanionKind::GlobalCredentials => String::from(GLOBAL_CREDENTIALS_DIR),
            _ => format!("{image_path}{EXTRA_DIR_SUFFIX}"),
        }
    }

    /// Plain file names with the right suffix and a non-empty stem. Hidden
    /// files are skipped.
    pub fn accepts(&self, name: &str) -> bool {
        let suffix = self.suffix();
        name.len() > suffix.len()
            && name.is_char_boundary(name.len() - suffix.len())
            && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0'])
    }

    /// One archive holding `files` under [`Self::target_dir`], sorted by
    /// name. `None` if there is nothing to pack.
    pub fn pack(&self, mut files: Vec<(String, Vec<u8>)>) -> Result<Option<Vec<u8>>, CpioError> {
        files.retain(|(name, _)| self.accepts(name));
        if files.is_empty() {
            return Ok(None);
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let dir = self.target_dir();
        let mut cpio = CpioWriter::new();
        cpio.directories(dir, DIR_MODE)?;
        for (name, data) in &files {
            cpio.file(&format!("{dir}/{name}"), FILE_MODE, data)?;
        }
        Ok(Some(cpio.finish()))
    }
}

/// The verified initrd followed by the companion archives, each starting on
/// a 4 byte boundary.
pub fn append_initrds(mut initrd: Vec<u8>, companions: &[Vec<u8>]) -> Vec<u8> {
    for archive in companions {
        pad4(&mut initrd);
        initrd.extend_from_slice(archive);
    }
    initrd
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn source_dirs() {
        let uki = "\\EFI\\Linux\\nixos-generation-42.efi";
        assert_eq!(
            CompanionKind::Credentials.source_dir(uki),
            "\\EFI\\Linux\\nixos-generation-42.efi.extra.d"
        );
        assert_eq!(CompanionKind::SystemExtensions.source_dir(uki), CompanionKind::Credentials.source_dir(uki));
        assert_eq!(CompanionKind::GlobalCredentials.source_dir(uki), "\\loader\\credentials");
    }

    #[test]
    fn name_filter() {
        let creds = CompanionKind::Credentials;
        assert!(creds.accepts("wifi.cred"));
        assert!(creds.accepts("WIFI.CRED"));
        assert!(!creds.accepts(".cred"));
        assert!(!creds.accepts(".hidden.cred"));
        assert!(!creds.accepts("image.raw"));
        assert!(!creds.accepts("a\\b.cred"));
        assert!(CompanionKind::SystemExtensions.accepts("debug-tools.raw"));
    }

    #[test]
    fn nothing_to_pack() {
        let files = vec![(String::from("notes.txt"), b"x".to_vec())];
        assert_eq!(CompanionKind::Credentials.pack(files).unwrap(), None);
        assert_eq!(CompanionKind::SystemExtensions.pack(Vec::new()).unwrap(), None);
    }

    #[test]
    fn packed_credentials_are_sorted_under_target_dir() {
        let files = vec![
            (String::from("b.cred"), b"two".to_vec()),
            (String::from("skip.raw"), b"no".to_vec()),
            (String::from("a.cred"), b"one".to_vec()),
        ];
        let archive = CompanionKind::Credentials.pack(files).unwrap().unwrap();
        let find = |needle: &[u8]| archive.windows(needle.len()).position(|w| w == needle);

        let a = find(b".extra/credentials/a.cred\0").unwrap();
        let b = find(b".extra/credentials/b.cred\0").unwrap();
        assert!(find(b".extra/credentials\0").unwrap() < a);
        assert!(a < b);
        assert!(find(b"skip.raw").is_none());
        assert!(find(b"TRAILER!!!").unwrap() > b);
    }

    #[test]
    fn companions_follow_padded_initrd() {
        let combined = append_initrds(b"initrd".to_vec(), &[b"0707".to_vec(), b"0707x".to_vec()]);
        assert_eq!(&combined[..6], b"initrd");
        assert_eq!(&combined[6..8], &[0, 0]);
        assert_eq!(&combined[8..12], b"0707");
        assert_eq!(&combined[12..17], b"0707x");

        assert_eq!(append_initrds(b"initrd".to_vec(), &[]), b"initrd");
    }
}
