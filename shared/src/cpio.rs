//! Writer for "newc" cpio archives, the format the kernel unpacks from
//! concatenated initrds.
//!
//! Each entry: a 110 byte ASCII header ("070701" plus 13 fields of 8 hex
//! digits), the NUL-terminated name, padding to 4, the data, padding to 4.
//! The archive ends with a `TRAILER!!!` entry.

use alloc::format;
use alloc::vec::Vec;

const MAGIC: &[u8; 6] = b"070701";
const TRAILER: &str = "TRAILER!!!";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpioError {
    /// Names must be non-empty and free of NUL.
    BadName,
    TooLarge,
}

/// Builds one archive. Entries are written in call order.
#[derive(Debug, Default)]
pub struct CpioWriter {
    out: Vec<u8>,
    next_inode: u32,
}

impl CpioWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory entry. Parents are not created implicitly.
    pub fn directory(&mut self, path: &str, mode: u32) -> Result<(), CpioError> {
        self.entry(path, S_IFDIR | (mode & 0o7777), 2, &[])
    }

    pub fn file(&mut self, path: &str, mode: u32, data: &[u8]) -> Result<(), CpioError> {
        self.entry(path, S_IFREG | (mode & 0o7777), 1, data)
    }

    /// Every leading directory of `path`, e.g. `.extra` then
    /// `.extra/credentials`.
    pub fn directories(&mut self, path: &str, mode: u32) -> Result<(), CpioError> {
        let mut end = 0;
        for component in path.split('/') {
            end += component.len();
            if !component.is_empty() {
                self.directory(&path[..end], mode)?;
            }
            end += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Vec<u8> {
        // The trailer name is valid and empty data cannot overflow.
        let _ = self.header(TRAILER, 0, 1, 0, 0);
        self.out
    }

    fn entry(&mut self, path: &str, mode: u32, nlink: u32, data: &[u8]) -> Result<(), CpioError> {
        if path.is_empty() || path.contains('\0') {
            return Err(CpioError::BadName);
        }
        let size = u32::try_from(data.len()).map_err(|_| CpioError::TooLarge)?;
        self.next_inode += 1;
        let inode = self.next_inode;
        self.header(path, mode, nlink, size, inode)?;
        self.out.extend_from_slice(data);
        pad4(&mut self.out);
        Ok(())
    }

    fn header(&mut self, name: &str, mode: u32, nlink: u32, size: u32, inode: u32) -> Result<(), CpioError> {
        let name_size = u32::try_from(name.len() + 1).map_err(|_| CpioError::TooLarge)?;
        self.out.extend_from_slice(MAGIC);
        // ino mode uid gid nlink mtime filesize devmajor devminor
        // rdevmajor rdevminor namesize check
        for field in [inode, mode, 0, 0, nlink, 0, size, 0, 0, 0, 0, name_size, 0] {
            self.out.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(0);
        pad4(&mut self.out);
        Ok(())
    }
}

/// Zero-pad to a multiple of 4 bytes.
pub fn pad4(data: &mut Vec<u8>) {
    let padded = (data.len() + 3) & !3;
    data.resize(padded, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(header: &[u8], index: usize) -> u32 {
        let at = 6 + index * 8;
        u32::from_str_radix(core::str::from_utf8(&header[at..at + 8]).unwrap(), 16).unwrap()
    }

    #[test]
    fn single_file_layout() {
        let mut cpio = CpioWriter::new();
        cpio.file("a.cred", 0o400, b"secret").unwrap();
        let archive = cpio.finish();

        assert_eq!(&archive[..6], b"070701");
        assert_eq!(field(&archive, 1), S_IFREG | 0o400);
        assert_eq!(field(&archive, 6), 6);
        assert_eq!(field(&archive, 11), 7);
        // 110 + "a.cred\0" = 117, padded to 120.
        assert_eq!(&archive[110..117], b"a.cred\0");
        assert_eq!(&archive[120..126], b"secret");
        let trailer = &archive[128..];
        assert_eq!(&trailer[110..121], b"TRAILER!!!\0");
        assert_eq!(archive.len() % 4, 0);
    }

    #[test]
    fn leading_directories_come_first() {
        let mut cpio = CpioWriter::new();
        cpio.directories(".extra/credentials", 0o500).unwrap();
        let archive = cpio.finish();
        assert_eq!(field(&archive, 1), S_IFDIR | 0o500);
        assert!(archive.windows(7).any(|w| w == b".extra\0"));
        assert!(archive.windows(19).any(|w| w == b".extra/credentials\0"));
        // Distinct inodes.
        let second = &archive[(110 + 7 + 3) & !3..];
        assert_eq!(field(&archive, 0), 1);
        assert_eq!(field(second, 0), 2);
    }

    #[test]
    fn bad_names_rejected() {
        let mut cpio = CpioWriter::new();
        assert_eq!(cpio.file("", 0o400, b"x"), Err(CpioError::BadName));
        assert_eq!(cpio.file("a\0b", 0o400, b"x"), Err(CpioError::BadName));
    }
}
