//! Artifact digest used for kernel and initrd.
//!
//! The stub compares these against the values lzbt embedded into the signed
//! UKI, so both sides must use this function and nothing else.

use core::fmt;

use sha2::{Digest as _, Sha256};

pub const DIGEST_LEN: usize = 32;

/// SHA-256 digest of an ESP artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

/// SHA-256 over the whole file contents.
pub fn artifact_digest(data: &[u8]) -> Digest {
    Digest(Sha256::digest(data).into())
}

impl Digest {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// First `n` hex digits, used to content-address file names.
    pub fn short_hex(&self, n: usize) -> alloc::string::String {
        use alloc::string::ToString;
        let mut full = self.to_string();
        full.truncate(n.min(DIGEST_LEN * 2));
        full
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn known_vector() {
        let d = artifact_digest(b"abc");
        assert_eq!(
            d.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(d.short_hex(16), "ba7816bf8f01cfea");
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Digest::from_slice(&[0u8; 31]).is_none());
        assert!(Digest::from_slice(&[0u8; 33]).is_none());
        assert_eq!(Digest::from_slice(&[7u8; 32]), Some(Digest([7u8; 32])));
    }
}
