//! Lanzaboote shared contract
//!
//! Everything the installer (`lzbt`) and the UEFI stub must agree on lives
//! here: where files go on the ESP, how the stub's configuration is encoded
//! into PE sections, which digest covers kernel and initrd, how the stub
//! walks from entry to handoff, and what it measures and packs alongside.
//!
//! The crate is `no_std` + `alloc` so the stub can link it directly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod companion;
pub mod cpio;
pub mod digest;
pub mod layout;
pub mod measure;
pub mod pe;
pub mod sections;

pub use boot::{Abort, BootFlow, Stage, StubError};
pub use digest::{artifact_digest, Digest};
pub use layout::{ArtifactKind, GenerationId};
pub use sections::EmbeddedConfig;
