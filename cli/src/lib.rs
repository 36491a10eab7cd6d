//! lzbt: installs signed lanzaboote UKIs for NixOS generations onto the ESP.
//!
//! The binary in `main.rs` is a thin clap front end; everything it does is
//! reachable from here so integration tests and other tooling can drive it.

mod lanzatool;

pub use lanzatool::{
    bootspec, config, error, esp, gc, generation, inspect, install, loader, lock, logging, policy, signer, uki,
};

pub use error::{InstallError, Result};
