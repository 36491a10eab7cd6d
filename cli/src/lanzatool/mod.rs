// cli/src/lanzatool/mod.rs: installer building blocks

pub mod bootspec;
pub mod config;
pub mod error;
pub mod esp;
pub mod gc;
pub mod generation;
pub mod inspect;
pub mod install;
pub mod loader;
pub mod lock;
pub mod logging;
pub mod policy;
pub mod signer;
pub mod uki;
