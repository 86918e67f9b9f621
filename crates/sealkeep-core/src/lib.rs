//! sealkeep core - shared functionality for the sealkeep crates
//!
//! Organizations keep encrypted secrets that are distributed to their
//! members through per-keypair envelopes. This crate holds what every other
//! crate agrees on: the data model, the error taxonomy, the root directory
//! contract, the registry collaborator and the control channel protocol.

pub mod config;
pub mod daemon;
pub mod encoding;
pub mod error;
pub mod format;
pub mod model;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod registry;

pub use config::Config;
pub use error::{Error, ErrorKind, PartialFailure, Result};
pub use paths::Paths;
pub use registry::{LocalRegistry, Registry};
