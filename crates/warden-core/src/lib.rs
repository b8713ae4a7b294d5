//! warden-core: Shared library for the warden control protocol.
//!
//! This crate provides:
//! - Text (newline-delimited JSON) and binary (length-prefixed) frame codecs
//! - Strongly-typed protocol message definitions
//! - Bulk-transfer reassembly for chunked payloads
//! - Error taxonomy and logging setup
//!
//! All types here are pure: no sockets, no tasks. I/O and buffering policy
//! live in `warden-server`.

pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
