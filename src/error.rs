//! Command Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A command error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for command execution.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a command failed, phrased for the person at the terminal.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the node cache")]
    Startup,
    #[display("could not create {}", _0.display())]
    LocalIo(#[error(not(source))] PathBuf),
    /// Nothing in the cache at that path. A sync may help.
    #[display("no such remote path: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("not a folder: {_0}")]
    NotAFolder(#[error(not(source))] String),
    #[display("is a folder: {_0}")]
    IsAFolder(#[error(not(source))] String),
    #[display("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: String, actual: String },
    /// The provider refused or could not be reached; details were logged.
    #[display("the provider rejected the request")]
    Rejected,
    #[display("command failed")]
    Failed,
}
