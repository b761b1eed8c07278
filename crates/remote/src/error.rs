//! Remote Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A remote error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure, or the provider answered with a non-success status.
    #[display("request failed: {_0}")]
    Request(#[error(not(source))] String),
    /// Credentials could not be loaded (missing or malformed auth file).
    #[display("authentication unavailable: {_0}")]
    Auth(#[error(not(source))] String),
    /// The provider answered, but not with anything we understand.
    #[display("invalid response: {_0}")]
    InvalidResponse(#[error(not(source))] String),
    /// Reading an upload source or writing a download target failed.
    #[display("local I/O error: {}", _0.display())]
    LocalIo(#[error(not(source))] PathBuf),
    /// The network worker has shut down.
    #[display("remote worker has stopped")]
    WorkerStopped,
}

impl ErrorKind {
    /// Failures that originate on the provider side of the boundary: the
    /// request never completed, was refused, or came back garbled.
    pub fn is_request_error(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Auth(_) | Self::InvalidResponse(_))
    }

    /// Returns `true` if retrying might succeed.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Request("503: busy".into()), true, true)]
    #[case(ErrorKind::Auth("no token".into()), true, false)]
    #[case(ErrorKind::InvalidResponse("not json".into()), true, false)]
    #[case(ErrorKind::LocalIo(PathBuf::from("/tmp/x")), false, false)]
    #[case(ErrorKind::WorkerStopped, false, false)]
    fn classification(#[case] kind: ErrorKind, #[case] request: bool, #[case] retryable: bool) {
        assert_eq!(kind.is_request_error(), request);
        assert_eq!(kind.is_retryable(), retryable);
    }

    #[test]
    fn display_includes_detail() {
        assert_eq!(ErrorKind::Request("404: gone".into()).to_string(), "request failed: 404: gone");
        assert_eq!(ErrorKind::LocalIo(PathBuf::from("a/b")).to_string(), "local I/O error: a/b");
    }
}
