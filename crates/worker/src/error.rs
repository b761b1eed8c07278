//! Worker Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A worker error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A worker was requested after the pool was shut down.
    #[display("worker pool is closed")]
    PoolClosed,
    /// The serial worker's task has exited (shut down, or a job panicked)
    /// and can no longer accept jobs.
    #[display("worker has stopped")]
    WorkerStopped,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::PoolClosed.to_string(), "worker pool is closed");
        assert_eq!(ErrorKind::WorkerStopped.to_string(), "worker has stopped");
    }

    #[test]
    fn shutdown_is_final() {
        assert!(!ErrorKind::PoolClosed.is_retryable());
        assert!(!ErrorKind::WorkerStopped.is_retryable());
    }
}
