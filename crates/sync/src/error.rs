//! Sync Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use nimbus_cache::error::{Error as CacheError, ErrorKind as CacheErrorKind};
use nimbus_remote::NodeId;
use nimbus_remote::error::{Error as RemoteError, ErrorKind as RemoteErrorKind};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a sync failure.
///
/// ### Dependency Errors
/// - [`ErrorKind::Remote`] - the provider refused or could not be reached.
/// - [`ErrorKind::Cache`] - the local node cache failed.
///
/// ### Operational Errors
/// - [`ErrorKind::Vanished`]
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("remote error: {_0}")]
    Remote(RemoteErrorKind),
    #[display("cache error: {_0}")]
    Cache(CacheErrorKind),
    /// A node written to the cache could not be read back.
    #[display("node {_0} vanished from the cache")]
    Vanished(#[error(not(source))] NodeId),
}

impl ErrorKind {
    /// Convert a remote error into a sync error, keeping the remote crate's
    /// error tree as a child.
    #[track_caller]
    pub fn remote(err: RemoteError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Remote(inner))
    }

    /// Convert a cache error into a sync error, keeping the cache crate's
    /// error tree as a child.
    #[track_caller]
    pub fn cache(err: CacheError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Cache(inner))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether the cache is stale and a fresh sync is the cure.
    pub fn needs_resync(&self) -> bool {
        match self {
            Self::Cache(kind) => kind.needs_resync(),
            Self::Vanished(_) => true,
            Self::Remote(_) => false,
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(kind) => kind.is_retryable(),
            Self::Cache(kind) => kind.is_retryable(),
            Self::Vanished(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_inner_kind() {
        let broken = ErrorKind::Cache(CacheErrorKind::BrokenTree("n1".into()));
        assert!(broken.needs_resync());
        assert!(!broken.is_remote());

        let request = ErrorKind::Remote(RemoteErrorKind::Request("503: busy".into()));
        assert!(request.is_remote());
        assert!(request.is_retryable());
        assert_eq!(request.to_string(), "remote error: request failed: 503: busy");
    }

    #[test]
    fn conversion_keeps_the_kind() {
        let err = ErrorKind::cache(CacheError::from(CacheErrorKind::PoolClosed));
        assert_eq!(*err, ErrorKind::Cache(CacheErrorKind::PoolClosed));
    }
}
