//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use nimbus_remote::NodeId;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A parent link points at a node the cache doesn't have (or the links
    /// loop). The cache is stale relative to the remote tree; resync.
    #[display("broken tree at node {_0}")]
    BrokenTree(#[error(not(source))] NodeId),
    /// The cache was closed.
    #[display("node cache is closed")]
    PoolClosed,
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A stored value could not be converted.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    #[display("invalid name pattern: {_0}")]
    InvalidPattern(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }

    /// Whether a fresh sync is the cure.
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::BrokenTree(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_tree_names_the_node() {
        let kind = ErrorKind::BrokenTree("n42".into());
        assert_eq!(kind.to_string(), "broken tree at node n42");
        assert!(kind.needs_resync());
        assert!(!kind.is_retryable());
    }
}
