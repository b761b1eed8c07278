//! SQLite mirror of the remote drive tree.
//!
//! The cache is disposable: the remote change log is the source of truth,
//! and a deleted cache is rebuilt by pulling the log from the beginning.
//!
//! # Architecture
//! The database stores three things:
//! - **Nodes**: the latest snapshot of every file and folder, keyed by the
//!   provider's node id.
//! - **Parentage**: one row per parent/child link. A node may have several
//!   parents; paths always follow the first one.
//! - **Metadata**: the last applied checkpoint and the time of the last
//!   successful sync.
//!
//! Every query runs on a pooled database worker: one connection confined to
//! its own thread.

mod cache;
mod db;
pub mod error;
mod models;
mod repo;
mod worker;

pub use crate::cache::NodeCache;
