//! Sync orchestration: pulls the provider's change log into the node cache
//! and mirrors provider mutations (trash, mkdir, upload) back into it.

mod controller;
pub mod error;

pub use crate::controller::{Status, SyncController, SyncReport};
