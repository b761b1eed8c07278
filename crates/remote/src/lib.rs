//! Remote side of the mirror: the node model, the provider capability and
//! the serialized client the rest of the workspace talks to.

pub mod api;
mod client;
pub mod error;
mod models;

pub use crate::api::RemoteApi;
pub use crate::client::{ChangeLog, RemoteClient};
pub use crate::models::{ChangeSet, Checkpoint, Node, NodeId, NodeStatus};
use std::sync::Arc;

pub type RemoteHandle = Arc<dyn RemoteApi + Send + Sync>;
