//! Remote API collaborator.
//!
//! [`RemoteApi`] is the capability the rest of the workspace needs from a
//! cloud drive provider: a resumable change log, folder creation, upload,
//! streaming download and move-to-trash. Implementations decode provider
//! responses into [`Node`]s at this boundary and report every transport or
//! provider failure as [`Request`](crate::error::ErrorKind::Request).
//!
//! Implementations are not expected to be safe for concurrent use; the
//! [`RemoteClient`](crate::RemoteClient) funnels every call through a
//! single worker.

mod changes;
#[cfg(feature = "http")]
mod http;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::changes::parse_change_log;
#[cfg(feature = "http")]
pub use self::http::{HttpApi, HttpOptions};
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockApi;
use crate::error::Result;
use crate::models::{ChangeSet, Checkpoint, Node};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;

/// Decoded change log, in server order.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeSet>> + Send>>;
/// Raw file content, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Unified interface for cloud drive providers.
///
/// # Examples
///
/// ```
/// use futures::TryStreamExt;
/// use nimbus_remote::api::RemoteApi;
/// use nimbus_remote::error::Result;
///
/// async fn count_changes(api: &dyn RemoteApi) -> Result<usize> {
///     let changes: Vec<_> = api.get_changes(None, false).await?.try_collect().await?;
///     Ok(changes.len())
/// }
/// ```
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Provider name, for logging only.
    fn name(&self) -> &str;

    /// Open the change log positioned just after `checkpoint`, or at the
    /// beginning of history when there is none.
    ///
    /// The returned stream is finite and not restartable. Purged nodes are
    /// only reported when `include_purged` is set; a client starting from
    /// scratch has nothing to purge.
    async fn get_changes(&self, checkpoint: Option<&Checkpoint>, include_purged: bool) -> Result<ChangeStream>;

    /// Create a folder called `name` inside `parent_id`.
    ///
    /// Name collisions, missing parents and permission problems are all
    /// reported as request errors.
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Node>;

    /// Upload the file at `local_path` into `parent_id`, named after the
    /// local file.
    async fn upload_file(&self, parent_id: &str, local_path: &Path) -> Result<Node>;

    /// Stream the content of a file node.
    async fn download(&self, node_id: &str) -> Result<ByteStream>;

    /// Move a node to the trash and return its updated snapshot.
    async fn move_to_trash(&self, node_id: &str) -> Result<Node>;
}
