//! The single serialized session to the provider.

use crate::RemoteHandle;
use crate::api::ChangeStream;
use crate::error::{ErrorKind, Result};
use crate::models::{ChangeSet, Checkpoint, Node, NodeId};
use async_stream::stream;
use exn::ResultExt;
use futures::future::LocalBoxFuture;
use futures::{Stream, StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use nimbus_worker::SerialWorker;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const PART_SUFFIX: &str = ".nimbus-part";

/// An open change log, positioned by [`RemoteClient::get_changes`].
///
/// Consume it with [`RemoteClient::iter_changes`]; it cannot be rewound.
pub struct ChangeLog {
    stream: ChangeStream,
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog").finish_non_exhaustive()
    }
}

/// Owner of the one logical session to the provider.
///
/// Every call, including every pull from an open change log, runs on a
/// single dedicated worker thread, so at most one network operation is in
/// flight at a time and the session never sees two callers at once.
///
/// No call retries on its own.
pub struct RemoteClient {
    worker: SerialWorker<RemoteHandle>,
}

impl RemoteClient {
    pub fn new(api: RemoteHandle) -> Result<Self> {
        let name = format!("nimbus-remote-{}", api.name());
        let worker = SerialWorker::spawn(name, api).or_raise(|| ErrorKind::WorkerStopped)?;
        Ok(Self { worker })
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut RemoteHandle) -> LocalBoxFuture<'a, Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.worker.run(f).await.or_raise(|| ErrorKind::WorkerStopped)?
    }

    /// Open the change log after `checkpoint` (or from the beginning).
    pub async fn get_changes(&self, checkpoint: Option<Checkpoint>, include_purged: bool) -> Result<ChangeLog> {
        let stream = self
            .call(move |api| Box::pin(async move { api.get_changes(checkpoint.as_ref(), include_purged).await }))
            .await?;
        Ok(ChangeLog { stream })
    }

    /// Lazily decode an open change log.
    ///
    /// Each item is pulled on the network worker. The stream ends after the
    /// log is exhausted or after the first error.
    pub fn iter_changes(&self, log: ChangeLog) -> impl Stream<Item = Result<ChangeSet>> + Send + '_ {
        stream! {
            let mut pending = Some(log.stream);
            while let Some(stream) = pending.take() {
                let pulled = self
                    .worker
                    .run(move |_| {
                        Box::pin(async move {
                            let mut stream = stream;
                            let next = stream.next().await;
                            (stream, next)
                        })
                    })
                    .await
                    .or_raise(|| ErrorKind::WorkerStopped);
                match pulled {
                    Ok((stream, Some(Ok(changeset)))) => {
                        pending = Some(stream);
                        yield Ok(changeset);
                    },
                    Ok((_, Some(Err(error)))) | Err(error) => yield Err(error),
                    Ok((_, None)) => {},
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, parent), fields(parent = %parent.id))]
    pub async fn create_directory(&self, parent: &Node, name: &str) -> Result<Node> {
        let parent_id = parent.id.clone();
        let name = name.to_string();
        self.call(move |api| Box::pin(async move { api.create_folder(&parent_id, &name).await })).await
    }

    #[tracing::instrument(level = "debug", skip(self, parent, local_path), fields(parent = %parent.id, local_path = %local_path.as_ref().display()))]
    pub async fn upload_file(&self, parent: &Node, local_path: impl AsRef<Path>) -> Result<Node> {
        let parent_id = parent.id.clone();
        let local_path = local_path.as_ref().to_path_buf();
        self.call(move |api| Box::pin(async move { api.upload_file(&parent_id, &local_path).await })).await
    }

    /// Stream a file node's content to `local_path`, returning the MD5 of
    /// what was written as lowercase hex.
    ///
    /// Content lands in a sibling `.nimbus-part` file first and is renamed
    /// into place once complete; on failure the partial file is removed.
    /// The digest is not compared against the node's recorded MD5.
    #[tracing::instrument(level = "debug", skip(self, node, local_path), fields(node = %node.id, local_path = %local_path.as_ref().display()))]
    pub async fn download_file(&self, node: &Node, local_path: impl AsRef<Path>) -> Result<String> {
        let node_id = node.id.clone();
        let target = local_path.as_ref().to_path_buf();
        self.call(move |api| Box::pin(async move { download_into(api, &node_id, &target).await })).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn move_to_trash(&self, node_id: &str) -> Result<Node> {
        let node_id: NodeId = node_id.to_string();
        self.call(move |api| Box::pin(async move { api.move_to_trash(&node_id).await })).await
    }

    /// Stop the network worker. Calls already queued still run.
    pub fn close(&self) {
        self.worker.close();
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

async fn download_into(api: &RemoteHandle, node_id: &str, target: &Path) -> Result<String> {
    let partial = part_path(target);
    match write_hashed(api, node_id, &partial).await {
        Ok(digest) => {
            tokio::fs::rename(&partial, target).await.or_raise(|| ErrorKind::LocalIo(target.to_path_buf()))?;
            Ok(digest)
        },
        Err(error) => {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %partial.display(), error = %cleanup, "could not remove partial download");
            }
            Err(error)
        },
    }
}

async fn write_hashed(api: &RemoteHandle, node_id: &str, partial: &Path) -> Result<String> {
    let mut body = api.download(node_id).await?;
    let mut file = tokio::fs::File::create(partial).await.or_raise(|| ErrorKind::LocalIo(partial.to_path_buf()))?;
    let mut hasher = Md5::new();
    let mut written = 0u64;
    while let Some(chunk) = body.try_next().await? {
        hasher.update(&chunk);
        file.write_all(&chunk).await.or_raise(|| ErrorKind::LocalIo(partial.to_path_buf()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.or_raise(|| ErrorKind::LocalIo(partial.to_path_buf()))?;
    tracing::debug!(node = node_id, bytes = written, "download complete");
    Ok(hex::encode(hasher.finalize()))
}
