use crate::error::{ErrorKind, Result};
use exn::OptionExt;
use futures::TryStreamExt;
use nimbus_cache::NodeCache;
use nimbus_remote::{ChangeSet, Checkpoint, Node, RemoteClient};
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

/// What one pull of the change log did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Change sets read from the log, empty ones included.
    pub changesets: usize,
    /// Node snapshots written (purged snapshots included).
    pub upserted: usize,
    /// Purged ids applied. Only counted when purges were requested.
    pub purged: usize,
    /// Whether the provider asked for a full rebuild at least once.
    pub full: bool,
    /// The checkpoint the cache now records, if this pull moved it.
    pub checkpoint: Option<Checkpoint>,
}

impl SyncReport {
    fn record(&mut self, changeset: &ChangeSet) {
        self.changesets += 1;
        self.upserted += changeset.nodes.len();
        self.purged += changeset.purged_nodes.len();
        if !changeset.is_empty() {
            self.checkpoint = Some(changeset.checkpoint.clone());
        }
    }
}

/// Cache bookkeeping, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub checkpoint: Option<Checkpoint>,
    pub last_sync: Option<UtcDateTime>,
    pub nodes: u64,
}

/// Keeps a [`NodeCache`] in step with the provider.
///
/// The controller holds no state of its own. Every mutation goes to the
/// provider first; the snapshot the provider returns is then written to the
/// cache, so the cache only ever holds what the provider confirmed.
pub struct SyncController {
    cache: NodeCache,
    remote: RemoteClient,
}

impl SyncController {
    pub fn new(cache: NodeCache, remote: RemoteClient) -> Self {
        Self { cache, remote }
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Pull the change log from the last recorded checkpoint and apply it.
    ///
    /// Change sets are applied in log order, each as one cache transaction
    /// that also records its checkpoint, so an error (or a dropped future)
    /// keeps every change set applied so far and nothing of the next one.
    ///
    /// Any change set flagged `reset` wipes the cache before its nodes are
    /// stored, wherever it appears in the log, and makes the rest of the
    /// pull a full rebuild.
    #[instrument(skip(self))]
    pub async fn pull(&self) -> Result<SyncReport> {
        let checkpoint = self.cache.get_checkpoint().await.map_err(ErrorKind::cache)?;
        // Purges only matter to a cache that already holds something.
        let include_purged = checkpoint.is_some();
        tracing::info!(checkpoint = ?checkpoint, include_purged, "syncing");

        let log = self.remote.get_changes(checkpoint, include_purged).await.map_err(ErrorKind::remote)?;
        let mut changes = std::pin::pin!(self.remote.iter_changes(log));
        let mut report = SyncReport::default();
        while let Some(changeset) = changes.try_next().await.map_err(ErrorKind::remote)? {
            let reset = changeset.reset;
            if reset {
                if report.changesets > 0 {
                    tracing::warn!(checkpoint = %changeset.checkpoint, "reset in the middle of the change log");
                }
                report.full = true;
            }
            tracing::debug!(
                checkpoint = %changeset.checkpoint,
                reset,
                nodes = changeset.nodes.len(),
                purged = changeset.purged_nodes.len(),
                "applying change set"
            );
            report.record(&changeset);
            self.cache.apply_changeset(changeset, reset, !report.full).await.map_err(ErrorKind::cache)?;
        }

        tracing::info!(
            changesets = report.changesets,
            upserted = report.upserted,
            purged = report.purged,
            full = report.full,
            "synced"
        );
        Ok(report)
    }

    /// [`pull`](Self::pull), reporting provider failures as `Ok(false)`.
    ///
    /// Progress made before the failure is kept; calling again resumes from
    /// the last applied checkpoint. Cache failures are still errors.
    pub async fn sync(&self) -> Result<bool> {
        match self.pull().await {
            Ok(_) => Ok(true),
            Err(error) if error.is_remote() => {
                tracing::error!(?error, "sync failed");
                Ok(false)
            },
            Err(error) => Err(error),
        }
    }

    /// Move a node to the trash and record the trashed snapshot.
    ///
    /// Returns `Ok(false)` if the provider refused.
    #[instrument(skip(self))]
    pub async fn trash(&self, node_id: &str) -> Result<bool> {
        let node = match self.remote.move_to_trash(node_id).await {
            Ok(node) => node,
            Err(error) => {
                tracing::error!(?error, "move to trash failed");
                return Ok(false);
            },
        };
        self.cache.insert_nodes(vec![node], true).await.map_err(ErrorKind::cache)?;
        Ok(true)
    }

    /// Create a folder under `parent` and return it as the cache now holds it.
    pub async fn create_directory(&self, parent: &Node, name: &str) -> Result<Node> {
        let node = self.remote.create_directory(parent, name).await.map_err(ErrorKind::remote)?;
        self.mirror(node).await
    }

    /// Upload a local file into `parent` and return it as the cache now
    /// holds it. The remote name is the local file name.
    pub async fn upload_file(&self, parent: &Node, local_path: impl AsRef<Path>) -> Result<Node> {
        let node = self.remote.upload_file(parent, local_path).await.map_err(ErrorKind::remote)?;
        self.mirror(node).await
    }

    /// Download a file node to `local_path`, returning the MD5 of what was
    /// written. Comparing it with `node.md5` is up to the caller.
    pub async fn download_node(&self, node: &Node, local_path: impl AsRef<Path>) -> Result<String> {
        self.remote.download_file(node, local_path).await.map_err(ErrorKind::remote)
    }

    async fn mirror(&self, node: Node) -> Result<Node> {
        let id = node.id.clone();
        self.cache.insert_nodes(vec![node], true).await.map_err(ErrorKind::cache)?;
        self.cache.get_node(&id).await.map_err(ErrorKind::cache)?.ok_or_raise(|| ErrorKind::Vanished(id.clone()))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn resolve_path(&self, remote_path: &str) -> Result<Option<Node>> {
        self.cache.resolve_path(remote_path).await.map_err(ErrorKind::cache)
    }

    pub async fn get_child(&self, parent: &Node, name: &str) -> Result<Option<Node>> {
        self.cache.get_child(parent, name).await.map_err(ErrorKind::cache)
    }

    pub async fn get_children(&self, parent: &Node) -> Result<Vec<Node>> {
        self.cache.get_children(parent).await.map_err(ErrorKind::cache)
    }

    pub async fn get_path(&self, node: &Node) -> Result<String> {
        self.cache.get_path(node).await.map_err(ErrorKind::cache)
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.cache.get_node(id).await.map_err(ErrorKind::cache)
    }

    pub async fn find_by_regex(&self, pattern: &str) -> Result<Vec<Node>> {
        self.cache.find_by_regex(pattern).await.map_err(ErrorKind::cache)
    }

    pub async fn status(&self) -> Result<Status> {
        Ok(Status {
            checkpoint: self.cache.get_checkpoint().await.map_err(ErrorKind::cache)?,
            last_sync: self.cache.get_last_sync_time().await.map_err(ErrorKind::cache)?,
            nodes: self.cache.count_nodes().await.map_err(ErrorKind::cache)?,
        })
    }

    /// Stop the network worker and close the cache.
    pub async fn close(&self) {
        self.remote.close();
        self.cache.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_cache::error::ErrorKind as CacheErrorKind;
    use nimbus_remote::api::MockApi;
    use nimbus_remote::error::ErrorKind as RemoteErrorKind;
    use nimbus_remote::{NodeStatus, RemoteHandle};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    async fn controller(api: &Arc<MockApi>) -> SyncController {
        let cache = NodeCache::open_in_memory().await.unwrap();
        let remote = RemoteClient::new(Arc::clone(api) as RemoteHandle).unwrap();
        SyncController::new(cache, remote)
    }

    async fn node_ids(controller: &SyncController) -> BTreeSet<String> {
        controller.cache().find_by_regex("").await.unwrap().into_iter().map(|n| n.id).collect()
    }

    fn file(id: &str, name: &str) -> Node {
        Node::file(id, name).with_parent("root")
    }

    #[tokio::test]
    async fn test_changesets_then_purge() {
        let api = Arc::new(MockApi::default());
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        let controller = controller(&api).await;

        assert!(controller.sync().await.unwrap());
        let node = controller.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.name, "a");
        assert_eq!(controller.status().await.unwrap().checkpoint, Some(Checkpoint::new("c1")));

        api.push_changes(ChangeSet::new("c2").with_purged(["n1"])).await;
        assert!(controller.sync().await.unwrap());
        assert!(controller.get_node("n1").await.unwrap().is_none());
        assert_eq!(controller.status().await.unwrap().checkpoint, Some(Checkpoint::new("c2")));
    }

    #[tokio::test]
    async fn test_first_pull_skips_purges_later_pulls_apply_them() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        api.push_changes(ChangeSet::new("c2").with_purged(["n1"])).await;
        let controller = controller(&api).await;

        // An empty cache has nothing to purge, so the log omits purges.
        let report = controller.pull().await.unwrap();
        assert_eq!(report.purged, 0);
        assert_eq!(report.checkpoint, Some(Checkpoint::new("c1")));
        assert!(controller.get_node("n1").await.unwrap().is_some());

        // The emptied c2 left the checkpoint at c1, so c2 is replayed with its purge.
        let report = controller.pull().await.unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.checkpoint, Some(Checkpoint::new("c2")));
        assert!(controller.get_node("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resync_without_changes_is_idempotent() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a"), file("n2", "b")])).await;
        let controller = controller(&api).await;

        assert!(controller.sync().await.unwrap());
        let nodes = node_ids(&controller).await;
        let checkpoint = controller.status().await.unwrap().checkpoint;

        let report = controller.pull().await.unwrap();
        assert_eq!(report.changesets, 0);
        assert_eq!(report.checkpoint, None);
        assert_eq!(node_ids(&controller).await, nodes);
        assert_eq!(controller.status().await.unwrap().checkpoint, checkpoint);
    }

    #[tokio::test]
    async fn test_checkpoint_is_last_non_empty_changeset() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        api.push_changes(ChangeSet::new("c2")).await;
        let controller = controller(&api).await;

        let report = controller.pull().await.unwrap();
        assert_eq!(report.changesets, 3);
        assert_eq!(report.checkpoint, Some(Checkpoint::new("c1")));
        let status = controller.status().await.unwrap();
        assert_eq!(status.checkpoint, Some(Checkpoint::new("c1")));
        assert!(status.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_reset_first_discards_earlier_nodes() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        let controller = controller(&api).await;
        controller.cache().insert_nodes(vec![file("stale", "old")], true).await.unwrap();

        let report = controller.pull().await.unwrap();
        assert!(report.full);
        assert_eq!(node_ids(&controller).await, BTreeSet::from(["n1".to_string(), "root".to_string()]));
    }

    #[tokio::test]
    async fn test_reset_mid_stream_wipes_again() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        api.push_changes(ChangeSet::new("c2").with_reset(true).with_nodes([Node::folder("root", ""), file("n2", "b")]))
            .await;
        api.push_changes(ChangeSet::new("c3").with_nodes([file("n3", "c")])).await;
        let controller = controller(&api).await;

        let report = controller.pull().await.unwrap();
        assert!(report.full);
        assert_eq!(report.changesets, 4);
        assert_eq!(
            node_ids(&controller).await,
            BTreeSet::from(["n2".to_string(), "n3".to_string(), "root".to_string()])
        );
        assert_eq!(controller.status().await.unwrap().checkpoint, Some(Checkpoint::new("c3")));
    }

    #[tokio::test]
    async fn test_failure_keeps_applied_changesets() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        api.push_changes(ChangeSet::new("c2").with_nodes([file("n2", "b")])).await;
        api.break_log_after(2).await;
        let controller = controller(&api).await;

        assert!(!controller.sync().await.unwrap());
        assert_eq!(controller.status().await.unwrap().checkpoint, Some(Checkpoint::new("c1")));
        assert!(controller.get_node("n1").await.unwrap().is_some());
        assert!(controller.get_node("n2").await.unwrap().is_none());

        // The next run resumes after c1.
        let report = controller.pull().await.unwrap();
        assert_eq!(report.changesets, 1);
        assert!(controller.get_node("n2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remote_failure_is_false_but_cache_failure_is_error() {
        let api = Arc::new(MockApi::with_root("root"));
        api.fail_next(RemoteErrorKind::Request("503: busy".into())).await;
        let controller = controller(&api).await;
        assert!(!controller.sync().await.unwrap());

        controller.cache().close().await;
        let err = controller.sync().await.unwrap_err();
        assert_eq!(*err, ErrorKind::Cache(CacheErrorKind::PoolClosed));
    }

    #[tokio::test]
    async fn test_trash_mirrors_the_trashed_snapshot() {
        let api = Arc::new(MockApi::with_root("root"));
        api.push_changes(ChangeSet::new("c1").with_nodes([file("n1", "a")])).await;
        let controller = controller(&api).await;
        controller.sync().await.unwrap();

        assert!(controller.trash("n1").await.unwrap());
        let node = controller.get_node("n1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Trashed);
        assert!(!controller.trash("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_directory_returns_cached_node() {
        let api = Arc::new(MockApi::with_root("root"));
        let controller = controller(&api).await;
        controller.sync().await.unwrap();
        let root = controller.resolve_path("/").await.unwrap().unwrap();

        let folder = controller.create_directory(&root, "photos").await.unwrap();
        assert!(folder.is_folder);
        assert_eq!(controller.get_path(&folder).await.unwrap(), "/photos");
        assert_eq!(controller.get_child(&root, "photos").await.unwrap(), Some(folder.clone()));

        let err = controller.create_directory(&root, "photos").await.unwrap_err();
        assert!(err.is_remote());

        // The mirrored snapshot is also in the log; syncing it changes nothing.
        assert!(controller.sync().await.unwrap());
        assert_eq!(controller.get_children(&root).await.unwrap(), vec![folder]);
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, b"hello world").unwrap();
        let api = Arc::new(MockApi::with_root("root"));
        let controller = controller(&api).await;
        controller.sync().await.unwrap();
        let root = controller.resolve_path("").await.unwrap().unwrap();

        let uploaded = controller.upload_file(&root, &source).await.unwrap();
        assert_eq!(uploaded.name, "notes.txt");
        assert_eq!(uploaded.md5.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(controller.resolve_path("/notes.txt").await.unwrap(), Some(uploaded.clone()));

        let target = dir.path().join("copy.txt");
        let digest = controller.download_node(&uploaded, &target).await.unwrap();
        assert_eq!(Some(digest), uploaded.md5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_broken_tree_asks_for_resync() {
        let api = Arc::new(MockApi::with_root("root"));
        let controller = controller(&api).await;
        controller.sync().await.unwrap();
        let orphan = Node::file("o1", "lost").with_parent("ghost");
        controller.cache().insert_nodes(vec![orphan.clone()], true).await.unwrap();

        let err = controller.get_path(&orphan).await.unwrap_err();
        assert!(err.needs_resync());
        assert_eq!(controller.find_by_regex("^lost$").await.unwrap(), vec![orphan]);
    }
}
