//! The node cache facade.

use crate::db;
use crate::error::{ErrorKind, Result};
use crate::repo;
use crate::worker::DatabaseWorker;
use exn::ResultExt;
use futures::future::LocalBoxFuture;
use nimbus_remote::{ChangeSet, Checkpoint, Node, NodeId};
use nimbus_worker::WorkerPool;
use regex::Regex;
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::UtcDateTime;
use tracing::instrument;

/// Local mirror of the remote tree plus sync bookkeeping.
///
/// Every operation checks a database worker out of a bounded pool, runs
/// on that worker's own connection and thread, and hands the worker back,
/// whether or not the operation succeeded. Each write operation is one
/// transaction, so readers never observe half of it. Reads that take more
/// than one query also run inside a transaction, for a consistent snapshot.
///
/// Lookups report "not found" as `None`; it is not an error.
///
/// Cloning is cheap; clones share the pool.
///
/// # Examples
///
/// ```
/// use nimbus_cache::NodeCache;
/// use nimbus_remote::Node;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = NodeCache::open_in_memory().await.map_err(|e| e.to_string())?;
/// let root = Node::folder("root", "");
/// let docs = Node::folder("d1", "docs").with_parent("root");
/// cache.insert_nodes(vec![root, docs], false).await.map_err(|e| e.to_string())?;
///
/// let found = cache.resolve_path("/docs").await.map_err(|e| e.to_string())?;
/// assert_eq!(found.map(|n| n.id).as_deref(), Some("d1"));
/// # cache.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NodeCache {
    pool: WorkerPool<DatabaseWorker>,
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("capacity", &self.pool.capacity())
            .field("created", &self.pool.created())
            .finish()
    }
}

impl NodeCache {
    fn with_pool(workers: usize, options: sqlx::sqlite::SqliteConnectOptions, migrate: bool) -> Self {
        let sequence = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(workers, move || {
            let n = sequence.fetch_add(1, Ordering::Relaxed);
            DatabaseWorker::new(format!("nimbus-db-{n}"), options.clone(), migrate)
        });
        Self { pool }
    }

    /// Open (creating if needed) the cache file at `path`, served by up to
    /// `workers` connections.
    ///
    /// Migrations run here, once, before any worker exists.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, workers: usize) -> Result<Self> {
        let options = db::file_options(path.as_ref());
        let mut bootstrap = db::connect(&options).await?;
        db::migrate(&mut bootstrap).await?;
        db::close(bootstrap).await;
        Ok(Self::with_pool(workers, options, false))
    }

    /// Open a private in-memory cache.
    ///
    /// Note:
    /// - The data is gone once the cache is closed.
    /// - Served by a single worker: a second connection would see a
    ///   different, empty database.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::with_pool(1, db::memory_options(), true))
    }

    /// Shut the cache down.
    ///
    /// Later calls fail with [`ErrorKind::PoolClosed`]. Idle connections are
    /// closed now; busy ones when their operation finishes.
    pub async fn close(&self) {
        for worker in self.pool.close() {
            worker.close().await;
        }
    }

    /// Check out a worker and run `f` on its connection.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> LocalBoxFuture<'c, Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut worker = self.pool.acquire().await.or_raise(|| ErrorKind::PoolClosed)?;
        worker.with_connection(f).await
    }

    /// Same as [`run`](Self::run), inside a transaction that commits only if
    /// `f` succeeds.
    async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> LocalBoxFuture<'c, Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await.or_raise(|| ErrorKind::Database)?;
                let value = f(&mut *tx).await?;
                tx.commit().await.or_raise(|| ErrorKind::Database)?;
                Ok(value)
            })
        })
        .await
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// The node at a slash-separated path from the root. `""` and `"/"`
    /// are the root itself.
    pub async fn resolve_path(&self, remote_path: &str) -> Result<Option<Node>> {
        let remote_path = remote_path.to_string();
        self.transaction(move |conn| Box::pin(async move { repo::resolve_path(conn, &remote_path).await })).await
    }

    /// A direct child of `parent` by name. Prefers an available child over a
    /// trashed one with the same name.
    pub async fn get_child(&self, parent: &Node, name: &str) -> Result<Option<Node>> {
        let parent_id = parent.id.clone();
        let name = name.to_string();
        self.run(move |conn| Box::pin(async move { repo::select_child(conn, &parent_id, &name).await })).await
    }

    /// All children of `parent`: folders first, then by name, then by id.
    pub async fn get_children(&self, parent: &Node) -> Result<Vec<Node>> {
        let parent_id = parent.id.clone();
        self.run(move |conn| Box::pin(async move { repo::select_children(conn, &parent_id).await })).await
    }

    /// The absolute path of `node`, following its first parent at every
    /// level.
    ///
    /// Fails with [`ErrorKind::BrokenTree`] when an ancestor is missing from
    /// the cache, the links loop, or the walk ends somewhere other than the
    /// root.
    pub async fn get_path(&self, node: &Node) -> Result<String> {
        let node = node.clone();
        self.transaction(move |conn| Box::pin(async move { repo::path_of(conn, &node).await })).await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let id: NodeId = id.to_string();
        self.run(move |conn| Box::pin(async move { repo::select_node(conn, &id).await })).await
    }

    /// Every node whose name matches `pattern`, ordered by name then id.
    pub async fn find_by_regex(&self, pattern: &str) -> Result<Vec<Node>> {
        let regex = Regex::new(pattern).or_raise(|| ErrorKind::InvalidPattern(pattern.to_string()))?;
        let nodes = self.run(|conn| Box::pin(async move { repo::select_all(conn).await })).await?;
        Ok(nodes.into_iter().filter(|node| regex.is_match(&node.name)).collect())
    }

    /// The last applied checkpoint, or `None` if the cache has never synced.
    pub async fn get_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.run(|conn| Box::pin(async move { repo::get_checkpoint(conn).await })).await
    }

    pub async fn get_last_sync_time(&self) -> Result<Option<UtcDateTime>> {
        self.run(|conn| Box::pin(async move { repo::get_last_sync_time(conn).await })).await
    }

    pub async fn count_nodes(&self) -> Result<u64> {
        self.run(|conn| Box::pin(async move { repo::count_nodes(conn).await })).await
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Remove every node. Sync metadata is left for the caller to overwrite.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        self.transaction(|conn| Box::pin(async move { repo::delete_all(conn).await })).await
    }

    /// Delete nodes by id. Ids the cache doesn't have are ignored.
    pub async fn remove_purged(&self, ids: Vec<NodeId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let removed = self.transaction(move |conn| Box::pin(async move { repo::delete_nodes(conn, &ids).await })).await?;
        tracing::debug!(removed, "removed purged nodes");
        Ok(())
    }

    /// Upsert node snapshots (a `PURGED` snapshot deletes its node).
    ///
    /// `partial` marks one batch of an incremental apply; `false` marks a
    /// batch of a full rebuild, after which planner statistics are
    /// refreshed. The stored result is the same either way.
    pub async fn insert_nodes(&self, nodes: Vec<Node>, partial: bool) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.run(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await.or_raise(|| ErrorKind::Database)?;
                repo::upsert_nodes(&mut *tx, &nodes).await?;
                tx.commit().await.or_raise(|| ErrorKind::Database)?;
                if !partial {
                    db::optimize(conn).await;
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn update_last_sync_time(&self) -> Result<()> {
        self.run(|conn| Box::pin(async move { repo::touch_last_sync(conn).await })).await
    }

    pub async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.run(move |conn| Box::pin(async move { repo::set_checkpoint(conn, &checkpoint).await })).await
    }

    /// Apply a whole change set as ONE transaction: wipe everything (when
    /// `reset`) or remove its purged ids, upsert its nodes, stamp the sync
    /// time and, if it touched any node, record its checkpoint.
    ///
    /// Either all of that is visible afterwards or none of it, so the stored
    /// checkpoint never runs ahead of the stored nodes.
    #[instrument(skip(self, changeset), fields(checkpoint = %changeset.checkpoint))]
    pub async fn apply_changeset(&self, changeset: ChangeSet, reset: bool, partial: bool) -> Result<()> {
        self.run(move |conn| {
            Box::pin(async move {
                let mut tx = conn.begin().await.or_raise(|| ErrorKind::Database)?;
                repo::apply_changeset(&mut *tx, &changeset, reset).await?;
                tx.commit().await.or_raise(|| ErrorKind::Database)?;
                if !partial {
                    db::optimize(conn).await;
                }
                Ok(())
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_remote::NodeStatus;
    use rstest::rstest;

    /// root
    /// ├── docs/
    /// │   ├── a.txt
    /// │   └── b.txt (trashed)
    /// └── z.txt
    fn tree() -> Vec<Node> {
        vec![
            Node::folder("root", ""),
            Node::folder("d1", "docs").with_parent("root"),
            Node::file("f1", "a.txt").with_parent("d1").with_content("aa", 1),
            Node::file("f2", "b.txt").with_parent("d1").with_status(NodeStatus::Trashed),
            Node::file("f3", "z.txt").with_parent("root"),
        ]
    }

    async fn cache_with_tree() -> NodeCache {
        let cache = NodeCache::open_in_memory().await.unwrap();
        cache.insert_nodes(tree(), false).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_get_node_round_trips_every_field() {
        let cache = cache_with_tree().await;
        let node = cache.get_node("f1").await.unwrap().unwrap();
        assert_eq!(node, tree()[2]);
        assert!(cache.get_node("missing").await.unwrap().is_none());
    }

    #[rstest]
    #[case("", Some("root"))]
    #[case("/", Some("root"))]
    #[case("/docs", Some("d1"))]
    #[case("docs/a.txt", Some("f1"))]
    #[case("/docs//a.txt/", Some("f1"))]
    #[case("/docs/b.txt", Some("f2"))]
    #[case("/docs/nope.txt", None)]
    #[case("/z.txt/deeper", None)]
    #[tokio::test]
    async fn test_resolve_path(#[case] path: &str, #[case] expected: Option<&str>) {
        let cache = cache_with_tree().await;
        let node = cache.resolve_path(path).await.unwrap();
        assert_eq!(node.map(|n| n.id).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_resolve_path_without_root() {
        let cache = NodeCache::open_in_memory().await.unwrap();
        assert!(cache.resolve_path("/").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_round_trip_for_every_reachable_node() {
        let cache = cache_with_tree().await;
        for node in tree() {
            let path = cache.get_path(&node).await.unwrap();
            let resolved = cache.resolve_path(&path).await.unwrap().unwrap();
            assert_eq!(resolved.id, node.id, "path {path}");
        }
        assert_eq!(cache.get_path(&tree()[0]).await.unwrap(), "/");
        assert_eq!(cache.get_path(&tree()[2]).await.unwrap(), "/docs/a.txt");
    }

    #[tokio::test]
    async fn test_get_path_with_missing_parent_is_broken_tree() {
        let cache = cache_with_tree().await;
        let orphan = Node::file("o1", "lost.txt").with_parent("ghost");
        cache.insert_nodes(vec![orphan.clone()], true).await.unwrap();
        let err = cache.get_path(&orphan).await.unwrap_err();
        assert_eq!(*err, ErrorKind::BrokenTree("ghost".into()));
    }

    #[tokio::test]
    async fn test_get_path_with_cycle_is_broken_tree() {
        let cache = cache_with_tree().await;
        let x = Node::folder("x", "x").with_parent("y");
        let y = Node::folder("y", "y").with_parent("x");
        cache.insert_nodes(vec![x.clone(), y], true).await.unwrap();
        let err = cache.get_path(&x).await.unwrap_err();
        assert!(err.needs_resync());
    }

    #[tokio::test]
    async fn test_children_are_ordered_folders_first() {
        let cache = cache_with_tree().await;
        let root = cache.get_node("root").await.unwrap().unwrap();
        let names: Vec<String> = cache.get_children(&root).await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["docs", "z.txt"]);
        let docs = cache.get_node("d1").await.unwrap().unwrap();
        let names: Vec<String> = cache.get_children(&docs).await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_get_child_prefers_available() {
        let cache = cache_with_tree().await;
        let fresh = Node::file("f4", "b.txt").with_parent("d1");
        cache.insert_nodes(vec![fresh], true).await.unwrap();
        let docs = cache.get_node("d1").await.unwrap().unwrap();
        let child = cache.get_child(&docs, "b.txt").await.unwrap().unwrap();
        assert_eq!(child.id, "f4");
        assert!(cache.get_child(&docs, "c.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_regex() {
        let cache = cache_with_tree().await;
        let ids: Vec<String> = cache.find_by_regex(r"\.txt$").await.unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, ["f1", "f2", "f3"]);
        assert!(cache.find_by_regex("^nothing$").await.unwrap().is_empty());
        let err = cache.find_by_regex("(unclosed").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn test_remove_purged_ignores_unknown_ids() {
        let cache = cache_with_tree().await;
        cache.remove_purged(vec!["not-there".into()]).await.unwrap();
        assert_eq!(cache.count_nodes().await.unwrap(), 5);
        cache.remove_purged(vec!["f1".into(), "not-there".into()]).await.unwrap();
        assert_eq!(cache.count_nodes().await.unwrap(), 4);
        assert!(cache.get_node("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purged_snapshot_deletes_node() {
        let cache = cache_with_tree().await;
        let purged = Node::file("f3", "z.txt").with_parent("root").with_status(NodeStatus::Purged);
        cache.insert_nodes(vec![purged], true).await.unwrap();
        assert!(cache.get_node("f3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_parent_links() {
        let cache = cache_with_tree().await;
        let moved = Node::file("f3", "z.txt").with_parent("d1");
        cache.insert_nodes(vec![moved], true).await.unwrap();
        assert_eq!(cache.get_path(&cache.get_node("f3").await.unwrap().unwrap()).await.unwrap(), "/docs/z.txt");
        assert!(cache.resolve_path("/z.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_keeps_metadata() {
        let cache = cache_with_tree().await;
        cache.update_checkpoint(Checkpoint::new("c7")).await.unwrap();
        cache.reset().await.unwrap();
        assert_eq!(cache.count_nodes().await.unwrap(), 0);
        assert_eq!(cache.get_checkpoint().await.unwrap(), Some(Checkpoint::new("c7")));
    }

    #[tokio::test]
    async fn test_sync_metadata() {
        let cache = NodeCache::open_in_memory().await.unwrap();
        assert!(cache.get_checkpoint().await.unwrap().is_none());
        assert!(cache.get_last_sync_time().await.unwrap().is_none());
        let before = UtcDateTime::now().unix_timestamp();
        cache.update_last_sync_time().await.unwrap();
        cache.update_checkpoint(Checkpoint::new("c1")).await.unwrap();
        cache.update_checkpoint(Checkpoint::new("c2")).await.unwrap();
        assert_eq!(cache.get_checkpoint().await.unwrap(), Some(Checkpoint::new("c2")));
        let synced = cache.get_last_sync_time().await.unwrap().unwrap();
        assert!(synced.unix_timestamp() >= before);
    }

    #[tokio::test]
    async fn test_apply_changeset_with_reset_replaces_everything() {
        let cache = cache_with_tree().await;
        let changeset = ChangeSet::new("c9")
            .with_reset(true)
            .with_nodes([Node::folder("root2", ""), Node::file("n1", "new").with_parent("root2")]);
        cache.apply_changeset(changeset, true, false).await.unwrap();
        assert_eq!(cache.count_nodes().await.unwrap(), 2);
        assert_eq!(cache.get_checkpoint().await.unwrap(), Some(Checkpoint::new("c9")));
        assert_eq!(cache.resolve_path("/new").await.unwrap().map(|n| n.id).as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_apply_empty_changeset_keeps_checkpoint() {
        let cache = cache_with_tree().await;
        cache.update_checkpoint(Checkpoint::new("c1")).await.unwrap();
        cache.apply_changeset(ChangeSet::new("c2"), false, true).await.unwrap();
        assert_eq!(cache.get_checkpoint().await.unwrap(), Some(Checkpoint::new("c1")));
        assert!(cache.get_last_sync_time().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_apply_changes_nothing() {
        let cache = cache_with_tree().await;
        cache.update_checkpoint(Checkpoint::new("c1")).await.unwrap();
        // A size SQLite can't store fails the upsert after the purge ran.
        let changeset = ChangeSet::new("c2")
            .with_purged(["f1"])
            .with_nodes([Node::file("huge", "huge.bin").with_parent("root").with_content("x", u64::MAX)]);
        let err = cache.apply_changeset(changeset, false, true).await.unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("size"));
        assert!(cache.get_node("f1").await.unwrap().is_some());
        assert_eq!(cache.get_checkpoint().await.unwrap(), Some(Checkpoint::new("c1")));
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_calls() {
        let cache = cache_with_tree().await;
        cache.close().await;
        let err = cache.get_node("root").await.unwrap_err();
        assert_eq!(*err, ErrorKind::PoolClosed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_file_cache_serves_concurrent_readers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NodeCache::open(dir.path().join("nodes.db"), 3).await.unwrap();
        cache.insert_nodes(tree(), false).await.unwrap();
        let lookups = (0..12).map(|i| {
            let cache = cache.clone();
            async move { cache.resolve_path(if i % 2 == 0 { "/docs/a.txt" } else { "/z.txt" }).await }
        });
        let results = futures::future::join_all(lookups).await;
        assert!(results.into_iter().all(|r| r.unwrap().is_some()));
        assert!(cache.pool.created() <= 3);
        cache.close().await;

        // Migrations are already applied; reopening keeps the data.
        let reopened = NodeCache::open(dir.path().join("nodes.db"), 1).await.unwrap();
        assert_eq!(reopened.count_nodes().await.unwrap(), 5);
        reopened.close().await;
    }
}
