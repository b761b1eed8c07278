//! Queries against a single connection.
//!
//! Nothing here opens transactions; callers decide the unit of atomicity
//! and pass either a bare connection or an open transaction.

use crate::error::{ErrorKind, Result};
use crate::models::NodeRow;
use exn::{OptionExt, ResultExt};
use nimbus_remote::{ChangeSet, Checkpoint, Node, NodeId};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use time::UtcDateTime;

pub(crate) const CHECKPOINT_KEY: &str = "checkpoint";
pub(crate) const LAST_SYNC_KEY: &str = "last_sync";
/// Deeper than any real tree; anything past this is a loop we failed to
/// spot or a corrupt cache.
pub(crate) const MAX_DEPTH: usize = 4096;

fn rows_to_nodes(rows: Vec<NodeRow>) -> Result<Vec<Node>> {
    rows.into_iter().map(Node::try_from).collect()
}

// =============================================================================
// Reads
// =============================================================================

pub(crate) async fn select_node(conn: &mut SqliteConnection, id: &str) -> Result<Option<Node>> {
    let row: Option<NodeRow> = sqlx::query_as(include_str!("../queries/select_node.sql"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(Node::try_from).transpose()
}

pub(crate) async fn select_root(conn: &mut SqliteConnection) -> Result<Option<Node>> {
    let row: Option<NodeRow> = sqlx::query_as(include_str!("../queries/select_root.sql"))
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(Node::try_from).transpose()
}

pub(crate) async fn select_child(conn: &mut SqliteConnection, parent_id: &str, name: &str) -> Result<Option<Node>> {
    let row: Option<NodeRow> = sqlx::query_as(include_str!("../queries/select_child.sql"))
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(Node::try_from).transpose()
}

pub(crate) async fn select_children(conn: &mut SqliteConnection, parent_id: &str) -> Result<Vec<Node>> {
    let rows: Vec<NodeRow> = sqlx::query_as(include_str!("../queries/select_children.sql"))
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    rows_to_nodes(rows)
}

pub(crate) async fn select_all(conn: &mut SqliteConnection) -> Result<Vec<Node>> {
    let rows: Vec<NodeRow> = sqlx::query_as(include_str!("../queries/select_all.sql"))
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    rows_to_nodes(rows)
}

pub(crate) async fn count_nodes(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
        .fetch_one(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    u64::try_from(count).or_raise(|| ErrorKind::InvalidData("node count"))
}

/// Walk from the root, one name at a time. Empty segments are ignored, so
/// `""`, `"/"` and `"//"` all name the root.
pub(crate) async fn resolve_path(conn: &mut SqliteConnection, path: &str) -> Result<Option<Node>> {
    let Some(mut current) = select_root(conn).await? else {
        return Ok(None);
    };
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match select_child(conn, &current.id, segment).await? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Rebuild the path of `node` by following its first parent up to the root.
pub(crate) async fn path_of(conn: &mut SqliteConnection, node: &Node) -> Result<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut current = node.clone();
    while let Some(parent_id) = current.parent_ids.first().cloned() {
        if !visited.insert(current.id.clone()) || segments.len() >= MAX_DEPTH {
            exn::bail!(ErrorKind::BrokenTree(current.id));
        }
        segments.push(std::mem::take(&mut current.name));
        current = select_node(conn, &parent_id).await?.ok_or_raise(|| ErrorKind::BrokenTree(parent_id.clone()))?;
    }
    // A walk that stops anywhere but the root (a parentless file, a trashed
    // top-level folder) cannot be expressed as a path.
    if !current.is_root() {
        exn::bail!(ErrorKind::BrokenTree(current.id));
    }
    segments.reverse();
    Ok(format!("/{}", segments.join("/")))
}

pub(crate) async fn get_metadata(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

pub(crate) async fn get_checkpoint(conn: &mut SqliteConnection) -> Result<Option<Checkpoint>> {
    Ok(get_metadata(conn, CHECKPOINT_KEY).await?.map(Checkpoint::new))
}

pub(crate) async fn get_last_sync_time(conn: &mut SqliteConnection) -> Result<Option<UtcDateTime>> {
    let Some(value) = get_metadata(conn, LAST_SYNC_KEY).await? else {
        return Ok(None);
    };
    let seconds: i64 = value.parse::<i64>().or_raise(|| ErrorKind::InvalidData("last sync time"))?;
    UtcDateTime::from_unix_timestamp(seconds).map(Some).or_raise(|| ErrorKind::InvalidData("last sync time"))
}

// =============================================================================
// Writes
// =============================================================================

pub(crate) async fn delete_all(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM parentage").execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    sqlx::query("DELETE FROM nodes").execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Delete nodes by id. Unknown ids are ignored.
pub(crate) async fn delete_nodes(conn: &mut SqliteConnection, ids: &[NodeId]) -> Result<u64> {
    let mut deleted = 0;
    for id in ids {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        deleted += result.rows_affected();
    }
    Ok(deleted)
}

/// Upsert node snapshots, replacing their parent links. Purged snapshots
/// delete the node instead.
pub(crate) async fn upsert_nodes(conn: &mut SqliteConnection, nodes: &[Node]) -> Result<()> {
    for node in nodes {
        if node.is_purged() {
            delete_nodes(conn, std::slice::from_ref(&node.id)).await?;
            continue;
        }
        let size = node.size.map(i64::try_from).transpose().or_raise(|| ErrorKind::InvalidData("size"))?;
        sqlx::query(include_str!("../queries/upsert_node.sql"))
            .bind(&node.id)
            .bind(&node.name)
            .bind(node.is_folder)
            .bind(node.status.as_str())
            .bind(&node.md5)
            .bind(size)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query("DELETE FROM parentage WHERE child = ?1")
            .bind(&node.id)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for parent_id in &node.parent_ids {
            sqlx::query("INSERT OR IGNORE INTO parentage (parent, child) VALUES (?1, ?2)")
                .bind(parent_id)
                .bind(&node.id)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
    }
    Ok(())
}

pub(crate) async fn set_metadata(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(include_str!("../queries/set_metadata.sql"))
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

pub(crate) async fn set_checkpoint(conn: &mut SqliteConnection, checkpoint: &Checkpoint) -> Result<()> {
    set_metadata(conn, CHECKPOINT_KEY, checkpoint.as_str()).await
}

pub(crate) async fn touch_last_sync(conn: &mut SqliteConnection) -> Result<()> {
    set_metadata(conn, LAST_SYNC_KEY, &UtcDateTime::now().unix_timestamp().to_string()).await
}

/// Apply one change set in order: wipe (or purge), upsert, stamp the sync
/// time, then advance the checkpoint if anything changed.
pub(crate) async fn apply_changeset(conn: &mut SqliteConnection, changeset: &ChangeSet, reset: bool) -> Result<()> {
    if reset {
        delete_all(conn).await?;
    } else {
        delete_nodes(conn, &changeset.purged_nodes).await?;
    }
    upsert_nodes(conn, &changeset.nodes).await?;
    touch_last_sync(conn).await?;
    if !changeset.is_empty() {
        set_checkpoint(conn, &changeset.checkpoint).await?;
    }
    Ok(())
}
