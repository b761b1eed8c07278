//! SQLite connection setup.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

/// Embedded migrations, applied once when a cache is opened.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Options for the cache file at `path`, created if missing.
pub(crate) fn file_options(path: &Path) -> SqliteConnectOptions {
    base_options().filename(path).create_if_missing(true)
}

/// Options for a private in-memory database.
///
/// Every connection made with these options sees its own empty database,
/// so an in-memory cache must stay on a single connection.
pub(crate) fn memory_options() -> SqliteConnectOptions {
    base_options().filename(":memory:")
}

fn base_options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        // WAL lets the pool's readers run alongside the one writer.
        .journal_mode(SqliteJournalMode::Wal)
        // Parent links cascade away with their child.
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        // Several workers share one file; a full-rebuild transaction can
        // hold the write lock for a while.
        .busy_timeout(Duration::from_secs(5))
        .auto_vacuum(SqliteAutoVacuum::None)
        // Statement logging is far too chatty for a change-log apply.
        .disable_statement_logging()
}

/// Open one connection and apply the PRAGMAs not covered by the options.
pub(crate) async fn connect(options: &SqliteConnectOptions) -> Result<SqliteConnection> {
    let mut conn = options.connect().await.or_raise(|| ErrorKind::Database)?;
    sqlx::query(
        r#"
            PRAGMA wal_autocheckpoint = 800;
            PRAGMA cache_size = -8192;
            PRAGMA temp_store = MEMORY;
            PRAGMA analysis_limit = 1000;
        "#,
    )
    .execute(&mut conn)
    .await
    .or_raise(|| ErrorKind::Database)?;
    Ok(conn)
}

#[instrument("performing database migrations", skip(conn))]
pub(crate) async fn migrate(conn: &mut SqliteConnection) -> Result<()> {
    MIGRATOR.run(conn).await.or_raise(|| ErrorKind::Migration)
}

/// Refresh planner statistics. Failures are harmless and ignored.
pub(crate) async fn optimize(conn: &mut SqliteConnection) {
    if let Err(error) = sqlx::query("PRAGMA optimize").execute(conn).await {
        tracing::debug!(%error, "PRAGMA optimize failed");
    }
}

/// Close a connection cleanly, letting SQLite update planner statistics
/// on the way out.
pub(crate) async fn close(mut conn: SqliteConnection) {
    optimize(&mut conn).await;
    if let Err(error) = conn.close().await {
        tracing::warn!(%error, "failed to close cache connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let mut conn = connect(&memory_options()).await.unwrap();
        migrate(&mut conn).await.unwrap();
        migrate(&mut conn).await.unwrap();
        close(conn).await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let mut conn = connect(&memory_options()).await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(&mut conn).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        let row: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(&mut conn).await.unwrap();
        assert_eq!(row.0, 800, "WAL checkpoint should be 800");
        close(conn).await;
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.db");
        let mut conn = connect(&file_options(&path)).await.unwrap();
        migrate(&mut conn).await.unwrap();
        close(conn).await;
        assert!(path.exists());
    }
}
