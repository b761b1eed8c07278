//! Connection-bound database worker.

use crate::db;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::future::LocalBoxFuture;
use nimbus_worker::SerialWorker;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteConnectOptions;

/// What lives on the worker thread: the connection, once it exists.
struct Slot {
    options: SqliteConnectOptions,
    /// In-memory databases can only be migrated by the connection that
    /// will use them.
    migrate: bool,
    conn: Option<SqliteConnection>,
}

impl Slot {
    async fn connection(&mut self) -> Result<&mut SqliteConnection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let mut conn = db::connect(&self.options).await?;
                if self.migrate {
                    db::migrate(&mut conn).await?;
                }
                tracing::debug!(thread = ?std::thread::current().name(), "opened cache connection");
                conn
            },
        };
        Ok(self.conn.insert(conn))
    }
}

/// One SQLite connection confined to one dedicated thread.
///
/// Neither the thread nor the connection exist until the first job; both
/// live until [`close`](Self::close) or drop.
pub(crate) struct DatabaseWorker {
    name: String,
    options: SqliteConnectOptions,
    migrate: bool,
    worker: Option<SerialWorker<Slot>>,
}

impl DatabaseWorker {
    pub(crate) fn new(name: String, options: SqliteConnectOptions, migrate: bool) -> Self {
        Self {
            name,
            options,
            migrate,
            worker: None,
        }
    }

    fn worker(&mut self) -> Result<&SerialWorker<Slot>> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                let slot = Slot {
                    options: self.options.clone(),
                    migrate: self.migrate,
                    conn: None,
                };
                SerialWorker::spawn(self.name.clone(), slot).or_raise(|| ErrorKind::Database)?
            },
        };
        Ok(self.worker.insert(worker))
    }

    /// Run `f` against this worker's connection, on the worker's thread.
    pub(crate) async fn with_connection<F, T>(&mut self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> LocalBoxFuture<'c, Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.worker()?
            .run(move |slot: &mut Slot| {
                Box::pin(async move {
                    let conn = slot.connection().await?;
                    f(conn).await
                })
            })
            .await
            .or_raise(|| ErrorKind::Database)?
    }

    /// Close the connection (if it was ever opened) and stop the thread.
    pub(crate) async fn close(mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let closed = worker
            .run(|slot: &mut Slot| {
                Box::pin(async move {
                    if let Some(conn) = slot.conn.take() {
                        db::close(conn).await;
                    }
                })
            })
            .await;
        if closed.is_err() {
            tracing::debug!(worker = %self.name, "worker already stopped");
        }
        worker.close();
    }
}
