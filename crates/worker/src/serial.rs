//! Single-consumer worker bound to one dedicated OS thread.
//!
//! A [`SerialWorker`] owns some state (a database connection, an HTTP
//! session) that must only ever be touched from one execution context. The
//! state is moved onto a dedicated thread running its own current-thread
//! Tokio runtime; callers submit jobs over a channel and await the reply.
//! Jobs run one at a time, in submission order.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, ()> + Send>;

/// Pins down the higher-ranked signature of a job closure.
fn job<S, F>(f: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// A dedicated thread that owns `S` and runs jobs against it in order.
///
/// Dropping the worker (or calling [`close`](Self::close)) closes the job
/// channel; the thread drains whatever was already queued and exits,
/// dropping the state on its own thread.
///
/// # Examples
///
/// ```
/// use nimbus_worker::SerialWorker;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let worker = SerialWorker::spawn("counter", 0u32).map_err(|e| e.to_string())?;
/// let value = worker
///     .run(|count| Box::pin(async move {
///         *count += 1;
///         *count
///     }))
///     .await
///     .map_err(|e| e.to_string())?;
/// assert_eq!(value, 1);
/// # Ok(())
/// # }
/// ```
pub struct SerialWorker<S> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job<S>>>>,
}

impl<S: Send + 'static> SerialWorker<S> {
    /// Move `state` onto a new named thread and start accepting jobs.
    pub fn spawn(name: impl Into<String>, state: S) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel::<Job<S>>();
        let thread_name = name.clone();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run_thread(thread_name, state, receiver))
            .or_raise(|| ErrorKind::WorkerStopped)?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
        })
    }

    fn run_thread(name: String, mut state: S, mut receiver: mpsc::UnboundedReceiver<Job<S>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(error) => {
                // Dropping the receiver makes every pending and future job
                // fail with `WorkerStopped`.
                tracing::error!(worker = %name, %error, "failed to start worker runtime");
                return;
            },
        };
        tracing::debug!(worker = %name, "worker started");
        runtime.block_on(async {
            while let Some(job) = receiver.recv().await {
                job(&mut state).await;
            }
        });
        tracing::debug!(worker = %name, "worker stopped");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker still accepts jobs.
    pub fn is_running(&self) -> bool {
        self.sender.lock().as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Run `f` against the worker's state on the worker thread and wait for
    /// its result.
    ///
    /// Fails with [`ErrorKind::WorkerStopped`] if the worker was closed, its
    /// thread is gone, or the job panicked.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut S) -> LocalBoxFuture<'a, T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job = job(move |state: &mut S| {
            Box::pin(async move {
                // The caller may have given up waiting; that's not our problem.
                let _ = reply.send(f(state).await);
            })
        });
        let sender = self.sender.lock().clone().ok_or_raise(|| ErrorKind::WorkerStopped)?;
        if sender.send(job).is_err() {
            exn::bail!(ErrorKind::WorkerStopped);
        }
        response.await.or_raise(|| ErrorKind::WorkerStopped)
    }

    /// Stop accepting jobs. Jobs already queued still run.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!(worker = %self.name, "closing worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::ThreadId;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_on_the_dedicated_thread() {
        let worker = SerialWorker::spawn("nimbus-test-thread", ()).unwrap();
        let here = std::thread::current().id();
        let ids: Vec<ThreadId> = futures::future::join_all(
            (0..4).map(|_| worker.run(|_| Box::pin(async { std::thread::current().id() }))),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_ne!(ids[0], here);
        let name = worker.run(|_| Box::pin(async { std::thread::current().name().map(String::from) })).await;
        assert_eq!(name.unwrap().as_deref(), Some("nimbus-test-thread"));
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let worker = SerialWorker::spawn("ordering", Vec::<u32>::new()).unwrap();
        let slow = worker.run(|log| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.push(1);
            })
        });
        let fast = worker.run(|log| Box::pin(async move { log.push(2) }));
        let (slow, fast) = futures::join!(slow, fast);
        slow.unwrap();
        fast.unwrap();
        let log = worker.run(|log| Box::pin(async move { log.clone() })).await.unwrap();
        assert_eq!(log, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_closed_worker_rejects_jobs() {
        let worker = SerialWorker::spawn("closing", ()).unwrap();
        assert!(worker.is_running());
        worker.close();
        assert!(!worker.is_running());
        let err = worker.run(|_| Box::pin(async {})).await.unwrap_err();
        assert_eq!(*err, ErrorKind::WorkerStopped);
    }

    #[tokio::test]
    async fn test_panicking_job_stops_worker() {
        let worker = SerialWorker::spawn("panics", ()).unwrap();
        let err = worker.run(|_| Box::pin(async { panic!("job exploded") })).await.map(|_: ()| ()).unwrap_err();
        assert_eq!(*err, ErrorKind::WorkerStopped);
        let err = worker.run(|_| Box::pin(async {})).await.unwrap_err();
        assert_eq!(*err, ErrorKind::WorkerStopped);
    }
}
