//! Bounded pool of long-lived workers.
//!
//! Workers are created lazily by a factory, up to the pool's capacity, and
//! recycled through an idle list. A caller that finds every worker busy is
//! suspended until one is returned. Waiters are served in FIFO order (the
//! pool is backed by a fair [`Semaphore`]), so no waiter starves while
//! workers keep being released.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type Factory<W> = Box<dyn Fn() -> W + Send + Sync>;

/// Number of workers used when the caller doesn't ask for a specific size:
/// one per available CPU.
pub fn default_capacity() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

struct Shared<W> {
    idle: Mutex<VecDeque<W>>,
    /// One permit per worker that may exist. Holding a permit is what makes
    /// a worker "busy".
    permits: Arc<Semaphore>,
    factory: Factory<W>,
    capacity: usize,
    created: AtomicUsize,
}

/// A bounded, lazily-populated pool of workers.
///
/// Cloning the pool is cheap and every clone hands out workers from the
/// same idle set.
///
/// # Examples
///
/// ```
/// use nimbus_worker::WorkerPool;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::new(2, || String::from("connection"));
/// let worker = pool.acquire().await.map_err(|e| e.to_string())?;
/// assert_eq!(worker.as_str(), "connection");
/// // Dropping the guard returns the worker to the idle set.
/// drop(worker);
/// assert_eq!(pool.idle(), 1);
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool<W> {
    shared: Arc<Shared<W>>,
}

impl<W> Clone for WorkerPool<W> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<W: Send + 'static> WorkerPool<W> {
    /// Create a pool holding at most `capacity` workers (at least one).
    pub fn new(capacity: usize, factory: impl Fn() -> W + Send + Sync + 'static) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                factory: Box::new(factory),
                capacity,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a pool sized to the number of available CPUs.
    pub fn with_default_capacity(factory: impl Fn() -> W + Send + Sync + 'static) -> Self {
        Self::new(default_capacity(), factory)
    }

    /// Maximum number of workers this pool will ever hold at once.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of workers currently sitting in the idle set.
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Total number of workers the factory has been asked to build.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.permits.is_closed()
    }

    /// Take a worker from the pool, waiting for one to be released if all
    /// of them are busy.
    ///
    /// Returns [`ErrorKind::PoolClosed`] if the pool is (or becomes) closed
    /// while waiting. The returned guard gives the worker back on drop, so
    /// the worker is released even when the operation using it fails.
    pub async fn acquire(&self) -> Result<Pooled<W>> {
        let permit = Arc::clone(&self.shared.permits).acquire_owned().await.or_raise(|| ErrorKind::PoolClosed)?;
        // Holding a permit guarantees idle + busy never exceeds capacity, so
        // creating a worker when the idle set is empty stays within bounds.
        let recycled = self.shared.idle.lock().pop_front();
        let worker = match recycled {
            Some(worker) => worker,
            None => {
                let count = self.shared.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(created = count, capacity = self.shared.capacity, "spawning pool worker");
                (self.shared.factory)()
            },
        };
        Ok(Pooled {
            worker: Some(worker),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Return a worker to the idle set and wake exactly one waiter.
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, worker: Pooled<W>) {
        drop(worker);
    }

    /// Shut the pool down.
    ///
    /// Pending and future [`acquire`](Self::acquire) calls fail with
    /// [`ErrorKind::PoolClosed`]. The idle workers are handed back so the
    /// caller can tear them down; busy workers are dropped when their guards
    /// are released.
    pub fn close(&self) -> Vec<W> {
        // Closing under the idle lock orders every release either before the
        // drain (handed back here) or after it (dropped by the guard).
        let mut idle = self.shared.idle.lock();
        self.shared.permits.close();
        idle.drain(..).collect()
    }
}

/// A worker checked out of a [`WorkerPool`].
///
/// Dereferences to the worker. Dropping the guard puts the worker back into
/// the idle set before the permit is released, so the woken waiter always
/// finds it there.
pub struct Pooled<W> {
    worker: Option<W>,
    shared: Arc<Shared<W>>,
    // Field order matters: this must drop after `Drop::drop` has run.
    _permit: OwnedSemaphorePermit,
}

impl<W> Deref for Pooled<W> {
    type Target = W;
    fn deref(&self) -> &W {
        // Only `Drop` takes the worker out.
        self.worker.as_ref().unwrap_or_else(|| unreachable!("pooled worker taken before drop"))
    }
}

impl<W> DerefMut for Pooled<W> {
    fn deref_mut(&mut self) -> &mut W {
        self.worker.as_mut().unwrap_or_else(|| unreachable!("pooled worker taken before drop"))
    }
}

impl<W> Drop for Pooled<W> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let mut idle = self.shared.idle.lock();
        if self.shared.permits.is_closed() {
            drop(idle);
            tracing::debug!("pool closed, dropping released worker");
            return;
        }
        idle.push_back(worker);
    }
}
