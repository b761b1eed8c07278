//! Execution contexts for resources that must not be shared.
//!
//! Two building blocks, both used to respect the thread-affinity of the
//! connections they guard:
//! - [`WorkerPool`]: a bounded pool of lazily-created workers handed out one
//!   caller at a time through a scoped [`Pooled`] guard.
//! - [`SerialWorker`]: one dedicated thread owning a piece of state, fed by a
//!   job channel, giving a total order over everything done to that state.

pub mod error;
mod pool;
mod serial;

pub use crate::pool::{Pooled, WorkerPool, default_capacity};
pub use crate::serial::SerialWorker;
