//! Fixed set of job slots backed by OS threads.
//!
//! The pool does not decide *what* runs. Queues hold a [`PoolGuard`] while
//! they inspect the running jobs, pick the next admissible one and dispatch
//! it, so the snapshot they decide on cannot change under them.

mod lod_counter;
mod pool;
mod slot;

pub use lod_counter::LodCounter;
pub use pool::{ContextSnapshot, PoolCallbacks, PoolGuard, WorkerPool};
pub use slot::{JobBody, JobCompletion, PoolJob, PoolJobKind};
