//! Worker processes and everything that runs jobs.
//!
//! # Components
//!
//! - [`WorkerPool`]: spawns worker processes, pumps their IPC, reports exits
//! - [`CrashGuard`]: respawn delay after abnormal exits
//! - [`JobRegistry`] / [`JobHandler`]: `component.method` to handler lookup
//! - [`JobExecutor`]: runs every entry of a descriptor concurrently
//! - [`run_worker`](runtime::run_worker): the worker process side of the protocol
//!
//! # Worker lifecycle
//!
//! 1. The master admits a descriptor and [`WorkerPool::spawn`]s `taskmaster worker`
//! 2. The worker sends `ready`; only then does the master send `job:run`
//! 3. The worker runs all entries, sending `job:done` for each
//! 4. The worker exits (0, or 1 when nothing in the descriptor could run)
//! 5. The exit releases the job names and, if abnormal, feeds the crash guard

pub mod builtin;
pub mod crash;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod runtime;

pub use crash::CrashGuard;
pub use executor::JobExecutor;
pub use pool::{ExitOutcome, WorkerEvent, WorkerPool};
pub use registry::{JobContext, JobHandler, JobRegistry};
