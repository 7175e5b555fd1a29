//! Cron-driven job dispatch.
//!
//! The crontab is a JSON array of entries:
//!
//! ```json
//! [
//!   { "type": "server", "cron": "0 */10 * * * *", "job": "server.status" },
//!   { "type": "local",  "cron": "0 10 7 * * *",   "job": "api.processQueue", "id": "q" },
//!   { "type": "remote", "cron": "0 5 * * * *",    "args": { "--max-workers": 2 },
//!     "job": { "scraper.run": { "url": "host1" }, "$scraper.run": { "url": "host2" } } }
//! ]
//! ```
//!
//! - `local` jobs go through admission and run in a worker process
//! - `server` jobs run inside the master
//! - `remote` jobs are launched on a new instance with `args`
//! - entries with a `host` are submitted to the shared job store instead

pub mod entry;
pub mod permissions;
pub mod scheduler;
pub mod watch;

pub use entry::{parse_crontab, CrontabEntry, JobKind};
pub use permissions::JobFilter;
pub use scheduler::{CronDispatch, CronScheduler};
pub use watch::CrontabWatcher;
