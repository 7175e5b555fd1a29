pub mod admission;
pub mod job;
pub mod pattern;
pub mod queue;

pub use admission::{Admission, AdmissionController, Deferral, RunningJobs};
pub use job::{JobDescriptor, JobOptions};
pub use pattern::{JobMatcher, JobPattern};
pub use queue::JobQueue;
