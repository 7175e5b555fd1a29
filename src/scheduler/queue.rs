use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scheduler::job::JobDescriptor;
use crate::scheduler::pattern::JobMatcher;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// A descriptor waiting for admission
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub descriptor: JobDescriptor,
    pub queued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            queued_at: Utc::now(),
        }
    }
}

/// FIFO of descriptors that failed admission
#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<QueuedJob>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_jobs,
        }
    }

    /// Append a descriptor. Returns false if the queue is at capacity.
    pub fn push(&mut self, descriptor: JobDescriptor) -> bool {
        self.push_job(QueuedJob::new(descriptor))
    }

    /// Re-append an existing entry, keeping its id and queue time.
    pub fn push_job(&mut self, job: QueuedJob) -> bool {
        if self.jobs.len() >= self.max_jobs {
            tracing::warn!(job = %job.descriptor, "Job queue at capacity, job dropped");
            return false;
        }
        self.jobs.push_back(job);
        true
    }

    pub fn pop_front(&mut self) -> Option<QueuedJob> {
        self.jobs.pop_front()
    }

    /// True if any name inside any queued descriptor matches
    pub fn any_name_matches(&self, matcher: &dyn JobMatcher) -> bool {
        self.jobs
            .iter()
            .any(|job| job.descriptor.names().any(|name| matcher.matches(name)))
    }

    /// Queued descriptors in FIFO order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.jobs.iter()
    }

    /// Returns the current number of queued descriptors
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
