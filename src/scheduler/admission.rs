//! Admission control for job descriptors.
//!
//! A descriptor is evaluated entry by entry against the running set and the
//! pending queue. The first failing entry vetoes the whole descriptor, so
//! either every name is added to the running set or none is.

use std::collections::HashMap;

use crate::scheduler::job::{JobDescriptor, JobOptions};
use crate::scheduler::pattern::JobMatcher;
use crate::scheduler::queue::{JobQueue, QueuedJob};

/// Multiset of job names currently dispatched and not yet completed.
#[derive(Debug, Default, Clone)]
pub struct RunningJobs {
    counts: HashMap<String, usize>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    fn extend_from(&mut self, descriptor: &JobDescriptor) {
        for name in descriptor.names() {
            self.insert(name);
        }
    }

    /// Remove one occurrence of `name`. Returns false if it was not running.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.counts.get_mut(name) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(name);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.counts.contains_key(name)
    }

    pub fn any_matches(&self, matcher: &dyn JobMatcher) -> bool {
        self.counts.keys().any(|name| matcher.matches(name))
    }

    /// Total number of running jobs, counting repeats
    pub fn len(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sorted distinct names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counts.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Why a descriptor was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferral {
    /// No worker slot is free
    AtCapacity,
    /// The named job is already running
    AlreadyRunning(String),
    /// `runlast` entry while other jobs are running or queued
    OtherJobsPending(String),
    /// `runone` pattern matched a running job
    RunOneConflict(String),
    /// `runafter` pattern matched a running or queued job
    RunAfterConflict(String),
}

impl std::fmt::Display for Deferral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deferral::AtCapacity => write!(f, "max number of workers running"),
            Deferral::AlreadyRunning(name) => write!(f, "{} already running", name),
            Deferral::OtherJobsPending(name) => write!(f, "{}: other jobs still exist", name),
            Deferral::RunOneConflict(name) => write!(f, "{}: runone job still running", name),
            Deferral::RunAfterConflict(name) => write!(f, "{}: runafter job still exists", name),
        }
    }
}

/// Outcome of [`AdmissionController::try_admit`]
#[derive(Debug, Clone)]
pub enum Admission {
    /// Names were added to the running set; the caller must dispatch the descriptor
    Admitted(JobDescriptor),
    /// Appended to the pending queue
    Queued(Deferral),
    /// Dropped because of `skipqueue` or a full queue
    Rejected(Deferral),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }
}

/// Owns the running set and the pending queue
#[derive(Debug, Default)]
pub struct AdmissionController {
    running: RunningJobs,
    queue: JobQueue,
}

impl AdmissionController {
    pub fn new(max_queue: usize) -> Self {
        Self {
            running: RunningJobs::new(),
            queue: JobQueue::with_capacity(max_queue),
        }
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Evaluate a descriptor. `free_slots` is the number of workers that may
    /// still be spawned right now.
    pub fn try_admit(&mut self, descriptor: JobDescriptor, free_slots: usize) -> Admission {
        self.evaluate(QueuedJob::new(descriptor), free_slots)
    }

    /// Append to the pending queue without evaluating. Returns false if dropped.
    pub fn enqueue(&mut self, descriptor: JobDescriptor) -> bool {
        self.queue.push(descriptor)
    }

    /// One pass over the pending queue in FIFO order. Every entry present at the
    /// start is evaluated at most once; entries that still fail go to the back.
    /// Stops early when `free_slots` returns zero.
    pub fn drain<F>(&mut self, mut free_slots: F) -> Vec<JobDescriptor>
    where
        F: FnMut(usize) -> usize,
    {
        let mut admitted = Vec::new();
        let pending = self.queue.len();
        for _ in 0..pending {
            let slots = free_slots(admitted.len());
            if slots == 0 {
                break;
            }
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            if let Admission::Admitted(descriptor) = self.evaluate(job, slots) {
                admitted.push(descriptor);
            }
        }
        admitted
    }

    /// Record names as running outside of admission (in-process jobs).
    pub fn mark_running<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.running.insert(name);
        }
    }

    /// Remove completed names from the running set.
    pub fn complete<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if !self.running.remove(name) {
                tracing::debug!(job = name, "Completed job was not in the running set");
            }
        }
    }

    fn evaluate(&mut self, job: QueuedJob, free_slots: usize) -> Admission {
        if free_slots == 0 {
            let skip = job
                .descriptor
                .entries()
                .any(|(_, opts)| JobOptions::from_value(Some(opts)).skipqueue);
            return self.defer(job, Deferral::AtCapacity, skip);
        }

        let failure = job.descriptor.entries().find_map(|(name, value)| {
            let opts = JobOptions::from_value(Some(value));
            self.check_entry(name, &opts)
                .map(|reason| (reason, opts.skipqueue))
        });
        if let Some((reason, skip)) = failure {
            return self.defer(job, reason, skip);
        }

        self.running.extend_from(&job.descriptor);
        tracing::debug!(job = %job.descriptor, "Job admitted");
        Admission::Admitted(job.descriptor)
    }

    fn check_entry(&self, name: &str, opts: &JobOptions) -> Option<Deferral> {
        if self.running.contains(name) && !opts.runalways {
            return Some(Deferral::AlreadyRunning(name.to_string()));
        }
        if opts.runlast && (!self.running.is_empty() || !self.queue.is_empty()) {
            return Some(Deferral::OtherJobsPending(name.to_string()));
        }
        if let Some(pattern) = &opts.runone {
            if self.running.any_matches(pattern) {
                return Some(Deferral::RunOneConflict(name.to_string()));
            }
        }
        if let Some(pattern) = &opts.runafter {
            if self.running.any_matches(pattern) || self.queue.any_name_matches(pattern) {
                return Some(Deferral::RunAfterConflict(name.to_string()));
            }
        }
        None
    }

    fn defer(&mut self, job: QueuedJob, reason: Deferral, skip: bool) -> Admission {
        if skip {
            tracing::debug!(job = %job.descriptor, reason = %reason, "Job dropped (skipqueue)");
            return Admission::Rejected(reason);
        }
        tracing::debug!(job = %job.descriptor, reason = %reason, "Job queued");
        if self.queue.push_job(job) {
            Admission::Queued(reason)
        } else {
            Admission::Rejected(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(value: serde_json::Value) -> JobDescriptor {
        JobDescriptor::from_value(value).unwrap()
    }

    #[test]
    fn running_jobs_is_a_multiset() {
        let mut running = RunningJobs::new();
        running.insert("a.run");
        running.insert("a.run");
        assert_eq!(running.len(), 2);
        assert!(running.remove("a.run"));
        assert!(running.contains("a.run"));
        assert!(running.remove("a.run"));
        assert!(!running.contains("a.run"));
        assert!(!running.remove("a.run"));
    }

    #[test]
    fn same_name_is_queued_while_running() {
        let mut ac = AdmissionController::default();
        assert!(ac.try_admit(job(json!("server.sleep")), 2).is_admitted());

        let second = ac.try_admit(job(json!("server.sleep")), 2);
        match second {
            Admission::Queued(Deferral::AlreadyRunning(name)) => assert_eq!(name, "server.sleep"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ac.queue().len(), 1);
        assert_eq!(ac.running().len(), 1);
    }

    #[test]
    fn runalways_skips_conflict_check() {
        let mut ac = AdmissionController::default();
        assert!(ac.try_admit(job(json!("server.sleep")), 2).is_admitted());
        assert!(ac
            .try_admit(job(json!({"server.sleep": {"runalways": true}})), 2)
            .is_admitted());
        assert_eq!(ac.running().len(), 2);
    }

    #[test]
    fn capacity_queues_unless_skipqueue() {
        let mut ac = AdmissionController::default();
        assert!(matches!(
            ac.try_admit(job(json!("a.run")), 0),
            Admission::Queued(Deferral::AtCapacity)
        ));
        assert!(matches!(
            ac.try_admit(job(json!({"b.run": {"skipqueue": 1}})), 0),
            Admission::Rejected(Deferral::AtCapacity)
        ));
        assert_eq!(ac.queue().len(), 1);
    }

    #[test]
    fn skipqueue_drops_conflicting_job() {
        let mut ac = AdmissionController::default();
        ac.try_admit(job(json!("a.run")), 2);
        let res = ac.try_admit(job(json!({"a.run": {"skipqueue": true}})), 2);
        assert!(res.is_rejected());
        assert!(ac.queue().is_empty());
    }

    #[test]
    fn runlast_waits_for_running_and_queued() {
        let mut ac = AdmissionController::default();
        ac.try_admit(job(json!("b.run")), 2);

        let res = ac.try_admit(job(json!({"a.run": {"runlast": true}})), 2);
        assert!(matches!(res, Admission::Queued(Deferral::OtherJobsPending(_))));

        ac.complete(["b.run"]);
        let admitted = ac.drain(|_| 2);
        assert_eq!(admitted.len(), 1);
        assert!(admitted[0].contains("a.run"));
        assert!(ac.queue().is_empty());
    }

    #[test]
    fn runlast_blocked_by_queue_alone() {
        let mut ac = AdmissionController::default();
        ac.enqueue(job(json!("c.run")));
        let res = ac.try_admit(job(json!({"a.run": {"runlast": true}})), 2);
        assert!(res.is_queued());
        assert!(ac.running().is_empty());
    }

    #[test]
    fn runone_only_checks_running() {
        let mut ac = AdmissionController::default();
        ac.enqueue(job(json!("amazon.import")));
        assert!(ac
            .try_admit(job(json!({"imdb.sync": {"runone": "amazon"}})), 2)
            .is_admitted());

        ac.try_admit(job(json!("amazon.scan")), 2);
        let res = ac.try_admit(job(json!({"imdb.fetch": {"runone": "amazon"}})), 2);
        assert!(matches!(res, Admission::Queued(Deferral::RunOneConflict(_))));
    }

    #[test]
    fn runafter_sequences_jobs_submitted_together() {
        let mut ac = AdmissionController::default();
        assert!(ac.try_admit(job(json!("amazon.import")), 1).is_admitted());
        let res = ac.try_admit(job(json!({"imdb.sync": {"runafter": "amazon.import"}})), 1);
        assert!(matches!(res, Admission::Queued(Deferral::RunAfterConflict(_))));

        // Still running: drain re-queues it
        assert!(ac.drain(|_| 1).is_empty());
        assert_eq!(ac.queue().len(), 1);

        ac.complete(["amazon.import"]);
        let admitted = ac.drain(|_| 1);
        assert_eq!(admitted.len(), 1);
        assert!(ac.running().contains("imdb.sync"));
    }

    #[test]
    fn runafter_sees_queued_dependency() {
        let mut ac = AdmissionController::default();
        // No slot for the import, it waits in the queue
        assert!(ac.try_admit(job(json!("amazon.import")), 0).is_queued());
        let res = ac.try_admit(job(json!({"imdb.sync": {"runafter": "amazon"}})), 1);
        assert!(matches!(res, Admission::Queued(Deferral::RunAfterConflict(_))));
    }

    #[test]
    fn failing_entry_vetoes_whole_descriptor() {
        let mut ac = AdmissionController::default();
        ac.try_admit(job(json!("b.run")), 4);

        let res = ac.try_admit(job(json!({"a.run": {}, "c.run": {}, "b.run": {}})), 4);
        assert!(res.is_queued());
        assert!(!ac.running().contains("a.run"));
        assert!(!ac.running().contains("c.run"));
        assert_eq!(ac.running().len(), 1);
    }

    #[test]
    fn drain_preserves_fifo_and_stops_without_slots() {
        let mut ac = AdmissionController::default();
        ac.enqueue(job(json!("a.run")));
        ac.enqueue(job(json!("b.run")));
        ac.enqueue(job(json!("c.run")));

        // One slot, decreasing as jobs are admitted
        let admitted = ac.drain(|n| 1usize.saturating_sub(n));
        assert_eq!(admitted.len(), 1);
        assert!(admitted[0].contains("a.run"));
        let rest: Vec<_> = ac.queue().iter().map(|j| j.descriptor.job_names()).collect();
        assert_eq!(rest, vec!["b.run", "c.run"]);
    }

    #[test]
    fn repeated_names_are_distinct_running_entries() {
        let mut ac = AdmissionController::default();
        assert!(ac
            .try_admit(job(json!({"job.run": {}, "$job.run": {}})), 1)
            .is_admitted());
        assert!(ac.running().contains("job.run"));
        assert!(ac.running().contains("$job.run"));
    }
}
