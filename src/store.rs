//! Host-scoped job submissions.
//!
//! Cron entries with a `host` are not run where they fire. They are written
//! to a [`JobStore`] and picked up by the master whose host name matches on
//! its next sweep.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cron::JobKind;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::JobDescriptor;

/// A job waiting in the store for its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedJob {
    /// SHA-256 of the job JSON, so resubmitting the same job replaces it
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Empty means any primary job server
    pub host: String,
    pub job: JobDescriptor,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub mtime: DateTime<Utc>,
}

impl SubmittedJob {
    pub fn new(kind: JobKind, host: impl Into<String>, job: JobDescriptor) -> Result<Self> {
        Ok(Self {
            id: job_id(&job)?,
            kind,
            host: host.into(),
            job,
            args: Map::new(),
            mtime: Utc::now(),
        })
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }
}

/// Hex SHA-256 of the descriptor's JSON form.
pub fn job_id(job: &JobDescriptor) -> Result<String> {
    let json = serde_json::to_vec(job)?;
    Ok(format!("{:x}", Sha256::digest(&json)))
}

/// Durable queue shared between masters.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a job. Returns false if an entry with the same id was replaced.
    async fn submit(&self, job: SubmittedJob) -> Result<bool>;

    /// Jobs addressed to any of `hosts`, oldest first.
    async fn claim(&self, hosts: &[String]) -> Result<Vec<SubmittedJob>>;

    /// Returns false if the job was already gone.
    async fn remove(&self, id: &str) -> Result<bool>;
}

/// In-process [`JobStore`], for a single master or tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<SubmittedJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<SubmittedJob>>> {
        self.jobs
            .lock()
            .map_err(|_| OrchestratorError::Store("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn submit(&self, job: SubmittedJob) -> Result<bool> {
        let mut jobs = self.lock()?;
        if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
            return Ok(false);
        }
        tracing::debug!(id = %job.id, host = %job.host, kind = %job.kind, "Job submitted");
        jobs.push(job);
        Ok(true)
    }

    async fn claim(&self, hosts: &[String]) -> Result<Vec<SubmittedJob>> {
        let jobs = self.lock()?;
        let mut claimed: Vec<SubmittedJob> = jobs
            .iter()
            .filter(|j| hosts.iter().any(|h| h == &j.host))
            .cloned()
            .collect();
        claimed.sort_by_key(|j| j.mtime);
        Ok(claimed)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        Ok(jobs.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn id_is_stable_hash_of_job_json() {
        let a = job_id(&JobDescriptor::single("a.run")).unwrap();
        let b = job_id(&JobDescriptor::single("a.run")).unwrap();
        let c = job_id(&JobDescriptor::single("b.run")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn claim_matches_hosts_only() {
        let store = MemoryJobStore::new();
        let web = SubmittedJob::new(JobKind::Local, "web1", JobDescriptor::single("a.run")).unwrap();
        let any = SubmittedJob::new(JobKind::Server, "", JobDescriptor::single("b.run")).unwrap();
        let other = SubmittedJob::new(JobKind::Local, "db1", JobDescriptor::single("c.run")).unwrap();
        store.submit(web.clone()).await.unwrap();
        store.submit(any.clone()).await.unwrap();
        store.submit(other).await.unwrap();

        let claimed = store.claim(&hosts(&["web1", "web1.local"])).await.unwrap();
        assert_eq!(claimed, vec![web.clone()]);

        let claimed = store.claim(&hosts(&["web1", ""])).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    #[tokio::test]
    async fn resubmitting_replaces_and_remove_deletes() {
        let store = MemoryJobStore::new();
        let job = SubmittedJob::new(JobKind::Local, "h", JobDescriptor::single("a.run")).unwrap();
        assert!(store.submit(job.clone()).await.unwrap());
        assert!(!store.submit(job.clone()).await.unwrap());
        assert_eq!(store.len(), 1);

        assert!(store.remove(&job.id).await.unwrap());
        assert!(!store.remove(&job.id).await.unwrap());
        assert!(store.is_empty());
    }
}
