use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use chrono::Local;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::cron::entry::{parse_crontab, CrontabEntry, JobKind};
use crate::cron::permissions::JobFilter;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::JobDescriptor;

/// A fired crontab entry, handed to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct CronDispatch {
    pub id: Option<String>,
    pub kind: JobKind,
    pub job: JobDescriptor,
    pub host: Option<String>,
    pub args: Map<String, Value>,
}

#[derive(Debug)]
struct ScheduledEntry {
    guid: Uuid,
    cron: String,
    dispatch: CronDispatch,
}

fn scheduler_error(e: JobSchedulerError) -> OrchestratorError {
    OrchestratorError::Scheduler(format!("{:?}", e))
}

/// Where cron triggers live once installed
#[async_trait]
trait TriggerTable: Send + Sync {
    async fn add(&self, job: Job) -> Result<Uuid>;
    async fn remove(&self, guid: &Uuid) -> Result<()>;
}

#[async_trait]
impl TriggerTable for JobScheduler {
    async fn add(&self, job: Job) -> Result<Uuid> {
        JobScheduler::add(self, job).await.map_err(scheduler_error)
    }

    async fn remove(&self, guid: &Uuid) -> Result<()> {
        JobScheduler::remove(self, guid).await.map_err(scheduler_error)
    }
}

/// Add every prepared trigger. On the first failure the ones already added
/// are removed again and the error is returned.
async fn install(
    triggers: &dyn TriggerTable,
    prepared: Vec<(Job, String, CronDispatch)>,
) -> Result<Vec<ScheduledEntry>> {
    let mut installed = Vec::with_capacity(prepared.len());
    for (job, cron, dispatch) in prepared {
        match triggers.add(job).await {
            Ok(guid) => {
                tracing::debug!(cron = %cron, kind = %dispatch.kind, job = %dispatch.job, "Cron trigger installed");
                installed.push(ScheduledEntry {
                    guid,
                    cron,
                    dispatch,
                });
            }
            Err(e) => {
                tracing::error!(cron = %cron, error = %e, "Failed to install cron trigger");
                uninstall(triggers, &installed).await;
                return Err(e);
            }
        }
    }
    Ok(installed)
}

async fn uninstall(triggers: &dyn TriggerTable, entries: &[ScheduledEntry]) {
    for entry in entries {
        if let Err(e) = triggers.remove(&entry.guid).await {
            tracing::warn!(cron = %entry.cron, error = %e, "Failed to remove cron trigger");
        }
    }
}

/// Table of live cron triggers.
///
/// Triggers only send a [`CronDispatch`] down a channel; routing by job kind
/// happens in the orchestrator loop. Reloads replace the whole table, and
/// only after every new entry has been validated.
pub struct CronScheduler {
    scheduler: JobScheduler,
    table: Vec<ScheduledEntry>,
    dispatch_tx: mpsc::UnboundedSender<CronDispatch>,
    filter: JobFilter,
}

impl CronScheduler {
    pub async fn new(
        filter: JobFilter,
        dispatch_tx: mpsc::UnboundedSender<CronDispatch>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler,
            table: Vec::new(),
            dispatch_tx,
            filter,
        })
    }

    /// Replace the trigger table. Nothing changes if any entry fails to build
    /// or install; old triggers are removed only once every new one is live.
    pub async fn load(&mut self, entries: &[CrontabEntry]) -> Result<usize> {
        let prepared = self.prepare(entries)?;
        let installed = install(&self.scheduler, prepared).await?;

        let old = std::mem::replace(&mut self.table, installed);
        uninstall(&self.scheduler, &old).await;

        tracing::info!(schedules = self.table.len(), "Crontab loaded");
        Ok(self.table.len())
    }

    /// Read, parse and load a crontab file. On any error the current table
    /// stays in place.
    pub async fn reload_from_file(&mut self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path).await?;
        let entries = parse_crontab(&text)?;
        self.load(&entries).await
    }

    /// Fire every entry with this id now. Returns how many fired.
    pub fn run_now(&self, id: &str) -> usize {
        let mut fired = 0;
        for entry in self
            .table
            .iter()
            .filter(|e| e.dispatch.id.as_deref() == Some(id))
        {
            if self.dispatch_tx.send(entry.dispatch.clone()).is_ok() {
                fired += 1;
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &CronDispatch> {
        self.table.iter().map(|e| &e.dispatch)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.table.clear();
        self.scheduler.shutdown().await.map_err(scheduler_error)
    }

    fn prepare(&self, entries: &[CrontabEntry]) -> Result<Vec<(Job, String, CronDispatch)>> {
        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| e.is_active()) {
            let descriptor = match JobDescriptor::from_value(entry.job.clone()) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!(id = ?entry.id, error = %e, "Skipping crontab entry");
                    continue;
                }
            };
            let Some(job) = self.filter.filter(entry.kind, descriptor) else {
                tracing::debug!(id = ?entry.id, kind = %entry.kind, "No allowed jobs in crontab entry");
                continue;
            };

            let dispatch = CronDispatch {
                id: entry.id.clone(),
                kind: entry.kind,
                job,
                host: entry.host.clone().filter(|h| !h.is_empty()),
                args: entry.args.clone(),
            };

            let tx = self.dispatch_tx.clone();
            let fired = dispatch.clone();
            let trigger = Job::new_async_tz(entry.cron.as_str(), Local, move |_uuid, _lock| {
                let tx = tx.clone();
                let fired = fired.clone();
                Box::pin(async move {
                    tracing::debug!(kind = %fired.kind, job = %fired.job, "Cron trigger fired");
                    if tx.send(fired).is_err() {
                        tracing::warn!("Cron dispatch dropped, orchestrator gone");
                    }
                })
            })
            .map_err(|e| {
                OrchestratorError::Crontab(format!("invalid cron '{}': {:?}", entry.cron, e))
            })?;

            prepared.push((trigger, entry.cron.clone(), dispatch));
        }
        Ok(prepared)
    }
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("table", &self.table)
            .field("filter", &self.filter)
            .finish()
    }
}
