use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::ipc::IpcSender;
use crate::scheduler::JobDescriptor;
use crate::worker::registry::{JobContext, JobRegistry};

/// Result of one descriptor entry
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub name: String,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn from_result(name: String, result: Result<()>) -> Self {
        match result {
            Ok(()) => Self { name, error: None },
            Err(e) => Self {
                name,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Entries of one descriptor running concurrently
pub struct Dispatch {
    tasks: JoinSet<ExecutionResult>,
    /// Names that resolved to a handler and were started
    pub started: Vec<String>,
    /// Names with no registered handler
    pub unknown: Vec<String>,
}

impl Dispatch {
    /// Next entry to finish, or `None` once all have.
    pub async fn next(&mut self) -> Option<ExecutionResult> {
        loop {
            match self.tasks.join_next().await? {
                Ok(result) => return Some(result),
                Err(e) => tracing::error!(error = %e, "Job task aborted"),
            }
        }
    }

    pub async fn join_all(mut self) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(self.started.len());
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }
}

/// Runs descriptor entries through the job registry.
///
/// All entries of a descriptor start at once; there is no ordering among them.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    registry: Arc<JobRegistry>,
}

impl JobExecutor {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Split names into `(known, unknown)` without running anything.
    pub fn partition(&self, descriptor: &JobDescriptor) -> (Vec<String>, Vec<String>) {
        descriptor
            .names()
            .map(str::to_string)
            .partition(|name| self.registry.contains(name))
    }

    /// Start every entry of `descriptor`. Unknown names are logged and skipped.
    pub fn dispatch(
        &self,
        descriptor: &JobDescriptor,
        ipc: Option<IpcSender>,
        shutdown: CancellationToken,
    ) -> Dispatch {
        let mut tasks = JoinSet::new();
        let mut started = Vec::new();
        let mut unknown = Vec::new();

        for name in descriptor.names() {
            let Some(handler) = self.registry.resolve(name) else {
                let error = OrchestratorError::UnknownJob(name.to_string());
                tracing::error!(error = %error, descriptor = %descriptor, "Skipping job");
                unknown.push(name.to_string());
                continue;
            };

            let options = descriptor.payload(name).cloned();
            let ctx = JobContext {
                name: name.to_string(),
                ipc: ipc.clone(),
                shutdown: shutdown.clone(),
            };
            tracing::info!(job = name, options = ?options, "Job started");

            tasks.spawn(async move {
                let job_name = ctx.name.clone();
                // Inner task so a panicking handler still reports its name
                let run = tokio::spawn(async move { handler.run(&ctx, options.as_ref()).await });
                match run.await {
                    Ok(result) => ExecutionResult::from_result(job_name, result),
                    Err(e) => ExecutionResult::from_result(
                        job_name,
                        Err(OrchestratorError::JobFailed(format!("panicked: {}", e))),
                    ),
                }
            });
            started.push(name.to_string());
        }

        Dispatch {
            tasks,
            started,
            unknown,
        }
    }

    /// Run every entry and wait for all of them.
    pub async fn execute(
        &self,
        descriptor: &JobDescriptor,
        ipc: Option<IpcSender>,
        shutdown: CancellationToken,
    ) -> Vec<ExecutionResult> {
        self.dispatch(descriptor, ipc, shutdown).join_all().await
    }
}
