//! Jobs every worker and master can run: `server.sleep`, `server.shutdown`
//! and `server.status`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::ipc::message::{OP_JOBS_RUNNING, OP_SHUTDOWN};
use crate::ipc::{Envelope, Reply};
use crate::worker::registry::{JobContext, JobHandler, JobRegistry};

const DEFAULT_SLEEP_MS: u64 = 30_000;
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

fn timeout_option(options: Option<&Map<String, Value>>, default_ms: u64) -> Duration {
    let ms = options
        .and_then(|o| o.get("timeout"))
        .and_then(Value::as_u64)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Keeps a worker busy for `timeout` ms
pub struct SleepJob;

#[async_trait]
impl JobHandler for SleepJob {
    async fn run(&self, ctx: &JobContext, options: Option<&Map<String, Value>>) -> Result<()> {
        let duration = timeout_option(options, DEFAULT_SLEEP_MS);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.shutdown.cancelled() => {}
        }
        tracing::info!(job = %ctx.name, sleep_ms = duration.as_millis() as u64, "Sleep finished");
        Ok(())
    }
}

/// Asks the hosting master to shut down after `timeout` ms (default 0).
/// Used as the trailing `runlast` job on launched instances.
pub struct ShutdownJob;

#[async_trait]
impl JobHandler for ShutdownJob {
    async fn run(&self, ctx: &JobContext, options: Option<&Map<String, Value>>) -> Result<()> {
        let delay = timeout_option(options, 0);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &ctx.ipc {
            Some(ipc) => {
                tracing::info!("Requesting master shutdown");
                ipc.send(Envelope::new(OP_SHUTDOWN))?;
            }
            None => {
                tracing::info!("Shutting down");
                ctx.shutdown.cancel();
            }
        }
        Ok(())
    }
}

/// Logs the jobs the master currently has running
pub struct StatusJob;

#[async_trait]
impl JobHandler for StatusJob {
    async fn run(&self, ctx: &JobContext, _options: Option<&Map<String, Value>>) -> Result<()> {
        let Some(ipc) = &ctx.ipc else {
            tracing::info!("server.status has no master to ask");
            return Ok(());
        };
        match ipc
            .request(Envelope::new(OP_JOBS_RUNNING), STATUS_TIMEOUT)
            .await
        {
            Reply::Ack(msg) => {
                let running = msg.value.unwrap_or(Value::Null);
                tracing::info!(running = %running, "Master status");
            }
            Reply::Timeout(_) => tracing::warn!("Master did not answer status request"),
            Reply::Error(e) => tracing::warn!(error = %e, "Status request failed"),
        }
        Ok(())
    }
}

impl JobRegistry {
    /// Registry with the `server.*` jobs registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("server", "sleep", SleepJob)
            .register("server", "shutdown", ShutdownJob)
            .register("server", "status", StatusJob);
        registry
    }
}
