//! Test harness for orchestrator integration tests.
//!
//! Starts an in-process orchestrator whose workers are the real
//! `taskmaster worker` binary.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use taskmaster::config::{OrchestratorConfig, WorkerCommand};
use taskmaster::error::Result;
use taskmaster::orchestrator::{Orchestrator, OrchestratorHandle, Snapshot};
use taskmaster::remote::InstanceProvisioner;
use taskmaster::worker::registry::JobRegistry;

/// The crate's own binary in worker mode
pub fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_taskmaster")).arg("worker")
}

/// Orchestrator configuration with short timers for faster tests
pub fn test_config(max_workers: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(worker_command()).with_max_workers(max_workers);
    config.hostname = "test-node.local".to_string();
    config.ready_timeout_ms = 10_000;
    config.queue_interval_ms = 200;
    config.crontab_check_ms = 50;
    config.crash.interval_ms = 50;
    config.crash.delay_ms = 500;
    config
}

pub struct TestOrchestrator {
    pub handle: OrchestratorHandle,
    pub shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestOrchestrator {
    pub async fn start(config: OrchestratorConfig) -> Self {
        Self::start_with(config, JobRegistry::with_builtins(), None).await
    }

    pub async fn start_with(
        config: OrchestratorConfig,
        registry: JobRegistry,
        provisioner: Option<Arc<dyn InstanceProvisioner>>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (mut orchestrator, handle) =
            Orchestrator::new(config, Arc::new(registry), shutdown.clone())
                .expect("valid test config");
        if let Some(provisioner) = provisioner {
            orchestrator = orchestrator.with_provisioner(provisioner);
        }
        let task = tokio::spawn(orchestrator.run());
        Self {
            handle,
            shutdown,
            task: Some(task),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.handle.snapshot().await.expect("orchestrator running")
    }

    /// Wait until nothing is running, queued or alive
    pub async fn wait_idle(&self, timeout_duration: Duration) -> bool {
        wait_for(
            || async { self.snapshot().await.is_idle() },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Wait for the orchestrator task to finish on its own
    pub async fn wait_stopped(&mut self, timeout_duration: Duration) -> bool {
        let Some(task) = self.task.take() else {
            return true;
        };
        match tokio::time::timeout(timeout_duration, task).await {
            Ok(result) => {
                result.expect("orchestrator task panicked").expect("orchestrator failed");
                true
            }
            Err(_) => false,
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        assert!(
            self.wait_stopped(Duration::from_secs(10)).await,
            "orchestrator did not stop"
        );
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "Condition not met within {:?}: {}", timeout_duration, message);
}
