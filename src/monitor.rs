//! The `monitor` role: keep a master process running.

use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::worker::crash::CrashGuard;
use crate::worker::pool::ExitOutcome;

/// Run the configured command and restart it whenever it exits, until
/// `shutdown` is cancelled.
///
/// Abnormal exits go through the [`CrashGuard`]; clean exits wait
/// `restart_delay_ms`. The child is killed when shutdown begins.
pub async fn run_monitor(config: MonitorConfig, shutdown: CancellationToken) -> Result<()> {
    let mut guard = CrashGuard::new(config.crash, shutdown.clone());
    let restart_delay = Duration::from_millis(config.restart_delay_ms);
    let mut restarts: u64 = 0;

    while !shutdown.is_cancelled() {
        let mut child = Command::new(&config.command.program)
            .args(&config.command.args)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        tracing::info!(pid = ?pid, restarts, program = %config.command.program.display(), "Process started");

        let status = tokio::select! {
            status = child.wait() => status,
            _ = shutdown.cancelled() => {
                tracing::info!(pid = ?pid, "Stopping process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to kill process");
                }
                break;
            }
        };

        let outcome = ExitOutcome::from_status(status);
        let delay = if outcome.is_abnormal() {
            tracing::warn!(pid = ?pid, code = ?outcome.code, signal = ?outcome.signal, "Process crashed");
            match guard.respawn_delay() {
                Some(delay) => delay,
                None => break,
            }
        } else {
            tracing::info!(pid = ?pid, "Process exited");
            restart_delay
        };

        tracing::info!(delay_ms = delay.as_millis() as u64, "Restarting process");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
        restarts += 1;
    }

    tracing::info!(restarts, "Monitor stopped");
    Ok(())
}
