use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{OrchestratorConfig, WorkerCommand};
use crate::error::{OrchestratorError, Result};
use crate::ipc::{Envelope, IpcReader, IpcWriter};
use crate::scheduler::JobDescriptor;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub(crate) fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Could not collect worker exit status");
                Self {
                    code: None,
                    signal: None,
                }
            }
        }
    }

    /// Anything but a clean zero exit
    pub fn is_abnormal(&self) -> bool {
        self.code != Some(0)
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Notifications from worker supervisor tasks to the orchestrator
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker said `ready`; its descriptor is being sent
    Ready { worker_id: u64 },
    /// Any other envelope from the worker
    Message { worker_id: u64, envelope: Envelope },
    /// The process is gone
    Exited { worker_id: u64, outcome: ExitOutcome },
}

/// One worker process and the jobs it is executing
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: u64,
    pub pid: Option<u32>,
    pub alive: bool,
    pub ready: bool,
    pub jobs: Vec<String>,
    pub started_at: Instant,
    outbox: mpsc::UnboundedSender<Envelope>,
    kill: CancellationToken,
}

/// Identifies a spawned worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: u64,
    pub pid: Option<u32>,
}

/// Owns the worker processes and enforces the concurrency ceiling.
///
/// One worker is spawned per admitted descriptor. A supervisor task per
/// worker forwards its messages and exit to the orchestrator as
/// [`WorkerEvent`]s.
#[derive(Debug)]
pub struct WorkerPool {
    command: WorkerCommand,
    max_workers: usize,
    ready_timeout: Duration,
    workers: HashMap<u64, WorkerRecord>,
    next_id: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    throttled_until: Option<Instant>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: &OrchestratorConfig,
        events_tx: mpsc::UnboundedSender<WorkerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            command: config.worker.clone(),
            max_workers: config.max_workers.max(1),
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            workers: HashMap::new(),
            next_id: 1,
            events_tx,
            throttled_until: None,
            shutdown,
        }
    }

    /// Live workers
    pub fn active(&self) -> usize {
        self.workers.values().filter(|w| w.alive).count()
    }

    /// Workers that may be spawned right now. Zero while throttled or exiting.
    pub fn free_slots(&self) -> usize {
        if self.shutdown.is_cancelled() || self.throttle_remaining().is_some() {
            return 0;
        }
        self.max_workers.saturating_sub(self.active())
    }

    /// Hold back new spawns for `delay`
    pub fn throttle(&mut self, delay: Duration) {
        let until = Instant::now() + delay;
        self.throttled_until = Some(match self.throttled_until {
            Some(current) if current > until => current,
            _ => until,
        });
    }

    pub fn throttled_until(&self) -> Option<Instant> {
        self.throttled_until.filter(|t| *t > Instant::now())
    }

    pub fn throttle_remaining(&self) -> Option<Duration> {
        self.throttled_until()
            .map(|t| t.saturating_duration_since(Instant::now()))
    }

    /// Start a worker for `descriptor`. The descriptor is buffered and sent
    /// once the worker reports ready.
    pub fn spawn(&mut self, descriptor: &JobDescriptor) -> Result<WorkerHandle> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(OrchestratorError::Internal(
                    "worker pipes not available".to_string(),
                ));
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let pid = child.id();

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        outbox_tx
            .send(Envelope::job(descriptor)?)
            .map_err(|_| OrchestratorError::Internal("worker outbox closed".to_string()))?;

        let kill = self.shutdown.child_token();
        tokio::spawn(supervise(Supervisor {
            worker_id: id,
            child,
            stdin,
            stdout,
            outbox: outbox_rx,
            events: self.events_tx.clone(),
            kill: kill.clone(),
            ready_timeout: self.ready_timeout,
        }));

        self.workers.insert(
            id,
            WorkerRecord {
                id,
                pid,
                alive: true,
                ready: false,
                jobs: descriptor.names().map(str::to_string).collect(),
                started_at: Instant::now(),
                outbox: outbox_tx,
                kill,
            },
        );
        tracing::info!(worker_id = id, pid = ?pid, job = %descriptor, active = self.active(), "Worker spawned");
        Ok(WorkerHandle { id, pid })
    }

    pub fn mark_ready(&mut self, worker_id: u64) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.ready = true;
        }
    }

    /// Queue an envelope for a worker; delivered after it is ready.
    pub fn send(&self, worker_id: u64, envelope: Envelope) -> Result<()> {
        let worker = self
            .workers
            .get(&worker_id)
            .ok_or(OrchestratorError::WorkerNotFound(worker_id))?;
        worker
            .outbox
            .send(envelope)
            .map_err(|e| OrchestratorError::Ipc(format!("worker {} gone, dropped {}", worker_id, e.0.op)))
    }

    /// Forget an exited worker and return its record.
    pub fn on_exit(&mut self, worker_id: u64) -> Option<WorkerRecord> {
        let mut record = self.workers.remove(&worker_id)?;
        record.alive = false;
        Some(record)
    }

    /// Kill a worker. Its exit arrives later as a [`WorkerEvent::Exited`].
    pub fn kill(&self, worker_id: u64) -> bool {
        match self.workers.get(&worker_id) {
            Some(worker) => {
                worker.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub fn kill_all(&self) {
        for worker in self.workers.values() {
            worker.kill.cancel();
        }
    }

    pub fn get(&self, worker_id: u64) -> Option<&WorkerRecord> {
        self.workers.get(&worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

struct Supervisor {
    worker_id: u64,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    kill: CancellationToken,
    ready_timeout: Duration,
}

/// Pumps one worker's pipes until its stdout closes, then reports the exit.
async fn supervise(mut sup: Supervisor) {
    let worker_id = sup.worker_id;
    let mut reader = IpcReader::new(sup.stdout);
    let mut writer = IpcWriter::new(sup.stdin);
    let mut ready = false;
    let ready_deadline = tokio::time::sleep(sup.ready_timeout);
    tokio::pin!(ready_deadline);

    loop {
        tokio::select! {
            _ = sup.kill.cancelled() => {
                tracing::info!(worker_id, "Killing worker");
                let _ = sup.child.start_kill();
                break;
            }
            _ = &mut ready_deadline, if !ready => {
                tracing::warn!(worker_id, timeout_ms = sup.ready_timeout.as_millis() as u64, "Worker never became ready");
                let _ = sup.child.start_kill();
                break;
            }
            msg = reader.recv() => match msg {
                Ok(Some(envelope)) if envelope.is_ready() && !ready => {
                    ready = true;
                    let _ = sup.events.send(WorkerEvent::Ready { worker_id });
                }
                Ok(Some(envelope)) => {
                    let _ = sup.events.send(WorkerEvent::Message { worker_id, envelope });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Worker pipe read failed, killing worker");
                    let _ = sup.child.start_kill();
                    break;
                }
            },
            Some(envelope) = sup.outbox.recv(), if ready => {
                if let Err(e) = writer.send(&envelope).await {
                    tracing::warn!(worker_id, error = %e, "Failed to send to worker");
                }
            }
        }
    }

    let outcome = ExitOutcome::from_status(sup.child.wait().await);
    let _ = sup.events.send(WorkerEvent::Exited { worker_id, outcome });
}
