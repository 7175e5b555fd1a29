//! The master's control loop.
//!
//! All coordination state (running set, pending queue, crash state, cron
//! table, worker table) lives in one [`Orchestrator`] and is only touched
//! from its event loop. Everything else talks to it through channels:
//! callers via [`OrchestratorHandle`], worker supervisors via
//! [`WorkerEvent`]s, cron triggers via [`CronDispatch`]es.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::cron::{CronDispatch, CronScheduler, CrontabWatcher, JobFilter, JobKind};
use crate::error::{OrchestratorError, Result};
use crate::ipc::message::{OP_JOBS_RUNNING, OP_JOB_DONE, OP_SHUTDOWN};
use crate::ipc::Envelope;
use crate::remote::{CommandProvisioner, InstanceProvisioner, LaunchOptions, RemoteLauncher};
use crate::scheduler::{Admission, AdmissionController, JobDescriptor};
use crate::store::{JobStore, MemoryJobStore, SubmittedJob};
use crate::worker::crash::CrashGuard;
use crate::worker::executor::JobExecutor;
use crate::worker::pool::{WorkerEvent, WorkerPool};
use crate::worker::registry::JobRegistry;

/// How long exiting workers get to report their exit during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often instance idleness is checked
const IDLE_CHECK: Duration = Duration::from_secs(1);

/// Requests from [`OrchestratorHandle`]
#[derive(Debug)]
pub enum Command {
    /// Evaluate now; spawn on admission
    Submit {
        descriptor: JobDescriptor,
        response_tx: oneshot::Sender<Admission>,
    },
    /// Append to the pending queue, then drain
    QueueJob {
        descriptor: JobDescriptor,
        response_tx: oneshot::Sender<bool>,
    },
    /// Route a descriptor by kind, as if a cron entry fired
    Dispatch {
        dispatch: CronDispatch,
        response_tx: oneshot::Sender<()>,
    },
    /// Fire crontab entries by id
    RunCronjob {
        id: String,
        response_tx: oneshot::Sender<usize>,
    },
    ReloadCrontab {
        response_tx: oneshot::Sender<Result<usize>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<Snapshot>,
    },
}

/// Point-in-time view of the orchestrator state
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub running: Vec<String>,
    pub queued: Vec<JobDescriptor>,
    pub workers: Vec<WorkerSnapshot>,
    pub free_slots: usize,
    pub throttled_for: Option<Duration>,
    pub cron_entries: usize,
}

impl Snapshot {
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queued.is_empty() && self.workers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub pid: Option<u32>,
    pub ready: bool,
    pub jobs: Vec<String>,
}

/// Cloneable client for a running [`Orchestrator`]
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl OrchestratorHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)?;
        response_rx.await.map_err(|_| OrchestratorError::ShuttingDown)
    }

    /// Admit now or queue/drop per the descriptor's options.
    pub async fn submit(&self, descriptor: JobDescriptor) -> Result<Admission> {
        self.call(|response_tx| Command::Submit {
            descriptor,
            response_tx,
        })
        .await
    }

    /// Queue for the next drain. Returns false if the queue is full.
    pub async fn queue_job(&self, descriptor: JobDescriptor) -> Result<bool> {
        self.call(|response_tx| Command::QueueJob {
            descriptor,
            response_tx,
        })
        .await
    }

    /// Run a descriptor as `local`, `server` or `remote`.
    pub async fn run_job(
        &self,
        kind: JobKind,
        descriptor: JobDescriptor,
        args: Map<String, Value>,
    ) -> Result<()> {
        let dispatch = CronDispatch {
            id: None,
            kind,
            job: descriptor,
            host: None,
            args,
        };
        self.call(|response_tx| Command::Dispatch {
            dispatch,
            response_tx,
        })
        .await
    }

    /// Fire the crontab entries with this id. Returns how many fired.
    pub async fn run_cronjob(&self, id: impl Into<String>) -> Result<usize> {
        let id = id.into();
        self.call(|response_tx| Command::RunCronjob { id, response_tx })
            .await
    }

    pub async fn reload_crontab(&self) -> Result<usize> {
        self.call(|response_tx| Command::ReloadCrontab { response_tx })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.call(|response_tx| Command::Snapshot { response_tx })
            .await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Owns the admission controller, worker pool, crash guard and cron table.
pub struct Orchestrator {
    config: OrchestratorConfig,
    admission: AdmissionController,
    pool: WorkerPool,
    crash: CrashGuard,
    executor: JobExecutor,
    launcher: Option<RemoteLauncher>,
    store: Arc<dyn JobStore>,
    filter: JobFilter,
    cron: Option<CronScheduler>,
    shutdown: CancellationToken,
    last_activity: Instant,
    command_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    cron_tx: mpsc::UnboundedSender<CronDispatch>,
    cron_rx: mpsc::UnboundedReceiver<CronDispatch>,
    server_done_tx: mpsc::UnboundedSender<Vec<String>>,
    server_done_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl Orchestrator {
    /// `registry` serves `server` jobs run inside this process.
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<JobRegistry>,
        shutdown: CancellationToken,
    ) -> Result<(Self, OrchestratorHandle)> {
        let filter = JobFilter::new(config.jobs_allow.as_deref(), config.jobs_disallow.as_deref())?;
        let (command_tx, command_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cron_tx, cron_rx) = mpsc::unbounded_channel();
        let (server_done_tx, server_done_rx) = mpsc::unbounded_channel();

        let launcher = config.launch_command.as_ref().map(|program| {
            RemoteLauncher::new(Arc::new(CommandProvisioner::new(program.clone())))
        });

        let orchestrator = Self {
            admission: AdmissionController::new(config.max_queue),
            pool: WorkerPool::new(&config, events_tx, shutdown.clone()),
            crash: CrashGuard::new(config.crash, shutdown.clone()),
            executor: JobExecutor::new(registry),
            launcher,
            store: Arc::new(MemoryJobStore::new()),
            filter,
            cron: None,
            shutdown: shutdown.clone(),
            last_activity: Instant::now(),
            command_rx,
            events_rx,
            cron_tx,
            cron_rx,
            server_done_tx,
            server_done_rx,
            config,
        };
        let handle = OrchestratorHandle {
            tx: command_tx,
            shutdown,
        };
        Ok((orchestrator, handle))
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn InstanceProvisioner>) -> Self {
        self.launcher = Some(RemoteLauncher::new(provisioner));
        self
    }

    /// Run until the shutdown token is cancelled, then stop the cron table
    /// and wait briefly for workers to go away.
    pub async fn run(mut self) -> Result<()> {
        let mut cron = CronScheduler::new(self.filter.clone(), self.cron_tx.clone()).await?;
        let mut watcher = None;
        if let Some(path) = self.config.crontab.clone() {
            match cron.reload_from_file(&path).await {
                Ok(n) => tracing::info!(path = %path.display(), schedules = n, "Crontab loaded"),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "Crontab not loaded"),
            }
            watcher = Some(CrontabWatcher::new(path));
        }
        self.cron = Some(cron);

        let mut queue_interval = periodic(self.config.queue_interval_ms);
        let mut jobs_interval = periodic(self.config.jobs_interval_ms);
        let mut crontab_interval = periodic(self.config.crontab_check_ms);
        let mut idle_interval = tokio::time::interval(IDLE_CHECK);
        idle_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_limit = self
            .config
            .idle_time_ms
            .filter(|_| self.config.instance)
            .map(Duration::from_millis);

        tracing::info!(
            max_workers = self.config.max_workers,
            hostname = %self.config.hostname,
            instance = self.config.instance,
            "Orchestrator started"
        );

        loop {
            let throttled_until = self.pool.throttled_until();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_worker_event(event);
                }

                Some(dispatch) = self.cron_rx.recv() => {
                    self.dispatch(dispatch).await;
                }

                Some(names) = self.server_done_rx.recv() => {
                    self.admission.complete(names.iter().map(String::as_str));
                    self.last_activity = Instant::now();
                    self.drain_queue();
                }

                _ = queue_interval.tick() => {
                    self.drain_queue();
                }

                _ = tokio::time::sleep_until(throttled_until.unwrap_or_else(Instant::now)),
                    if throttled_until.is_some() => {
                    tracing::info!("Respawn throttle lifted");
                    self.drain_queue();
                }

                _ = jobs_interval.tick() => {
                    self.sweep().await;
                }

                _ = crontab_interval.tick(), if watcher.is_some() => {
                    if let Some(watcher) = watcher.as_mut() {
                        if watcher.changed() {
                            self.reload_crontab().await.ok();
                        }
                    }
                }

                _ = idle_interval.tick(), if idle_limit.is_some() => {
                    if let Some(limit) = idle_limit {
                        self.check_idle(limit);
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                descriptor,
                response_tx,
            } => {
                let admission = self.submit(descriptor);
                let _ = response_tx.send(admission);
            }
            Command::QueueJob {
                descriptor,
                response_tx,
            } => {
                let queued = self.queue_job(descriptor);
                let _ = response_tx.send(queued);
            }
            Command::Dispatch {
                dispatch,
                response_tx,
            } => {
                self.dispatch(dispatch).await;
                let _ = response_tx.send(());
            }
            Command::RunCronjob { id, response_tx } => {
                let fired = self.cron.as_ref().map(|c| c.run_now(&id)).unwrap_or(0);
                if fired == 0 {
                    tracing::warn!(id = %id, "No crontab entry with this id");
                }
                let _ = response_tx.send(fired);
            }
            Command::ReloadCrontab { response_tx } => {
                let _ = response_tx.send(self.reload_crontab().await);
            }
            Command::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot());
            }
        }
    }

    fn submit(&mut self, descriptor: JobDescriptor) -> Admission {
        let admission = self.admission.try_admit(descriptor, self.pool.free_slots());
        match &admission {
            Admission::Admitted(descriptor) => self.start_worker(descriptor.clone()),
            Admission::Queued(reason) => {
                tracing::debug!(reason = %reason, queued = self.admission.queue().len(), "Job queued")
            }
            Admission::Rejected(reason) => tracing::debug!(reason = %reason, "Job dropped"),
        }
        admission
    }

    fn queue_job(&mut self, descriptor: JobDescriptor) -> bool {
        let queued = self.admission.enqueue(descriptor);
        self.drain_queue();
        queued
    }

    /// One FIFO pass over the pending queue with the slots free right now.
    fn drain_queue(&mut self) {
        if self.admission.queue().is_empty() {
            return;
        }
        let slots = self.pool.free_slots();
        let admitted = self.admission.drain(|started| slots.saturating_sub(started));
        for descriptor in admitted {
            self.start_worker(descriptor);
        }
    }

    /// Spawn a worker for an admitted descriptor. A failed spawn releases the
    /// names admission just claimed.
    fn start_worker(&mut self, descriptor: JobDescriptor) {
        match self.pool.spawn(&descriptor) {
            Ok(_) => self.last_activity = Instant::now(),
            Err(e) => {
                tracing::error!(job = %descriptor, error = %e, "Failed to spawn worker");
                self.admission.complete(descriptor.names());
            }
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker_id } => {
                tracing::debug!(worker_id, "Worker ready");
                self.pool.mark_ready(worker_id);
            }
            WorkerEvent::Message {
                worker_id,
                envelope,
            } => self.handle_worker_message(worker_id, envelope),
            WorkerEvent::Exited { worker_id, outcome } => {
                let Some(record) = self.pool.on_exit(worker_id) else {
                    return;
                };
                self.admission
                    .complete(record.jobs.iter().map(String::as_str));
                self.last_activity = Instant::now();

                if outcome.is_abnormal() {
                    tracing::warn!(
                        worker_id,
                        pid = ?record.pid,
                        code = ?outcome.code,
                        signal = ?outcome.signal,
                        jobs = %record.jobs.join(","),
                        "Worker exited abnormally"
                    );
                    if let Some(delay) = self.crash.respawn_delay() {
                        self.pool.throttle(delay);
                    }
                } else {
                    tracing::info!(
                        worker_id,
                        jobs = %record.jobs.join(","),
                        elapsed_ms = record.started_at.elapsed().as_millis() as u64,
                        "Worker finished"
                    );
                }
                self.drain_queue();
            }
        }
    }

    fn handle_worker_message(&mut self, worker_id: u64, envelope: Envelope) {
        match envelope.op.as_str() {
            OP_JOB_DONE => {
                let error = envelope
                    .value
                    .as_ref()
                    .and_then(|v| v.get("error"))
                    .and_then(Value::as_str);
                match error {
                    Some(error) => {
                        tracing::warn!(worker_id, job = ?envelope.name, error, "Job failed")
                    }
                    None => tracing::info!(worker_id, job = ?envelope.name, "Job done"),
                }
            }
            OP_SHUTDOWN => {
                tracing::info!(worker_id, "Shutdown requested by worker");
                self.shutdown.cancel();
            }
            OP_JOBS_RUNNING => {
                if !envelope.wants_reply() {
                    return;
                }
                let reply = envelope.response(json!(self.admission.running().names()));
                if let Err(e) = self.pool.send(worker_id, reply) {
                    tracing::warn!(worker_id, error = %e, "Failed to answer worker");
                }
            }
            other => tracing::debug!(worker_id, op = other, "Ignoring worker message"),
        }
    }

    /// Route a fired or swept job. Host-scoped entries go to the store.
    async fn dispatch(&mut self, dispatch: CronDispatch) {
        if let Some(host) = dispatch.host {
            let submitted = SubmittedJob::new(dispatch.kind, host, dispatch.job)
                .map(|job| job.with_args(dispatch.args));
            let result = match submitted {
                Ok(job) => self.store.submit(job).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(id = ?dispatch.id, error = %e, "Failed to submit job to store");
            }
            return;
        }
        self.run_by_kind(dispatch.kind, dispatch.job, &dispatch.args);
    }

    fn run_by_kind(&mut self, kind: JobKind, job: JobDescriptor, args: &Map<String, Value>) {
        match kind {
            JobKind::Local => {
                if !self.queue_job(job) {
                    tracing::warn!("Pending queue full, local job dropped");
                }
            }
            JobKind::Server => self.run_in_process(job),
            JobKind::Remote => self.launch_remote(job, LaunchOptions::from_args(args)),
        }
    }

    /// Run a descriptor on this process's runtime, bypassing workers.
    fn run_in_process(&mut self, job: JobDescriptor) {
        let dispatch = self
            .executor
            .dispatch(&job, None, self.shutdown.clone());
        if dispatch.is_empty() {
            return;
        }
        let names = dispatch.started.clone();
        self.admission.mark_running(names.iter().map(String::as_str));
        self.last_activity = Instant::now();

        let done_tx = self.server_done_tx.clone();
        tokio::spawn(async move {
            for result in dispatch.join_all().await {
                match result.error {
                    Some(error) => tracing::warn!(job = %result.name, error = %error, "Server job failed"),
                    None => tracing::debug!(job = %result.name, "Server job done"),
                }
            }
            let _ = done_tx.send(names);
        });
    }

    fn launch_remote(&self, job: JobDescriptor, options: LaunchOptions) {
        let Some(launcher) = self.launcher.clone() else {
            tracing::error!(job = %job, "No launch command configured, remote job dropped");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = launcher.launch(&job, &options).await {
                tracing::error!(job = %job.job_names(), error = %e, "Remote launch failed");
            }
        });
    }

    /// Claim and run store jobs addressed to this host.
    async fn sweep(&mut self) {
        let hosts = self.config.job_hosts();
        let jobs = match self.store.claim(&hosts).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Job store sweep failed");
                return;
            }
        };
        if jobs.is_empty() {
            return;
        }

        let count = jobs.len();
        for job in jobs {
            if let Err(e) = self.store.remove(&job.id).await {
                tracing::error!(id = %job.id, error = %e, "Failed to remove claimed job");
            }
            self.run_by_kind(job.kind, job.job, &job.args);
        }
        tracing::info!(count, "Processed submitted jobs");
    }

    async fn reload_crontab(&mut self) -> Result<usize> {
        let (Some(path), Some(cron)) = (self.config.crontab.as_ref(), self.cron.as_mut()) else {
            return Err(OrchestratorError::Crontab("no crontab configured".into()));
        };
        match cron.reload_from_file(path).await {
            Ok(n) => Ok(n),
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    schedules = cron.len(),
                    "Crontab reload failed, keeping current schedule"
                );
                Err(e)
            }
        }
    }

    fn check_idle(&mut self, limit: Duration) {
        if self.pool.active() > 0 || !self.admission.running().is_empty() {
            return;
        }
        if self.last_activity.elapsed() >= limit {
            tracing::info!(idle_ms = limit.as_millis() as u64, "Instance idle, shutting down");
            self.shutdown.cancel();
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut workers: Vec<WorkerSnapshot> = self
            .pool
            .workers()
            .map(|w| WorkerSnapshot {
                id: w.id,
                pid: w.pid,
                ready: w.ready,
                jobs: w.jobs.clone(),
            })
            .collect();
        workers.sort_by_key(|w| w.id);

        Snapshot {
            running: self.admission.running().names(),
            queued: self
                .admission
                .queue()
                .iter()
                .map(|q| q.descriptor.clone())
                .collect(),
            workers,
            free_slots: self.pool.free_slots(),
            throttled_for: self.pool.throttle_remaining(),
            cron_entries: self.cron.as_ref().map(CronScheduler::len).unwrap_or(0),
        }
    }

    async fn stop(&mut self) {
        tracing::info!(
            workers = self.pool.active(),
            queued = self.admission.queue().len(),
            "Orchestrator shutting down"
        );
        if let Some(mut cron) = self.cron.take() {
            if let Err(e) = cron.shutdown().await {
                tracing::warn!(error = %e, "Cron scheduler did not stop cleanly");
            }
        }

        self.pool.kill_all();
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        while self.pool.active() > 0 {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(WorkerEvent::Exited { worker_id, .. }) => {
                        if let Some(record) = self.pool.on_exit(worker_id) {
                            self.admission.complete(record.jobs.iter().map(String::as_str));
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(workers = self.pool.active(), "Workers still running at shutdown");
                    break;
                }
            }
        }
        tracing::info!("Orchestrator stopped");
    }
}

/// Interval whose first tick is one period from now.
fn periodic(ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("admission", &self.admission)
            .field("pool", &self.pool)
            .field("crash", &self.crash)
            .finish_non_exhaustive()
    }
}
