use std::path::PathBuf;
use std::time::Duration;

/// Command used to start a worker process.
///
/// Workers are the same binary started with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("taskmaster")),
            args: vec!["worker".to_string()],
        }
    }
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Crash-loop throttling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashConfig {
    /// Respawn spacing after an isolated crash
    pub interval_ms: u64,
    /// Throttle applied once `count` crashes land inside the window
    pub delay_ms: u64,
    /// Crashes inside the window before throttling
    pub count: u32,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            delay_ms: 30_000,
            count: 3,
        }
    }
}

impl CrashConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Window inside which consecutive crashes count as a loop
    pub fn window(&self) -> Duration {
        self.interval() * (self.count + 1)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrency ceiling for job workers
    pub max_workers: usize,
    /// Pending queue capacity
    pub max_queue: usize,
    pub worker: WorkerCommand,
    /// How long a new worker may take to report ready
    pub ready_timeout_ms: u64,
    pub crash: CrashConfig,
    /// Pending queue drain interval
    pub queue_interval_ms: u64,
    /// Host-scoped job store sweep interval
    pub jobs_interval_ms: u64,
    pub crontab: Option<PathBuf>,
    /// How often the crontab file is checked for changes
    pub crontab_check_ms: u64,
    /// Regex over `<type>.<job>` allowing cron jobs
    pub jobs_allow: Option<String>,
    /// Regex over `<type>.<job>` disallowing cron jobs, wins over allow
    pub jobs_disallow: Option<String>,
    /// Also claim store jobs submitted without a host
    pub jobs_primary: bool,
    pub hostname: String,
    /// Running on a launched instance
    pub instance: bool,
    /// Instance mode: shut down after this long without jobs
    pub idle_time_ms: Option<u64>,
    /// Program used to provision remote instances
    pub launch_command: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            max_queue: 10_000,
            worker: WorkerCommand::default(),
            ready_timeout_ms: 30_000,
            crash: CrashConfig::default(),
            queue_interval_ms: 30_000,
            jobs_interval_ms: 180_000,
            crontab: None,
            crontab_check_ms: 5000,
            jobs_allow: None,
            jobs_disallow: None,
            jobs_primary: false,
            hostname: local_hostname(),
            instance: false,
            idle_time_ms: None,
            launch_command: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_crontab(mut self, path: impl Into<PathBuf>) -> Self {
        self.crontab = Some(path.into());
        self
    }

    /// Host names this node claims store jobs for: full name, short name and,
    /// for primary job servers, the empty host.
    pub fn job_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.hostname.clone()];
        if let Some((short, _)) = self.hostname.split_once('.') {
            hosts.push(short.to_string());
        }
        if self.jobs_primary {
            hosts.push(String::new());
        }
        hosts
    }
}

/// Supervisor settings for the `monitor` role.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub command: WorkerCommand,
    pub crash: CrashConfig,
    /// Delay before restarting a process that exited cleanly
    pub restart_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            command: WorkerCommand::default(),
            crash: CrashConfig::default(),
            restart_delay_ms: 2000,
        }
    }
}

/// Best-effort local host name: `HOSTNAME`, then the kernel's, then `localhost`.
pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
