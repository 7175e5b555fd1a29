use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskmaster::config::{
    local_hostname, CrashConfig, MonitorConfig, OrchestratorConfig, WorkerCommand,
};
use taskmaster::monitor::run_monitor;
use taskmaster::orchestrator::Orchestrator;
use taskmaster::scheduler::JobDescriptor;
use taskmaster::shutdown::install_shutdown_handler;
use taskmaster::worker::registry::JobRegistry;
use taskmaster::worker::runtime::run_worker;

#[derive(Parser, Debug)]
#[command(name = "taskmaster")]
#[command(version)]
#[command(about = "Job orchestrator with worker processes, cron and remote launch")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator
    Master(MasterArgs),

    /// Keep a master running, restarting it when it exits
    Monitor(MonitorArgs),

    /// Execute one job descriptor received over stdin (started by the master)
    Worker,
}

// =============================================================================
// Master Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Maximum concurrent worker processes
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..=64))]
    max_workers: u16,

    /// Pending queue capacity
    #[arg(long, default_value = "10000")]
    max_queue: usize,

    #[command(flatten)]
    crash: CrashArgs,

    /// Pending queue drain interval (ms)
    #[arg(long, default_value = "30000")]
    queue_interval: u64,

    /// Job store sweep interval (ms)
    #[arg(long, default_value = "180000", value_parser = clap::value_parser!(u64).range(60_000..=900_000))]
    jobs_interval: u64,

    /// How long a new worker may take to report ready (ms)
    #[arg(long, default_value = "30000")]
    ready_timeout: u64,

    /// Regex over "<type>.<job>" of cron jobs allowed on this host
    #[arg(long)]
    jobs_allow: Option<String>,

    /// Regex over "<type>.<job>" of cron jobs refused on this host; wins over --jobs-allow
    #[arg(long)]
    jobs_disallow: Option<String>,

    /// Also run store jobs submitted without a host
    #[arg(long)]
    jobs_primary: bool,

    /// Crontab file (JSON array of entries), reloaded when it changes
    #[arg(long)]
    crontab: Option<PathBuf>,

    /// Crontab change check interval (ms)
    #[arg(long, default_value = "5000")]
    crontab_check: u64,

    /// Host name used to claim host-scoped jobs
    #[arg(long)]
    hostname: Option<String>,

    /// Running on a launched instance
    #[arg(long)]
    instance: bool,

    /// With --instance: shut down after this long without jobs (ms)
    #[arg(long, requires = "instance")]
    idle_time: Option<u64>,

    /// Program used to provision instances for remote jobs,
    /// invoked as `<program> <count> <command line>`
    #[arg(long)]
    launch_command: Option<PathBuf>,

    /// Job names, informational (set on launched instances)
    #[arg(long)]
    jobname: Option<String>,

    /// Base64 JSON job descriptor to queue at startup; may repeat
    #[arg(long = "job")]
    jobs: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct CrashArgs {
    /// Respawn spacing after an isolated crash (ms)
    #[arg(long, default_value = "3000")]
    crash_interval: u64,

    /// Respawn throttle once a crash loop is detected (ms)
    #[arg(long, default_value = "30000")]
    crash_delay: u64,

    /// Crashes inside the window that count as a loop
    #[arg(long, default_value = "3")]
    crash_count: u32,
}

impl From<&CrashArgs> for CrashConfig {
    fn from(args: &CrashArgs) -> Self {
        Self {
            interval_ms: args.crash_interval,
            delay_ms: args.crash_delay,
            count: args.crash_count,
        }
    }
}

// =============================================================================
// Monitor Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MonitorArgs {
    #[command(flatten)]
    crash: CrashArgs,

    /// Delay before restarting a master that exited cleanly (ms)
    #[arg(long, default_value = "2000")]
    restart_delay: u64,

    /// Arguments for the master, after `--`
    #[arg(last = true)]
    master_args: Vec<String>,
}

fn init_logging() {
    // stdout carries worker IPC, so every role logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Decode `--job` arguments, skipping any that are not a valid descriptor.
fn decode_jobs(encoded: &[String]) -> Vec<JobDescriptor> {
    encoded
        .iter()
        .filter_map(|arg| match JobDescriptor::from_base64(arg) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::error!(job = %arg, error = %e, "Ignoring invalid --job argument");
                None
            }
        })
        .collect()
}

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();

    let config = OrchestratorConfig {
        max_workers: args.max_workers as usize,
        max_queue: args.max_queue,
        worker: WorkerCommand::default(),
        ready_timeout_ms: args.ready_timeout,
        crash: CrashConfig::from(&args.crash),
        queue_interval_ms: args.queue_interval,
        jobs_interval_ms: args.jobs_interval,
        crontab: args.crontab,
        crontab_check_ms: args.crontab_check,
        jobs_allow: args.jobs_allow,
        jobs_disallow: args.jobs_disallow,
        jobs_primary: args.jobs_primary,
        hostname: args.hostname.unwrap_or_else(local_hostname),
        instance: args.instance,
        idle_time_ms: args.idle_time,
        launch_command: args.launch_command,
    };

    let jobs = decode_jobs(&args.jobs);

    if let Some(jobname) = &args.jobname {
        tracing::info!(jobname = %jobname, "Instance job");
    }

    let registry = Arc::new(JobRegistry::with_builtins());
    let (orchestrator, handle) = Orchestrator::new(config, registry, shutdown)?;
    let task = tokio::spawn(orchestrator.run());

    for job in jobs {
        if !handle.queue_job(job).await? {
            tracing::warn!("Pending queue full, startup job dropped");
        }
    }

    task.await??;
    Ok(())
}

async fn run_monitor_role(args: MonitorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();

    let mut command = WorkerCommand {
        args: vec!["master".to_string()],
        ..WorkerCommand::default()
    };
    command.args.extend(args.master_args);

    let config = MonitorConfig {
        command,
        crash: CrashConfig::from(&args.crash),
        restart_delay_ms: args.restart_delay,
    };
    run_monitor(config, shutdown).await?;
    Ok(())
}

async fn run_worker_role() -> Result<i32, Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let registry = Arc::new(JobRegistry::with_builtins());
    let code = run_worker(registry, tokio::io::stdin(), tokio::io::stdout(), shutdown).await?;
    Ok(code)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Master(master_args) => {
            run_master(master_args).await?;
        }
        Commands::Monitor(monitor_args) => {
            run_monitor_role(monitor_args).await?;
        }
        Commands::Worker => {
            let code = run_worker_role().await?;
            // Jobs may leave tasks behind; the exit code is the completion signal
            std::process::exit(code);
        }
    }

    Ok(())
}
