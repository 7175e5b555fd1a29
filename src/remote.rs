//! Launching job descriptors on freshly provisioned instances.
//!
//! The remote instance runs its own master with the descriptor passed on the
//! command line and, unless told otherwise, a trailing `server.shutdown` job
//! so it terminates once the real work is done.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::JobDescriptor;

/// Job appended to remote launches so the instance stops when idle
pub const SHUTDOWN_JOB: &str = "server.shutdown";

/// Timestamp format of the `btime` stamp
pub const BTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Creates compute instances that run a command line on boot.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Start `count` instances and return the id of the first one.
    async fn launch_instance(&self, count: u32, command_line: &str) -> Result<String>;
}

/// Provisions through an external program invoked as
/// `<program> <count> <command line>`; the first line of its stdout is the
/// instance id.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    program: PathBuf,
}

impl CommandProvisioner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl InstanceProvisioner for CommandProvisioner {
    async fn launch_instance(&self, count: u32, command_line: &str) -> Result<String> {
        let output = Command::new(&self.program)
            .arg(count.to_string())
            .arg(command_line)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::Launch(format!("{}: {}", self.program.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Launch(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::Launch("provisioner returned no instance id".into()))
    }
}

/// Per-launch options, usually a remote crontab entry's `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    /// Leave the instance running after its jobs finish
    pub noshutdown: bool,
    pub count: u32,
    /// `-`-prefixed flags passed through to the instance
    pub forwarded: Vec<(String, Option<String>)>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            noshutdown: false,
            count: 1,
            forwarded: Vec::new(),
        }
    }
}

impl LaunchOptions {
    /// Read options from a JSON object. Keys not starting with `-` other than
    /// `noshutdown` and `count` are ignored.
    pub fn from_args(args: &Map<String, Value>) -> Self {
        let mut options = Self {
            noshutdown: crate::scheduler::job::truthy(args.get("noshutdown")),
            ..Default::default()
        };
        if let Some(count) = args.get("count").and_then(Value::as_u64) {
            options.count = count.clamp(1, u32::MAX as u64) as u32;
        }
        for (key, value) in args.iter().filter(|(k, _)| k.starts_with('-')) {
            let value = match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            options.forwarded.push((key.clone(), value));
        }
        options
    }

    pub fn forward(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.forwarded.push((flag.into(), Some(value.into())));
        self
    }
}

/// A provisioned instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: String,
    pub command_line: String,
}

/// Stamp every entry without one with `btime`. Missing or non-object options
/// become an object holding just the stamp.
pub fn stamp_btime(descriptor: &mut JobDescriptor, btime: &str) {
    let names: Vec<String> = descriptor.names().map(str::to_string).collect();
    for name in names {
        let Some(options) = descriptor.options_mut(&name) else {
            continue;
        };
        if !options.is_object() {
            *options = Value::Object(Map::new());
        }
        if let Value::Object(map) = options {
            map.entry("btime")
                .or_insert_with(|| Value::String(btime.to_string()));
        }
    }
}

fn encode_arg(arg: &str) -> String {
    arg.replace(' ', "%20")
}

/// Build the instance command line for a descriptor.
pub fn build_command_line(
    descriptor: &JobDescriptor,
    options: &LaunchOptions,
    now: DateTime<Local>,
) -> Result<String> {
    if descriptor.is_empty() {
        return Err(OrchestratorError::InvalidJob("no jobs to launch".into()));
    }

    let mut job = descriptor.clone();
    stamp_btime(&mut job, &now.format(BTIME_FORMAT).to_string());

    let mut args = vec![
        "master".to_string(),
        "--instance".to_string(),
        "--jobname".to_string(),
        job.job_names(),
        "--job".to_string(),
        job.to_base64()?,
    ];

    if !options.noshutdown {
        let shutdown =
            JobDescriptor::new().with(SHUTDOWN_JOB, serde_json::json!({ "runlast": true }));
        args.push("--job".to_string());
        args.push(shutdown.to_base64()?);
    }

    for (flag, value) in &options.forwarded {
        args.push(flag.clone());
        if let Some(value) = value {
            args.push(value.clone());
        }
    }

    Ok(args
        .iter()
        .map(|a| encode_arg(a))
        .collect::<Vec<_>>()
        .join(" "))
}

/// Hands descriptors to an [`InstanceProvisioner`]. Does not wait for the
/// remote jobs; failures are returned to the caller and never retried.
#[derive(Clone)]
pub struct RemoteLauncher {
    provisioner: Arc<dyn InstanceProvisioner>,
}

impl RemoteLauncher {
    pub fn new(provisioner: Arc<dyn InstanceProvisioner>) -> Self {
        Self { provisioner }
    }

    pub async fn launch(
        &self,
        descriptor: &JobDescriptor,
        options: &LaunchOptions,
    ) -> Result<InstanceHandle> {
        let command_line = build_command_line(descriptor, options, Local::now())?;
        tracing::info!(
            jobs = %descriptor.job_names(),
            count = options.count,
            noshutdown = options.noshutdown,
            "Launching remote instance"
        );

        let id = self
            .provisioner
            .launch_instance(options.count, &command_line)
            .await?;
        tracing::info!(instance = %id, "Remote instance launched");
        Ok(InstanceHandle { id, command_line })
    }
}

impl std::fmt::Debug for RemoteLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLauncher").finish_non_exhaustive()
    }
}
