use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};

/// Where a cron-fired job runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Queued for a worker process
    #[default]
    Local,
    /// Run inside the master process
    Server,
    /// Launched on a new compute instance
    Remote,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Local => "local",
            JobKind::Server => "server",
            JobKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the crontab file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrontabEntry {
    #[serde(rename = "type", default)]
    pub kind: JobKind,
    /// Six fields: second minute hour day-of-month month day-of-week
    #[serde(default)]
    pub cron: String,
    /// `"component.method"` or a descriptor object
    #[serde(default)]
    pub job: Value,
    #[serde(default)]
    pub id: Option<String>,
    /// Submit to the shared job store for this host instead of running here
    #[serde(default)]
    pub host: Option<String>,
    /// Remote only: `-`-prefixed options forwarded to the instance
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub disabled: bool,
}

impl CrontabEntry {
    pub fn new(kind: JobKind, cron: impl Into<String>, job: Value) -> Self {
        Self {
            kind,
            cron: cron.into(),
            job,
            id: None,
            host: None,
            args: Map::new(),
            disabled: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Enabled and has both a schedule and a job
    pub fn is_active(&self) -> bool {
        !self.disabled && !self.cron.trim().is_empty() && !self.job.is_null()
    }
}

/// Parse a crontab file: a JSON array of entries. Disabled and incomplete
/// entries are dropped here; anything else malformed fails the whole file.
pub fn parse_crontab(text: &str) -> Result<Vec<CrontabEntry>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| OrchestratorError::Crontab(format!("invalid JSON: {}", e)))?;
    let Value::Array(items) = value else {
        return Err(OrchestratorError::Crontab(
            "expected an array of entries".to_string(),
        ));
    };

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let entry: CrontabEntry = serde_json::from_value(item)
            .map_err(|e| OrchestratorError::Crontab(format!("entry {}: {}", index, e)))?;
        if entry.is_active() {
            entries.push(entry);
        } else {
            tracing::debug!(index, id = ?entry.id, "Skipping inactive crontab entry");
        }
    }
    Ok(entries)
}
