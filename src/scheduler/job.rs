use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};
use crate::scheduler::pattern::JobPattern;

/// Prefix that lets the same `component.method` appear several times in one
/// descriptor, e.g. `scraper.run`, `$scraper.run`, `$$scraper.run`.
pub const REPEAT_PREFIX: char = '$';

/// Strip the repeat prefix from a job name.
pub fn canonical_name(name: &str) -> &str {
    name.trim_start_matches(REPEAT_PREFIX)
}

/// Split a job name into `(component, method)` after stripping the repeat prefix.
pub fn split_name(name: &str) -> Option<(&str, &str)> {
    let (component, method) = canonical_name(name).split_once('.')?;
    if component.is_empty() || method.is_empty() {
        return None;
    }
    Some((component, method))
}

/// Loose truthiness for option flags: `true`, non-zero numbers and `"1"`/`"true"`.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// An ordered mapping of job name to per-job options.
///
/// Options are kept as raw JSON so arbitrary keys reach the target handler
/// unchanged; the admission flags are read through [`JobOptions`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDescriptor {
    entries: Map<String, Value>,
}

impl JobDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor with a single entry and no options.
    pub fn single(name: impl Into<String>) -> Self {
        Self::new().with(name, Value::Null)
    }

    pub fn with(mut self, name: impl Into<String>, options: Value) -> Self {
        self.insert(name, options);
        self
    }

    /// Insert or replace an entry. Returns the previous options if the name was present.
    pub fn insert(&mut self, name: impl Into<String>, options: Value) -> Option<Value> {
        self.entries.insert(name.into(), options)
    }

    /// Build a descriptor from a JSON value: either a `"component.method"` string
    /// or an object keyed by job name.
    pub fn from_value(value: Value) -> Result<Self> {
        let descriptor = match value {
            Value::String(name) => Self::single(name),
            Value::Object(entries) => Self { entries },
            other => {
                return Err(OrchestratorError::InvalidJob(format!(
                    "expected string or object, got {}",
                    other
                )))
            }
        };
        if descriptor.is_empty() {
            return Err(OrchestratorError::InvalidJob("no jobs".to_string()));
        }
        Ok(descriptor)
    }

    /// Decode the base64-of-JSON form used by `--job` and remote launches.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD.decode(encoded.trim())?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Self::from_value(value)
    }

    pub fn to_base64(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Job names as written, in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn options(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn options_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.entries.get_mut(name)
    }

    /// Options as an object for handler dispatch. `None` when the options are
    /// missing, not an object, or an empty object.
    pub fn payload(&self, name: &str) -> Option<&Map<String, Value>> {
        match self.entries.get(name) {
            Some(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        }
    }

    /// Keep only the entries for which `keep` returns true, preserving order.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries.into_iter().filter(|(k, _)| keep(k)).collect();
    }

    /// Comma separated names, for logs and process titles.
    pub fn job_names(&self) -> String {
        self.names().collect::<Vec<_>>().join(",")
    }
}

impl std::fmt::Display for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.entries) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{}", self.job_names()),
        }
    }
}

/// Admission flags read from one entry's options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Skip the "already running" check.
    pub runalways: bool,
    /// Only admit when nothing else is running or queued.
    pub runlast: bool,
    /// Only admit when no running job matches.
    pub runone: Option<JobPattern>,
    /// Only admit when no running or queued job matches.
    pub runafter: Option<JobPattern>,
    /// Drop instead of re-queueing when admission fails.
    pub skipqueue: bool,
}

impl JobOptions {
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(map)) = value else {
            return Self::default();
        };
        Self {
            runalways: truthy(map.get("runalways")),
            runlast: truthy(map.get("runlast")),
            runone: map.get("runone").and_then(pattern_option),
            runafter: map.get("runafter").and_then(pattern_option),
            skipqueue: truthy(map.get("skipqueue")),
        }
    }
}

fn pattern_option(value: &Value) -> Option<JobPattern> {
    match value {
        Value::String(s) if !s.is_empty() => Some(JobPattern::new(s)),
        _ => None,
    }
}
