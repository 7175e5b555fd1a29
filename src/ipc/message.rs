use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::scheduler::JobDescriptor;

/// Sent once by a worker before anything else
pub const OP_READY: &str = "ready";
/// Master -> worker: the descriptor to execute
pub const OP_JOB: &str = "job:run";
/// Worker -> master: one entry of the descriptor finished
pub const OP_JOB_DONE: &str = "job:done";
/// Worker -> master: begin graceful shutdown
pub const OP_SHUTDOWN: &str = "server:shutdown";
/// Worker -> master request, answered with the running job names
pub const OP_JOBS_RUNNING: &str = "jobs:running";

/// Control message exchanged between the master and its workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<bool>,
}

impl Envelope {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            name: None,
            value: None,
            id: None,
            reply: None,
        }
    }

    pub fn ready() -> Self {
        Self::new(OP_READY)
    }

    pub fn job(descriptor: &JobDescriptor) -> Result<Self> {
        Ok(Self::new(OP_JOB).with_value(serde_json::to_value(descriptor)?))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.op == OP_READY
    }

    /// The sender expects a response carrying the same id
    pub fn wants_reply(&self) -> bool {
        self.id.is_some() && self.reply.unwrap_or(false)
    }

    /// Response to this request: same op and id, no reply flag.
    pub fn response(&self, value: Value) -> Self {
        Self {
            op: self.op.clone(),
            name: self.name.clone(),
            value: Some(value),
            id: self.id,
            reply: None,
        }
    }
}
