use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ipc::IpcSender;
use crate::scheduler::job::canonical_name;

/// What a running job can reach besides its options.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job name as written in the descriptor, including any `$` prefix
    pub name: String,
    /// Channel to the master; `None` when running inside the master itself
    pub ipc: Option<IpcSender>,
    /// Cancelled when the hosting process begins shutdown
    pub shutdown: CancellationToken,
}

/// A named operation that can be scheduled as `component.method`.
///
/// `options` is `None` when the descriptor entry has no options or an empty
/// object; otherwise it carries every key unchanged, admission flags included.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, options: Option<&Map<String, Value>>) -> Result<()>;
}

/// Maps `component.method` to handlers
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, component: &str, method: &str, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert(format!("{}.{}", component, method), Arc::new(handler));
        self
    }

    /// Look up a job name; repeat prefixes are ignored.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(canonical_name(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(canonical_name(name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
