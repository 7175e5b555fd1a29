use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{OrchestratorError, Result};
use crate::ipc::message::Envelope;

/// Outcome of a correlated request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The peer answered
    Ack(Envelope),
    /// No answer in time; carries the original outgoing message
    Timeout(Envelope),
    /// The pending entry was dropped before an answer arrived
    Error(String),
}

type Waiters = HashMap<u64, oneshot::Sender<Envelope>>;

/// Table of requests waiting for a response, keyed by message id
#[derive(Debug, Clone)]
pub struct PendingReplies {
    waiters: Arc<Mutex<Waiters>>,
    next_id: Arc<AtomicU64>,
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonically increasing message id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a response slot for `msg`, which must carry an id.
    pub fn defer(&self, msg: Envelope, timeout: Duration) -> Result<DeferredReply> {
        let id = msg
            .id
            .ok_or_else(|| OrchestratorError::Ipc(format!("{}: message has no id", msg.op)))?;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        Ok(DeferredReply {
            id,
            rx,
            original: msg,
            timeout,
            pending: self.clone(),
        })
    }

    /// Deliver a response to its waiter. Returns false if nobody is waiting
    /// for this id (already timed out, or never registered).
    pub fn resolve(&self, msg: Envelope) -> bool {
        let Some(id) = msg.id else {
            return false;
        };
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        tx.send(msg).is_ok()
    }

    /// Drop every waiter; they resolve as [`Reply::Error`].
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        // A poisoned table still holds valid senders
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registered request waiting for its response or timeout
#[derive(Debug)]
pub struct DeferredReply {
    id: u64,
    rx: oneshot::Receiver<Envelope>,
    original: Envelope,
    timeout: Duration,
    pending: PendingReplies,
}

impl DeferredReply {
    pub async fn wait(self) -> Reply {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(msg)) => Reply::Ack(msg),
            Ok(Err(_)) => Reply::Error(format!("{}: reply channel closed", self.original.op)),
            Err(_) => {
                self.pending.forget(self.id);
                tracing::debug!(op = %self.original.op, id = self.id, "IPC request timed out");
                Reply::Timeout(self.original)
            }
        }
    }
}

/// Cloneable handle for sending envelopes to the peer
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: PendingReplies,
}

impl IpcSender {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>, pending: PendingReplies) -> Self {
        Self { tx, pending }
    }

    /// Fire-and-forget
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|e| OrchestratorError::Ipc(format!("peer gone, dropped {}", e.0.op)))
    }

    /// Send with a correlation id and wait for the response. A failed send is
    /// logged and the request degrades to [`Reply::Timeout`].
    pub async fn request(&self, mut envelope: Envelope, timeout: Duration) -> Reply {
        envelope.id = Some(self.pending.next_id());
        envelope.reply = Some(true);
        let deferred = match self.pending.defer(envelope.clone(), timeout) {
            Ok(deferred) => deferred,
            Err(e) => return Reply::Error(e.to_string()),
        };
        if let Err(e) = self.send(envelope) {
            tracing::warn!(error = %e, "IPC request not sent");
        }
        deferred.wait().await
    }

    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }
}
