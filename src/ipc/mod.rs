//! Control channel between the master and its worker processes.
//!
//! Envelopes travel as one JSON object per line over the worker's stdin
//! (master -> worker) and stdout (worker -> master). A worker announces
//! itself with [`OP_READY`](message::OP_READY) before the master sends it a
//! descriptor; the master buffers until then.
//!
//! Messages are fire-and-forget unless sent through
//! [`IpcSender::request`], which attaches an id and waits for a response or
//! a timeout.

pub mod callbacks;
pub mod channel;
pub mod message;

pub use callbacks::{DeferredReply, IpcSender, PendingReplies, Reply};
pub use channel::{IpcReader, IpcWriter};
pub use message::Envelope;
