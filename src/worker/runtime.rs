use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::ipc::message::{OP_JOB, OP_JOB_DONE};
use crate::ipc::{Envelope, IpcReader, IpcSender, IpcWriter, PendingReplies};
use crate::scheduler::JobDescriptor;
use crate::worker::executor::JobExecutor;
use crate::worker::registry::JobRegistry;

/// Exit code of a worker that ran its descriptor
pub const EXIT_OK: i32 = 0;
/// Exit code of a worker that had nothing valid to run
pub const EXIT_FAILED: i32 = 1;

/// Worker process main loop over the given IPC streams (stdin/stdout in the
/// real binary).
///
/// 1. Sends `ready`
/// 2. Waits for one `job:run` envelope
/// 3. Starts every entry concurrently, reporting each with `job:done`
/// 4. Returns once all entries finish; the caller exits with the returned code
pub async fn run_worker<R, W>(
    registry: Arc<JobRegistry>,
    input: R,
    output: W,
    shutdown: CancellationToken,
) -> Result<i32>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Envelope>();
    let pending = PendingReplies::new();
    let ipc = IpcSender::new(out_tx, pending.clone());

    let (close_tx, close_rx) = oneshot::channel::<()>();
    let writer = tokio::spawn(write_loop(IpcWriter::new(output), out_rx, close_rx));

    let (job_tx, job_rx) = oneshot::channel::<JobDescriptor>();
    tokio::spawn(read_loop(IpcReader::new(input), pending, job_tx));

    ipc.send(Envelope::ready())?;

    let descriptor = match job_rx.await {
        Ok(descriptor) => descriptor,
        Err(_) => {
            tracing::warn!("Master closed the channel before sending a job");
            return Ok(EXIT_FAILED);
        }
    };
    tracing::info!(pid = std::process::id(), job = %descriptor, "Worker received job");

    let executor = JobExecutor::new(registry);
    let mut dispatch = executor.dispatch(&descriptor, Some(ipc.clone()), shutdown);
    if dispatch.is_empty() {
        let error = OrchestratorError::UnknownJob(dispatch.unknown.join(", "));
        tracing::error!(error = %error, "No valid jobs in descriptor");
        return Ok(EXIT_FAILED);
    }

    while let Some(result) = dispatch.next().await {
        match &result.error {
            None => tracing::info!(job = %result.name, "Job finished"),
            Some(e) => tracing::error!(job = %result.name, error = %e, "Job failed"),
        }
        let done = Envelope::new(OP_JOB_DONE)
            .with_name(result.name.clone())
            .with_value(json!({ "error": result.error }));
        if let Err(e) = ipc.send(done) {
            tracing::warn!(error = %e, "Could not report job completion");
        }
    }

    // Tasks spawned by handlers may still hold an IpcSender; close explicitly
    drop(dispatch);
    let _ = close_tx.send(());
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "IPC writer task failed");
    }
    Ok(EXIT_OK)
}

/// Writes outgoing envelopes until `close` fires, then flushes what is
/// already queued. Sends made after that fail.
async fn write_loop<W>(
    mut writer: IpcWriter<W>,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    mut close: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            msg = outbox.recv() => {
                let Some(envelope) = msg else {
                    return;
                };
                if let Err(e) = writer.send(&envelope).await {
                    tracing::warn!(error = %e, "Master pipe closed");
                    return;
                }
            }
            _ = &mut close => break,
        }
    }

    outbox.close();
    while let Some(envelope) = outbox.recv().await {
        if let Err(e) = writer.send(&envelope).await {
            tracing::warn!(error = %e, "Master pipe closed");
            return;
        }
    }
}

async fn read_loop<R>(
    mut reader: IpcReader<R>,
    pending: PendingReplies,
    job_tx: oneshot::Sender<JobDescriptor>,
) where
    R: AsyncRead + Unpin,
{
    let mut job_tx = Some(job_tx);
    loop {
        let envelope = match reader.recv().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "IPC read failed");
                break;
            }
        };

        if envelope.op == OP_JOB {
            let Some(tx) = job_tx.take() else {
                tracing::warn!("Worker already has a job, ignoring another");
                continue;
            };
            let parsed = envelope
                .value
                .ok_or_else(|| "job message without a descriptor".to_string())
                .and_then(|v| JobDescriptor::from_value(v).map_err(|e| e.to_string()));
            match parsed {
                Ok(descriptor) => {
                    let _ = tx.send(descriptor);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Invalid job message");
                    // Dropping the sender ends the worker
                }
            }
        } else if envelope.id.is_some() {
            pending.resolve(envelope);
        } else {
            tracing::debug!(op = %envelope.op, "Unhandled message from master");
        }
    }
    pending.clear();
}
