use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::{OrchestratorError, Result};
use crate::ipc::message::Envelope;

/// Longest accepted message line in bytes
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Reads newline-delimited JSON envelopes
pub struct IpcReader<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line_length(reader, MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(reader: R, max_length: usize) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_length)),
        }
    }

    /// Next envelope, or `None` at end of stream. Lines that do not parse are
    /// logged and skipped. A line longer than the limit is an error; the
    /// stream is not usable afterwards.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            let line = match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(OrchestratorError::Ipc(format!(
                        "message line exceeds {} bytes",
                        self.lines.decoder().max_length()
                    )));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    tracing::warn!(error = %e, line, "Ignoring malformed IPC message");
                }
            }
        }
    }
}

/// Writes newline-delimited JSON envelopes
pub struct IpcWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| OrchestratorError::Ipc(format!("send {}: {}", envelope.op, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| OrchestratorError::Ipc(format!("flush {}: {}", envelope.op, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::OP_JOB_DONE;

    #[tokio::test]
    async fn envelopes_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = IpcWriter::new(a);
        let mut reader = IpcReader::new(b);

        writer.send(&Envelope::ready()).await.unwrap();
        writer
            .send(&Envelope::new(OP_JOB_DONE).with_name("server.sleep"))
            .await
            .unwrap();
        drop(writer);

        assert!(reader.recv().await.unwrap().unwrap().is_ready());
        let done = reader.recv().await.unwrap().unwrap();
        assert_eq!(done.name.as_deref(), Some("server.sleep"));
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let input: &[u8] = b"not json\n\n{\"op\":\"ready\"}\n";
        let mut reader = IpcReader::new(input);
        assert!(reader.recv().await.unwrap().unwrap().is_ready());
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlong_line_is_an_error() {
        let mut input = vec![b'x'; 256];
        input.extend_from_slice(b"\n{\"op\":\"ready\"}\n");
        let mut reader = IpcReader::with_max_line_length(&input[..], 64);
        assert!(matches!(reader.recv().await, Err(OrchestratorError::Ipc(_))));
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let line = b"{\"op\":\"ready\"}\n";
        let mut reader = IpcReader::with_max_line_length(&line[..], line.len() - 1);
        assert!(reader.recv().await.unwrap().unwrap().is_ready());
    }
}
