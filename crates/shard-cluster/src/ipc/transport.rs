//! Line-delimited JSON transport
//!
//! One [`IpcMessage`] per line over any byte pipe: a child's stdin/stdout in production,
//! `tokio::io::duplex` in tests. Writes go through a single writer task so concurrent
//! senders never interleave partial lines.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{IpcError, IpcMessage};

/// Cloneable sending half of an IPC channel
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::UnboundedSender<IpcMessage>,
}

impl IpcSender {
    /// Spawn the writer task for `writer`
    ///
    /// The task ends when every sender is dropped or the pipe fails.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if let Err(e) = write_loop(writer, rx).await {
                tracing::debug!(error = %e, "IPC writer stopped");
            }
        });
        (Self { tx }, task)
    }

    /// Queue a message for writing
    pub fn send(&self, message: IpcMessage) -> Result<(), IpcError> {
        self.tx.send(message).map_err(|_| IpcError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<IpcMessage>,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(op = %message.op, error = %e, "Dropping unencodable IPC message");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Receiving half of an IPC channel
pub struct IpcReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R> IpcReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message; `Ok(None)` at end of stream
    ///
    /// A malformed line yields `Err(Deserialization)` and the reader stays usable.
    pub async fn next(&mut self) -> Result<Option<IpcMessage>, IpcError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return IpcMessage::from_line(&line).map(Some);
        }
    }
}
