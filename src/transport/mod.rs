//! Transport layer between the host and the agent.
//!
//! Provides the `Transport` trait and the newline framing shared by both
//! implementations: `DeviceTransport` (virtio-serial character device) and
//! `StdioTransport` (stdin/stdout, for interactive testing).
//!
//! Framing: one message per line. A response may be preceded by a single
//! `0xFF` byte when the triggering command asked for delimited sync.

pub mod device;
pub mod stdio;

pub use device::DeviceTransport;
pub use stdio::StdioTransport;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::TransportError;

/// Out-of-band marker written before a delimited response.
pub const SYNC_DELIMITER: u8 = 0xFF;

/// Default bound on a single read so the loop can observe shutdown promptly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on writing one response.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum line length (64 MB). Safety valve against a peer that never sends
/// a newline.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Abstraction over the host ↔ agent channel.
///
/// Implementations own at most one open handle at a time and may be reopened
/// after a failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. Opening an already open transport is a no-op.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Read one message (a line without its terminator), bounded by the
    /// transport's read deadline.
    async fn read_message(&self) -> Result<Vec<u8>, TransportError>;

    /// Write one message followed by a newline, optionally preceded by
    /// [`SYNC_DELIMITER`], and flush.
    async fn send_message(&self, payload: &[u8], delimited: bool) -> Result<(), TransportError>;
}

/// Write a framed message: `[0xFF]? payload '\n'`, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    delimited: bool,
) -> io::Result<()> {
    if delimited {
        writer.write_all(&[SYNC_DELIMITER]).await?;
    }
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Buffered line reader that survives a timed-out read.
///
/// Bytes read before a deadline expiry stay in `pending` and are completed by
/// the next call, so a slow peer never loses half a message.
pub(crate) struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Read the next non-empty line within `deadline`.
    pub(crate) async fn next_line(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let read = read_until_newline(&mut self.reader, &mut self.pending);
        match tokio::time::timeout(deadline, read).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => {
                self.pending.clear();
                Err(TransportError::ReadFailure(e))
            }
            Ok(Ok(0)) if self.pending.is_empty() => Err(TransportError::ConnectionClosed),
            // EOF after a partial line: hand over what we have.
            Ok(Ok(_)) => finish_line(&std::mem::take(&mut self.pending)),
        }
    }
}

async fn read_until_newline<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> io::Result<usize> {
    let n = reader.read_until(b'\n', pending).await?;
    if pending.len() > MAX_MESSAGE_SIZE {
        pending.clear();
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message exceeds max size of {MAX_MESSAGE_SIZE} bytes"),
        ));
    }
    Ok(n)
}

/// Strip framing and whitespace from a raw line.
///
/// Leading `0xFF` bytes are dropped as well: a host may send one to reset the
/// agent's parser before a delimited sync.
fn finish_line(line: &[u8]) -> Result<Vec<u8>, TransportError> {
    let start = line
        .iter()
        .position(|&b| b != SYNC_DELIMITER && !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1)
        .max(start);

    if start == end {
        return Err(TransportError::EmptyMessage);
    }
    Ok(line[start..end].to_vec())
}
