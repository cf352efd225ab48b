//! Stdin/stdout transport for interactive testing.
//!
//! Same contract and framing as the device transport, so the engine cannot
//! tell the two apart. Generic over its streams so tests can script both ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{write_frame, LineReader, Transport, DEFAULT_READ_TIMEOUT};
use crate::error::TransportError;

/// Line-oriented transport over a reader/writer pair (stdin/stdout by default).
pub struct StdioTransport<R = Stdin, W = Stdout> {
    reader: Mutex<LineReader<R>>,
    writer: Mutex<W>,
    read_timeout: Duration,
    open: AtomicBool,
    greeted: AtomicBool,
}

impl StdioTransport {
    /// Transport over the process's stdin and stdout.
    pub fn new() -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn from_streams(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(LineReader::new(reader)),
            writer: Mutex::new(writer),
            read_timeout: DEFAULT_READ_TIMEOUT,
            open: AtomicBool::new(false),
            greeted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn open(&self) -> Result<(), TransportError> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // After end of input the loop reopens periodically; greet only once.
        if self.greeted.swap(true, Ordering::AcqRel) {
            debug!("Stdio transport reopened");
            return Ok(());
        }
        info!("Stdio transport open, type one JSON command per line, for example:");
        info!(r#"  {{"execute":"guest-ping"}}"#);
        info!(r#"  {{"execute":"guest-info"}}"#);
        info!(r#"  {{"execute":"guest-sync","arguments":{{"id":12345}}}}"#);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("Stdio transport closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }

        let result = self.reader.lock().await.next_line(self.read_timeout).await;
        match &result {
            Ok(line) => debug!(input = %String::from_utf8_lossy(line), "Received input"),
            Err(TransportError::ConnectionClosed) => {
                info!("End of input");
                self.open.store(false, Ordering::Release);
            }
            Err(_) => {}
        }
        result
    }

    async fn send_message(&self, payload: &[u8], delimited: bool) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload, delimited)
            .await
            .map_err(TransportError::WriteFailure)
    }
}
