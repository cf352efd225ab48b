//! Character-device transport (virtio-serial port).
//!
//! Opens the guest agent port read/write and non-blocking, reads
//! newline-framed requests with a short deadline, and writes framed responses.
//! If no path is configured the well-known port names are probed and the first
//! character device wins.
//!
//! The descriptor is polled through the runtime's reactor rather than the
//! blocking pool, so a read abandoned at its deadline leaves no work behind and
//! `close()` releases the port at once.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{write_frame, LineReader, Transport, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};
use crate::error::TransportError;

/// Well-known guest agent port paths, in probe order.
pub const CANDIDATE_DEVICES: &[&str] = &[
    // Linux virtio-serial named port
    "/dev/virtio-ports/org.qemu.guest_agent.0",
    // macOS
    "/dev/cu.org.qemu.guest_agent.0",
    "/dev/tty.org.qemu.guest_agent.0",
    // Generic virtio console names
    "/dev/cu.virtio-console.0",
    "/dev/tty.virtio-console.0",
    "/dev/cu.virtio-serial",
    "/dev/tty.virtio-serial",
    "/dev/cu.virtio-port",
    "/dev/tty.virtio-port",
    "/dev/cu.qemu-guest-agent",
    "/dev/tty.qemu-guest-agent",
];

/// Transport over a virtio-serial character device.
///
/// Reader and writer halves are locked separately; the open flag is atomic so
/// `is_open()` never waits behind a blocked read.
pub struct DeviceTransport {
    configured_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    read_timeout: Duration,
    write_timeout: Duration,
    reader: Mutex<Option<LineReader<PortHandle>>>,
    writer: Mutex<Option<PortHandle>>,
    open: AtomicBool,
}

impl DeviceTransport {
    /// Transport for `path`, or auto-detected when `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            configured_path: path,
            candidates: CANDIDATE_DEVICES.iter().map(PathBuf::from).collect(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.candidates = candidates;
        self
    }

    fn resolve_path(&self) -> Result<PathBuf, TransportError> {
        if let Some(path) = &self.configured_path {
            return Ok(path.clone());
        }
        detect_device(&self.candidates)
    }

    async fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.reader.lock().await.take();
        self.writer.lock().await.take();
    }
}

/// Return the first candidate that exists and is a character device.
pub fn detect_device(candidates: &[PathBuf]) -> Result<PathBuf, TransportError> {
    debug!("Probing for guest agent device");
    for path in candidates {
        match std::fs::metadata(path) {
            Ok(meta) if meta.file_type().is_char_device() => {
                info!(device = %path.display(), "Detected guest agent device");
                return Ok(path.clone());
            }
            Ok(_) => debug!(path = %path.display(), "Path exists but is not a character device"),
            Err(e) => debug!(path = %path.display(), error = %e, "Device path not present"),
        }
    }
    Err(TransportError::no_device_found(candidates))
}

/// Read errors after which the handle is unusable.
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Open `path` non-blocking and register it with the reactor.
///
/// Files the reactor cannot poll (regular files, for one) are refused here.
fn open_device(path: &Path) -> Result<PortHandle, TransportError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
        .open(path)
        .map_err(|e| TransportError::device_unavailable(path, e))?;
    let fd = AsyncFd::new(file).map_err(|e| TransportError::device_unavailable(path, e))?;
    Ok(PortHandle(Arc::new(fd)))
}

/// Shared non-blocking handle on the open port.
///
/// The reader and the writer each hold a clone; the descriptor is closed and
/// deregistered when the last one drops.
#[derive(Clone)]
struct PortHandle(Arc<AsyncFd<File>>);

impl AsyncRead for PortHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.0.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| {
                let mut file: &File = fd.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PortHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.0.poll_write_ready(cx))?;
            match guard.try_io(|fd| {
                let mut file: &File = fd.get_ref();
                file.write(data)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    // Writes go straight to the descriptor.
    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Transport for DeviceTransport {
    #[instrument(skip(self), fields(configured = ?self.configured_path))]
    async fn open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            return Ok(());
        }

        let path = self.resolve_path()?;
        let port = open_device(&path)?;

        *self.reader.lock().await = Some(LineReader::new(port.clone()));
        *self.writer.lock().await = Some(port);
        self.open.store(true, Ordering::Release);

        info!(device = %path.display(), "Opened guest agent device");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.mark_closed().await;
        info!("Closed guest agent device");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        let result = {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(TransportError::NotOpen)?;
            reader.next_line(self.read_timeout).await
        };

        match &result {
            Ok(line) => debug!(bytes = line.len(), "Received message"),
            Err(TransportError::ConnectionClosed) => {
                warn!("Device reported end of stream");
                self.mark_closed().await;
            }
            Err(TransportError::ReadFailure(e)) if is_fatal(e) => {
                warn!(error = %e, "Fatal device read error");
                self.mark_closed().await;
            }
            Err(_) => {}
        }
        result
    }

    async fn send_message(&self, payload: &[u8], delimited: bool) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotOpen)?;

        match tokio::time::timeout(self.write_timeout, write_frame(writer, payload, delimited)).await {
            Ok(Ok(())) => {
                debug!(bytes = payload.len(), delimited, "Sent response");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::WriteFailure(e)),
            Err(_) => Err(TransportError::WriteFailure(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {:?}", self.write_timeout),
            ))),
        }
    }
}
