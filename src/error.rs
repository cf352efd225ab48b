//! Error types shared across the agent.
//!
//! Transport errors drive the supervisory loop's retry policy and never reach
//! the peer. Protocol and handler errors are always resolved into a wire-level
//! `error` response.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// No usable device could be opened.
    #[error("device unavailable: {message}")]
    DeviceUnavailable {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// An operation was attempted on a transport that is not open.
    #[error("transport is not open")]
    NotOpen,

    /// The bounded read wait expired without a complete line.
    #[error("read timed out")]
    Timeout,

    /// A line arrived but contained only whitespace.
    #[error("empty message")]
    EmptyMessage,

    /// The peer closed the channel (end of stream).
    #[error("connection closed")]
    ConnectionClosed,

    /// A hard read error from the underlying stream.
    #[error("read failed: {0}")]
    ReadFailure(#[source] io::Error),

    /// Writing or flushing a response failed.
    #[error("write failed: {0}")]
    WriteFailure(#[source] io::Error),
}

impl TransportError {
    pub(crate) fn device_unavailable(path: &std::path::Path, source: io::Error) -> Self {
        Self::DeviceUnavailable {
            message: format!("cannot open {}: {source}", path.display()),
            source: Some(source),
        }
    }

    pub(crate) fn no_device_found(probed: &[PathBuf]) -> Self {
        let probed: Vec<_> = probed.iter().map(|p| p.display().to_string()).collect();
        Self::DeviceUnavailable {
            message: format!("no guest agent device found, probed: {probed:?}"),
            source: None,
        }
    }

    /// Whether the loop should retry silently (no logging, no backoff).
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Timeout | Self::EmptyMessage)
    }
}

/// Failures decoding a request line.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON or does not match the request envelope.
    #[error("malformed request: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The `execute` member is present but empty.
    #[error("request has an empty command name")]
    MissingCommand,
}

/// Failures reported by a command handler.
///
/// Every variant reaches the peer as a `GenericError` carrying the display
/// text as its description.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The handler could not interpret its arguments.
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),

    /// A platform operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Lifecycle failures from [`Agent`](crate::agent::Agent).
#[derive(Debug, Error)]
pub enum AgentError {
    /// `start()` was called while the loop is already starting or running.
    #[error("agent is already running")]
    AlreadyRunning,

    /// The transport could not be opened on start.
    #[error("failed to open transport: {0}")]
    Open(#[source] TransportError),
}
