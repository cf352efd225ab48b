//! qmp-guest-agent library
//!
//! Guest-side engine for the QEMU guest agent protocol:
//! - Transports: virtio-serial character device and stdin/stdout
//! - Line codec for `execute`/`return`/`error` messages
//! - Command registry, gating state, and the supervisory loop
//! - Built-in guest commands

pub mod agent;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod transport;
