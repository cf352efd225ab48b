//! Per-line request pipeline.
//!
//! Turns one received line into one framed response:
//! decode → gate → registry dispatch → encode → choose framing.
//! Everything here is synchronous and runs inside the supervisory loop's task;
//! no lock is held while a handler runs.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{decode_request, encode_response, ErrorClass, QmpError, Response};
use crate::registry::Registry;
use crate::state::AgentState;

/// Command whose response is framed with the sync delimiter.
pub const SYNC_DELIMITED_COMMAND: &str = "guest-sync-delimited";

/// Commands polled often enough that they only log at debug level.
const QUIET_COMMANDS: &[&str] = &["guest-ping", "guest-sync", SYNC_DELIMITED_COMMAND];

const HANDLER_PANIC_DESC: &str = "Command handler failed unexpectedly";

/// An encoded response and how to frame it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: Vec<u8>,
    pub delimited: bool,
}

/// Stateless request handler over a shared registry and gating state.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    state: Arc<AgentState>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, state: Arc<AgentState>) -> Self {
        Self { registry, state }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Handle one trimmed, non-empty line. Always produces a response.
    pub fn handle_line(&self, line: &[u8]) -> Outbound {
        let request = match decode_request(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                // No command known, so never delimited.
                self.state.set_response_delimited(false);
                return Outbound {
                    payload: encode_response(&Response::malformed()),
                    delimited: false,
                };
            }
        };

        let command = request.command();
        if QUIET_COMMANDS.contains(&command) {
            debug!(command = %command, id = ?request.id, "Received command");
        } else {
            info!(command = %command, id = ?request.id, "Received command");
        }

        if command == SYNC_DELIMITED_COMMAND {
            self.state.set_response_delimited(true);
        }

        let result = if self.state.is_command_allowed(command) {
            self.registry.dispatch(command, request.arguments())
        } else {
            info!(command = %command, mode = ?self.state.mode(), "Command rejected by gating");
            Err(QmpError::command_not_found(command))
        };

        let response = match result {
            Ok(value) => Response::success(value),
            Err(err) => Response::failure(err),
        }
        .with_id(request.id);

        Outbound {
            payload: encode_response(&response),
            delimited: self.state.take_response_delimited(),
        }
    }

    /// Response for a line whose handling panicked: `InternalError` carrying
    /// the request's id, framed as the request asked.
    pub fn handle_panic(&self, line: &[u8]) -> Outbound {
        let id = decode_request(line).ok().and_then(|request| request.id);
        let response = Response::<Value>::failure(QmpError::new(
            ErrorClass::InternalError,
            HANDLER_PANIC_DESC,
        ))
        .with_id(id);

        Outbound {
            payload: encode_response(&response),
            delimited: self.state.take_response_delimited(),
        }
    }
}
