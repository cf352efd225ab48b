//! Filesystem freeze commands.
//!
//! The freeze is simulated: no filesystem is quiesced. What is real is the
//! gating transition, so while "frozen" only the frozen-mode command set runs.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::error::HandlerError;
use crate::registry::CommandDescriptor;
use crate::state::AgentState;

pub fn descriptors(state: &Arc<AgentState>) -> Vec<CommandDescriptor> {
    let status_state = Arc::clone(state);
    let freeze_state = Arc::clone(state);
    let thaw_state = Arc::clone(state);

    vec![
        CommandDescriptor::new("guest-fsfreeze-status", move |_| Ok(status(&status_state))),
        CommandDescriptor::new("guest-fsfreeze-freeze", move |_| freeze(&freeze_state)),
        CommandDescriptor::new("guest-fsfreeze-thaw", move |_| Ok(thaw(&thaw_state))),
    ]
}

fn status(state: &AgentState) -> Value {
    if state.is_frozen() {
        json!("frozen")
    } else {
        json!("thawed")
    }
}

/// Returns the number of filesystems frozen: always the root.
fn freeze(state: &AgentState) -> Result<Value, HandlerError> {
    if !state.freeze() {
        return Err(HandlerError::failed("filesystems are already frozen"));
    }
    info!("Simulated filesystem freeze, restricting commands");
    Ok(json!(1))
}

/// Returns the number of filesystems thawed.
fn thaw(state: &AgentState) -> Value {
    if state.thaw() {
        info!("Simulated filesystem thaw, all commands available");
        json!(1)
    } else {
        json!(0)
    }
}
