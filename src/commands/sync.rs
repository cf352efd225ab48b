//! Liveness and synchronization commands.

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};

use crate::dispatch::SYNC_DELIMITED_COMMAND;
use crate::error::HandlerError;
use crate::protocol::parse_arguments;
use crate::registry::CommandDescriptor;

#[derive(Debug, Deserialize)]
struct SyncArgs {
    id: i64,
}

pub fn descriptors() -> Vec<CommandDescriptor> {
    vec![
        CommandDescriptor::new("guest-ping", ping),
        CommandDescriptor::new("guest-sync", sync),
        CommandDescriptor::new("guest-sync-id", sync),
        // Framing is handled by the dispatcher; the payload is the same.
        CommandDescriptor::new(SYNC_DELIMITED_COMMAND, sync),
    ]
}

fn ping(_: Option<&RawValue>) -> Result<Value, HandlerError> {
    Ok(json!({}))
}

/// Echo `arguments.id` back so the host can discard stale responses.
fn sync(args: Option<&RawValue>) -> Result<Value, HandlerError> {
    let args: SyncArgs = parse_arguments(args)?;
    Ok(json!(args.id))
}
