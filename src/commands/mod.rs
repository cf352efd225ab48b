//! Built-in guest agent commands.
//!
//! Each submodule contributes a list of descriptors; [`build_registry`] puts
//! them together into the immutable registry shared by the loop.

pub mod file;
pub mod fsfreeze;
pub mod shutdown;
pub mod sync;
pub mod system;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::Config;
use crate::error::HandlerError;
use crate::registry::{CommandDescriptor, Registry};
use crate::state::AgentState;

/// Version reported by `guest-info`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const INFO_COMMAND: &str = "guest-info";

/// Build the command registry.
///
/// Commands named in `config.block_rpcs` are registered disabled, so
/// `guest-info` reports them with `"enabled": false`. `guest-info` itself is
/// registered last with a snapshot of the final command list.
pub fn build_registry(state: &Arc<AgentState>, config: &Config) -> Registry {
    let files = Arc::new(file::FileTable::new(Arc::clone(state)));

    let mut descriptors = sync::descriptors();
    descriptors.extend(fsfreeze::descriptors(state));
    descriptors.extend(system::descriptors());
    descriptors.extend(shutdown::descriptors());
    descriptors.extend(file::descriptors(&files));
    // Placeholder so the snapshot lists guest-info too.
    descriptors.push(CommandDescriptor::new(INFO_COMMAND, |_| Ok(Value::Null)));

    let mut registry = Registry::from_descriptors(descriptors.into_iter().map(|descriptor| {
        let enabled = !config.block_rpcs.iter().any(|name| name == descriptor.name());
        descriptor.enabled(enabled)
    }));

    let info_enabled = registry
        .lookup(INFO_COMMAND)
        .map_or(true, CommandDescriptor::is_enabled);
    let snapshot = info_snapshot(&registry);
    registry.register(
        CommandDescriptor::new(INFO_COMMAND, move |_| Ok(snapshot.clone())).enabled(info_enabled),
    );

    info!(commands = registry.len(), "Command registry built");
    registry
}

/// The `guest-info` payload for `registry`.
pub fn info_snapshot(registry: &Registry) -> Value {
    let commands: Vec<Value> = registry
        .list_sorted()
        .into_iter()
        .map(|d| {
            json!({
                "name": d.name(),
                "enabled": d.is_enabled(),
                "success-response": true,
            })
        })
        .collect();

    json!({
        "version": AGENT_VERSION,
        "supported_commands": commands,
    })
}

/// Serialize a handler result.
pub(crate) fn to_return<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value)
        .map_err(|e| HandlerError::failed(format!("failed to encode result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorClass;

    fn registry_with(config: &Config) -> Registry {
        build_registry(&Arc::new(AgentState::new()), config)
    }

    #[test]
    fn registers_core_commands() {
        let registry = registry_with(&Config::default());
        for name in [
            "guest-ping",
            "guest-sync",
            "guest-sync-id",
            "guest-sync-delimited",
            "guest-info",
            "guest-fsfreeze-status",
            "guest-fsfreeze-freeze",
            "guest-fsfreeze-thaw",
            "guest-get-host-name",
            "guest-get-hostname",
            "guest-get-time",
            "guest-get-timezone",
            "guest-get-osinfo",
            "guest-get-vcpus",
            "guest-shutdown",
            "guest-file-open",
            "guest-file-read",
            "guest-file-write",
            "guest-file-flush",
            "guest-file-close",
        ] {
            assert!(registry.lookup(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn info_lists_every_command_sorted() {
        let registry = registry_with(&Config::default());
        let info = registry.dispatch(INFO_COMMAND, None).unwrap();

        assert_eq!(info["version"], AGENT_VERSION);
        let names: Vec<&str> = info["supported_commands"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();

        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), registry.len());
        assert!(names.contains(&INFO_COMMAND));
        assert!(info["supported_commands"]
            .as_array()
            .unwrap()
            .iter()
            .all(|c| c["success-response"] == true));
    }

    #[test]
    fn blocked_commands_are_registered_disabled() {
        let config = Config {
            block_rpcs: vec!["guest-shutdown".into()],
            ..Config::default()
        };
        let registry = registry_with(&config);

        assert!(!registry.lookup("guest-shutdown").unwrap().is_enabled());
        let err = registry.dispatch("guest-shutdown", None).unwrap_err();
        assert_eq!(err.class, ErrorClass::CommandNotFound);

        let info = registry.dispatch(INFO_COMMAND, None).unwrap();
        let shutdown = info["supported_commands"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["name"] == "guest-shutdown")
            .unwrap();
        assert_eq!(shutdown["enabled"], false);
    }
}
