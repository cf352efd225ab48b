//! Command registry: name → handler + enabled flag.
//!
//! Built once at startup from a declared list of descriptors and read-only
//! afterwards, so it is shared as `Arc<Registry>` without a lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::value::RawValue;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::protocol::QmpError;

/// Handler signature: opaque raw arguments in, JSON value or error out.
pub type HandlerFn = dyn Fn(Option<&RawValue>) -> Result<Value, HandlerError> + Send + Sync;

/// A registered command.
#[derive(Clone)]
pub struct CommandDescriptor {
    name: String,
    handler: Arc<HandlerFn>,
    enabled: bool,
}

impl CommandDescriptor {
    /// An enabled command.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<&RawValue>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            enabled: true,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run the handler.
    pub fn invoke(&self, arguments: Option<&RawValue>) -> Result<Value, HandlerError> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// The command table.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    commands: BTreeMap<String, CommandDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from descriptors in order; later duplicates replace earlier ones.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = CommandDescriptor>) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Add or replace a command. Descriptors with an empty name are ignored.
    pub fn register(&mut self, descriptor: CommandDescriptor) {
        if descriptor.name.is_empty() {
            return;
        }
        debug!(command = %descriptor.name, enabled = descriptor.enabled, "Registering command");
        self.commands.insert(descriptor.name.clone(), descriptor);
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    /// All commands ordered by name. Introspection only.
    pub fn list_sorted(&self) -> Vec<&CommandDescriptor> {
        self.commands.values().collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Resolve `name` and run its handler.
    ///
    /// Unknown and disabled commands are `CommandNotFound`. Arguments reach the
    /// handler untouched, whatever their JSON shape. Handler failures become
    /// `GenericError` with the handler's message.
    pub fn dispatch(&self, name: &str, arguments: Option<&RawValue>) -> Result<Value, QmpError> {
        let descriptor = match self.lookup(name) {
            Some(d) if d.enabled => d,
            _ => {
                warn!(command = %name, "Command not found or disabled");
                return Err(QmpError::command_not_found(name));
            }
        };

        descriptor.invoke(arguments).map_err(|e| {
            warn!(command = %name, error = %e, "Command failed");
            QmpError::from(e)
        })
    }
}
