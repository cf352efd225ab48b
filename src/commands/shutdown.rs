//! `guest-shutdown`.
//!
//! The response goes out first; the OS action runs afterwards as a detached
//! task with its own deadline. `Agent::stop()` does not cancel it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::HandlerError;
use crate::protocol::parse_arguments;
use crate::registry::CommandDescriptor;

/// Delay before acting, so the response can reach the host.
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(200);

/// Bound on the OS shutdown command.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ShutdownMode {
    #[default]
    Powerdown,
    Halt,
    Reboot,
}

impl ShutdownMode {
    const fn shutdown_flag(self) -> &'static str {
        match self {
            Self::Powerdown => "-P",
            Self::Halt => "-H",
            Self::Reboot => "-r",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ShutdownArgs {
    #[serde(default)]
    mode: ShutdownMode,
}

pub fn descriptors() -> Vec<CommandDescriptor> {
    vec![CommandDescriptor::new("guest-shutdown", shutdown)]
}

fn shutdown(args: Option<&RawValue>) -> Result<Value, HandlerError> {
    let args: ShutdownArgs = parse_arguments(args)?;
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| HandlerError::failed(format!("cannot schedule shutdown: {e}")))?;

    info!(mode = ?args.mode, "Shutdown requested");
    runtime.spawn(run_shutdown(args.mode));
    Ok(json!({}))
}

async fn run_shutdown(mode: ShutdownMode) {
    tokio::time::sleep(SHUTDOWN_DELAY).await;

    let flag = mode.shutdown_flag();
    info!(mode = ?mode, timeout = ?SHUTDOWN_TIMEOUT, "Executing shutdown");
    let mut command = Command::new("shutdown");
    command.args([flag, "now"]).kill_on_drop(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, command.status()).await {
        Ok(Ok(status)) if status.success() => info!("Shutdown command accepted"),
        Ok(Ok(status)) => error!(%status, "Shutdown command failed"),
        Ok(Err(e)) => error!(error = %e, "Failed to run shutdown command"),
        Err(_) => warn!(timeout = ?SHUTDOWN_TIMEOUT, "Shutdown command timed out"),
    }
}
