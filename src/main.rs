//! qmp-guest-agent
//!
//! Answers QEMU guest agent requests from the host over a virtio-serial port,
//! or over stdin/stdout with `--stdio` for interactive testing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qmp_guest_agent::agent::Agent;
use qmp_guest_agent::commands::build_registry;
use qmp_guest_agent::config::{Config, Overrides};
use qmp_guest_agent::dispatch::Dispatcher;
use qmp_guest_agent::state::AgentState;
use qmp_guest_agent::transport::{DeviceTransport, StdioTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "qmp-guest-agent")]
#[command(about = "Guest agent answering the QEMU guest agent protocol", version)]
struct Args {
    /// Character device to use (auto-detected if omitted)
    #[arg(long, short = 'p')]
    device: Option<PathBuf>,

    /// Use stdin/stdout instead of a device
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Comma-separated commands to block
    #[arg(long, short = 'b', value_delimiter = ',')]
    block_rpcs: Option<Vec<String>>,

    /// Comma-separated commands to allow (all others are blocked)
    #[arg(long, short = 'a', value_delimiter = ',')]
    allow_rpcs: Option<Vec<String>>,

    /// JSON config file (defaults to $QGA_CONFIG)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for the stdio transport)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply(Overrides {
        device: args.device,
        stdio: args.stdio,
        block_rpcs: args.block_rpcs,
        allow_rpcs: args.allow_rpcs,
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stdio = config.stdio,
        device = ?config.device,
        blocked = ?config.block_rpcs,
        allowed = ?config.allow_rpcs,
        "Starting guest agent"
    );

    let state = Arc::new(AgentState::with_lists(
        config.block_rpcs.iter().cloned(),
        config.allow_rpcs.iter().cloned(),
    ));
    let registry = Arc::new(build_registry(&state, &config));
    let dispatcher = Dispatcher::new(registry, state);

    let transport: Arc<dyn Transport> = if config.stdio {
        Arc::new(StdioTransport::new().with_read_timeout(config.read_timeout()))
    } else {
        Arc::new(
            DeviceTransport::new(config.device.clone())
                .with_timeouts(config.read_timeout(), config.write_timeout()),
        )
    };

    let agent = Agent::new(transport, dispatcher).with_timings(config.loop_timings());
    agent.start().await.context("Failed to start agent")?;

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received");
    agent.stop().await;

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT"),
        _ = terminate.recv() => Ok(()),
    }
}
