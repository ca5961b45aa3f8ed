//! Ember CLI - notebook kernel for the built-in calculator language.

mod colors;
mod serve;
mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ember_core::Evaluator;
use ember_core::evaluator::calc::Calculator;
use ember_server::{
    CommManager, EchoComm, InMemoryCommManager, KernelConfig, KernelMode, StopReason,
};

/// Comm target answering every message with its own payload.
const ECHO_COMM_TARGET: &str = "ember.echo";

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Notebook kernel runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Kernel configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run embedded: shutdown stops the kernel instead of exiting
    #[arg(long, global = true)]
    embedded: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the kernel over WebSocket
    Serve {
        /// Host address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8888")]
        port: u16,
    },

    /// Speak newline-delimited JSON messages over stdin and stdout
    Stdio,
}

/// Load the kernel configuration and apply command line overrides.
fn kernel_config(cli: &Cli) -> anyhow::Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Cannot load {}: {}", path.display(), e))?,
        None => KernelConfig::default(),
    };
    if cli.embedded {
        config.mode = KernelMode::Embedded;
    }
    Ok(config)
}

/// The evaluator and comm targets this binary ships with.
fn kernel_parts() -> (Arc<dyn Evaluator>, Arc<dyn CommManager>) {
    let comms = InMemoryCommManager::new();
    comms.register_target(ECHO_COMM_TARGET, Arc::new(EchoComm));
    (Arc::new(Calculator::new()), Arc::new(comms))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging. Stdout may carry protocol messages, so logs go to stderr.
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = kernel_config(&cli)?;

    let reason = match cli.command {
        Commands::Serve { host, port } => serve::execute(host, port, config).await?,
        Commands::Stdio => stdio::execute(config).await?,
    };

    // Abandoned workers or a blocked stdin reader must not hold the process.
    if reason == StopReason::Exit {
        tracing::info!("exiting after shutdown request");
        std::process::exit(0);
    }

    Ok(())
}
