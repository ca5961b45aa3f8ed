//! Serve command implementation for Ember CLI.
//!
//! Starts the kernel behind a WebSocket endpoint.

use ember_server::{KernelConfig, ServerConfig, StopReason};

use crate::colors;

/// Start the kernel server.
pub async fn execute(host: String, port: u16, kernel: KernelConfig) -> anyhow::Result<StopReason> {
    let config = ServerConfig { host, port };
    // Fail on a bad address before printing the banner.
    config.addr()?;

    println!(
        "\n{}Ember Kernel{} - Notebook Runtime",
        colors::BOLD,
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Session:{} {}",
        colors::CYAN,
        colors::RESET,
        kernel.session
    );
    println!(
        "{}  ◆ Mode:{} {:?}",
        colors::CYAN,
        colors::RESET,
        kernel.mode
    );
    println!(
        "{}  ◆ WebSocket:{} ws://{}:{}/ws",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!(
        "{}  ◆ Health:{} http://{}:{}/health",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    let (evaluator, comms) = crate::kernel_parts();
    let reason = ember_server::serve(config, kernel, evaluator, comms).await?;

    Ok(reason)
}
