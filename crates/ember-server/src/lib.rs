//! Ember notebook kernel server.
//!
//! Speaks the notebook messaging protocol over WebSocket or newline
//! delimited JSON, and drives an [`Evaluator`] through the execution
//! scheduler from `ember-core`.
//!
//! # Architecture
//!
//! - **Protocol**: message envelope and content types
//! - **Dispatcher**: turns each request into its reply sequence
//! - **Runner**: per-channel threads so control messages overtake execution
//! - **Routes**: HTTP and WebSocket handlers
//! - **Sink**: where outbound messages go (broadcast, writer, recording)

pub mod comm;
pub mod config;
pub mod dispatcher;
pub mod display;
pub mod error;
pub mod magic;
pub mod protocol;
pub mod render;
pub mod routes;
pub mod runner;
pub mod sink;
pub mod stdin;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ember_core::Evaluator;

pub use comm::{CommManager, CommTarget, EchoComm, InMemoryCommManager};
pub use config::{KernelConfig, KernelMode};
pub use dispatcher::ProtocolDispatcher;
pub use error::{ServerError, ServerResult};
pub use protocol::{Channel, Header, Message, Request};
pub use routes::{AppState, create_router};
pub use runner::{KernelRunner, StopReason};
pub use sink::{BroadcastSink, MessageSink, Outbox, RecordingSink, WriterSink};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> ServerResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }
}

/// How long stopped connections get to deliver their last replies.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve a kernel over WebSocket until it shuts down or Ctrl+C is pressed.
///
/// A standalone kernel does not exit the process itself: it returns
/// [`StopReason::Exit`] after every client has received the shutdown reply,
/// and the caller exits.
pub async fn serve(
    config: ServerConfig,
    kernel: KernelConfig,
    evaluator: Arc<dyn Evaluator>,
    comms: Arc<dyn CommManager>,
) -> ServerResult<StopReason> {
    let addr = config.addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting Ember kernel at ws://{}/ws", addr);
    serve_on(listener, kernel, evaluator, comms).await
}

/// [`serve`] on an already bound listener.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    kernel: KernelConfig,
    evaluator: Arc<dyn Evaluator>,
    comms: Arc<dyn CommManager>,
) -> ServerResult<StopReason> {
    let (events, _rx) = BroadcastSink::new(kernel.event_capacity);
    let dispatcher = ProtocolDispatcher::new(kernel, evaluator, comms, Arc::new(events.clone()))?;
    let runner = Arc::new(KernelRunner::start(dispatcher)?);

    let state = Arc::new(AppState::new(runner.clone(), events));
    let app = create_router(state.clone());

    // Handle Ctrl+C for graceful shutdown
    let signal_runner = runner.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_runner.request_stop();
        }
    });

    let stopped = runner.subscribe_stopped();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            runner::wait_stopped(stopped).await;
        })
        .await?;

    signal_task.abort();
    if !state.wait_disconnected(DISCONNECT_TIMEOUT).await {
        tracing::warn!(
            connections = state.connections(),
            "closing with WebSocket connections still open"
        );
    }
    let closing = runner.clone();
    if tokio::task::spawn_blocking(move || closing.close()).await.is_err() {
        tracing::warn!("kernel close panicked");
    }

    let reason = runner.stop_reason().unwrap_or(StopReason::Stopped);
    tracing::info!(?reason, "Server shutdown complete");
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8888);
        assert_eq!(config.addr().unwrap().port(), 8888);
    }

    #[test]
    fn test_invalid_address() {
        let config = ServerConfig {
            host: "not a host".to_string(),
            port: 1,
        };
        assert!(matches!(config.addr(), Err(ServerError::InvalidAddress(_))));
    }
}
