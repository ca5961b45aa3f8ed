//! HTTP and WebSocket routes for the Ember kernel.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::{IntoResponse, Json},
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{oneshot, watch};
use tower_http::cors::CorsLayer;

use crate::error::ServerError;
use crate::protocol::Message;
use crate::runner::{KernelRunner, wait_stopped};
use crate::sink::BroadcastSink;

/// How long a closing connection may take to flush queued replies.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Application state shared across handlers.
pub struct AppState {
    /// The running kernel.
    pub runner: Arc<KernelRunner>,
    /// Every outbound kernel message, for WebSocket clients to subscribe to.
    pub events: BroadcastSink,
    connections: watch::Sender<usize>,
}

impl AppState {
    pub fn new(runner: Arc<KernelRunner>, events: BroadcastSink) -> Self {
        Self {
            runner,
            events,
            connections: watch::Sender::new(0),
        }
    }

    /// Number of open WebSocket connections.
    pub fn connections(&self) -> usize {
        *self.connections.borrow()
    }

    /// Wait until every WebSocket connection has flushed and closed.
    ///
    /// Returns `false` if some were still open after `timeout`.
    pub async fn wait_disconnected(&self, timeout: Duration) -> bool {
        let mut connections = self.connections.subscribe();
        tokio::time::timeout(timeout, connections.wait_for(|open| *open == 0))
            .await
            .is_ok()
    }
}

/// Counts a WebSocket connection as open while alive.
struct Connection(Arc<AppState>);

impl Connection {
    fn open(state: Arc<AppState>) -> Self {
        state.connections.send_modify(|open| *open += 1);
        Self(state)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.0.connections.send_modify(|open| *open -= 1);
    }
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dispatcher = state.runner.dispatcher();
    Json(serde_json::json!({
        "status": if state.runner.is_stopped() { "stopped" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "session": dispatcher.config().session,
        "executing": dispatcher.scheduler().is_executing(),
        "execution_count": dispatcher.execution_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

/// Send one protocol message as a text frame.
///
/// Returns `false` once the client is gone.
async fn send_message(sender: &mut SplitSink<WebSocket, WsMessage>, msg: &Message) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Failed to encode outbound message: {}", e);
            return true;
        }
    };
    sender.send(WsMessage::Text(json.into())).await.is_ok()
}

/// Handle one WebSocket connection.
///
/// Every text frame is one protocol message. All outbound kernel messages
/// are forwarded to every connected client. When the connection ends,
/// messages already queued for it are flushed before the socket closes.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _connection = Connection::open(state.clone());
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events.subscribe();
    let (finish_tx, mut finish_rx) = oneshot::channel::<()>();

    let forward_task = tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = &mut finish_rx => break,
            };
            match received {
                Ok(msg) => {
                    if !send_message(&mut sender, &msg).await {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("WebSocket client lagging, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(msg) => {
                    if !send_message(&mut sender, &msg).await {
                        return;
                    }
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        let _ = sender.close().await;
    });

    let stopped = wait_stopped(state.runner.subscribe_stopped());
    tokio::pin!(stopped);

    loop {
        let result = tokio::select! {
            result = receiver.next() => result,
            _ = &mut stopped => break,
        };
        match result {
            Some(Ok(WsMessage::Text(text))) => match state.runner.submit_raw(&text) {
                Ok(()) => {}
                Err(ServerError::KernelStopped) => break,
                Err(e) => tracing::warn!("Failed to submit message: {}", e),
            },
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    let _ = finish_tx.send(());
    let mut forward_task = forward_task;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut forward_task)
        .await
        .is_err()
    {
        tracing::warn!("WebSocket client did not take queued messages in time");
        forward_task.abort();
    }
}
