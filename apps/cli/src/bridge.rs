//! Browser Extension Bridge
//!
//! HTTP + WebSocket server for the browser extension.
//! Runs on localhost:<port> (default 7899).
//!
//! - HTTP carries extension messages when no socket is open
//! - The WebSocket is the host channel: host calls go out as request frames,
//!   replies, download changes and extension messages come back in
//! - Core events are forwarded to the socket as they happen

use crate::remote_host::{HostReply, RemoteHost};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, Method},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use linkdrop_core::LinkdropCore;
use linkdrop_types::{CoreEvent, ExtensionMessage};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

// ============================================================================
// Request/Response types
// ============================================================================

/// Status response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    pub version: String,
    pub active_batches: usize,
    pub installed_rules: usize,
}

/// Response to an extension message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageResponse {
    fn from_result(result: Result<Option<Uuid>, linkdrop_core::LinkdropError>) -> Self {
        match result {
            Ok(batch_id) => Self {
                success: true,
                batch_id,
                error: None,
            },
            Err(e) => Self {
                success: false,
                batch_id: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// A frame the extension sends over the socket
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Reply(HostReply),
    Message(ExtensionMessage),
}

/// Core event frame sent to the extension
#[derive(Debug, Clone, Serialize)]
struct EventFrame<'a> {
    event: &'a CoreEvent,
}

// ============================================================================
// Shared state
// ============================================================================

pub struct ServerState {
    pub core: Arc<LinkdropCore>,
    pub host: Arc<RemoteHost>,
}

type SharedState = Arc<ServerState>;

// ============================================================================
// Bridge Server
// ============================================================================

pub struct BridgeServer {
    core: Arc<LinkdropCore>,
    host: Arc<RemoteHost>,
    port: u16,
}

impl BridgeServer {
    pub fn new(core: Arc<LinkdropCore>, host: Arc<RemoteHost>, port: u16) -> Self {
        Self {
            core,
            host,
            port,
        }
    }

    pub fn router(&self) -> Router {
        let shared_state = Arc::new(ServerState {
            core: self.core.clone(),
            host: self.host.clone(),
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        Router::new()
            // Health check, the extension pings this to find the backend
            .route("/ping", get(|| async { "pong" }))
            .route("/api/status", get(handle_status))
            .route("/api/message", post(handle_message))
            // Host channel
            .route("/ws", get(handle_websocket))
            .layer(cors)
            .with_state(shared_state)
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        tracing::info!("Extension bridge listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// GET /api/status
async fn handle_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(StatusResponse {
        connected: state.host.is_connected(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_batches: state.core.active_batches().len(),
        installed_rules: state.core.rules().len(),
    })
}

/// POST /api/message
async fn handle_message(
    State(state): State<SharedState>,
    Json(message): Json<ExtensionMessage>,
) -> impl IntoResponse {
    let result = state.core.handle_message(message).await;
    if let Err(e) = &result {
        tracing::warn!("Failed to handle extension message: {}", e);
    }
    Json(MessageResponse::from_result(result))
}

// ============================================================================
// WebSocket - host channel
// ============================================================================

async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: SharedState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Host requests and core events share one writer
    let (tx, mut rx) = mpsc::channel::<String>(128);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut event_rx = state.core.subscribe();
    let event_tx = tx.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            let event = match event_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event forwarding lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if let Ok(json) = serde_json::to_string(&EventFrame { event: &event }) {
                if event_tx.send(json).await.is_err() {
                    break;
                }
            }
        }
    });

    let generation = state.host.attach(tx);
    tracing::info!("Extension connected");

    // Extension (re)loaded. The flush's host calls are answered through the
    // read loop below; messages wait until it is done.
    let flushed = start_flush(state.core.clone());

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => handle_frame(&state, &text, &flushed),
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Cleanup
    state.host.detach(generation);
    forward_task.abort();
    send_task.abort();
    tracing::info!("Extension disconnected");
}

/// Flush header rules for a new connection; the receiver turns `true` once done
fn start_flush(core: Arc<LinkdropCore>) -> watch::Receiver<bool> {
    let (done_tx, done_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = core.flush_rules().await {
            tracing::warn!("Failed to flush header rules for new connection: {}", e);
        }
        let _ = done_tx.send(true);
    });
    done_rx
}

fn handle_frame(state: &SharedState, text: &str, flushed: &watch::Receiver<bool>) {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Ignoring malformed frame from extension: {}", e);
            return;
        }
    };

    match frame {
        InboundFrame::Reply(reply) => state.host.resolve(reply),
        InboundFrame::Message(message) => {
            // Messages may call back into the host, whose replies arrive on this socket
            let core = state.core.clone();
            let mut flushed = flushed.clone();
            tokio::spawn(async move {
                // An error means the flush task is gone, which also ends the wait
                let _ = flushed.wait_for(|done| *done).await;
                if let Err(e) = core.handle_message(message).await {
                    tracing::warn!("Failed to handle extension message: {}", e);
                    core.emit(CoreEvent::Error {
                        message: e.to_string(),
                        context: Some("extension message".to_string()),
                    });
                }
            });
        }
    }
}
