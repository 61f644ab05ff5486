//! UI push channel.
//!
//! [`Broadcaster`] is the best-effort sink the orchestrator and
//! scheduler write lifecycle events into; the buffer is bounded and a
//! lagging consumer loses the oldest events rather than blocking
//! producers. The axum router upgrades websocket clients and forwards
//! the stream, and serves a read-only worker snapshot for the UI.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Result, ServerError};
use crate::registry::SharedWorkers;

/// A lifecycle event pushed to UI clients.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    /// Best-effort push; with no subscribers the event is dropped.
    pub fn send(&self, event: &str, payload: serde_json::Value) {
        let _ = self.tx.send(Event {
            event: event.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub broadcaster: Broadcaster,
    pub workers: SharedWorkers,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/workers", get(list_workers))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

/// Serve the UI endpoints until shutdown.
pub async fn serve(addr: SocketAddr, state: HttpState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Fatal(format!("http listener on {addr}: {e}")))?;
    tracing::info!(addr = %addr, "UI push listener started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| ServerError::Fatal(format!("http server: {e}")))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut events: broadcast::Receiver<Event>) {
    tracing::info!("WebSocket connection established");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Slow websocket consumer, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::info!("WebSocket connection closed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn list_workers(State(state): State<HttpState>) -> impl IntoResponse {
    let workers = state.workers.read().await;
    let mut list: Vec<_> = workers.values().cloned().collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    Json(list)
}
