use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use fwdpanel_core::{
    Envelope, EventKind, MAX_MESSAGE_BYTES, decode_envelope, envelope_from_value, pong_frame,
};
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, info, warn};

type ClientId = u64;

#[derive(Debug, Default)]
struct HubState {
    next_id: ClientId,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Message>>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<HubState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubState::default())),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Pushes `envelope` to every connected socket except `skip`.
    pub async fn broadcast(&self, envelope: &Envelope, skip: Option<ClientId>) -> usize {
        let recipients = {
            let hub = self.inner.read().await;
            hub.clients
                .iter()
                .filter(|(id, _)| Some(**id) != skip)
                .map(|(_, tx)| tx.clone())
                .collect::<Vec<_>>()
        };

        let text = envelope.payload.to_string();
        recipients
            .into_iter()
            .filter(|tx| tx.send(Message::Text(text.clone().into())).is_ok())
            .count()
    }

    /// Closes every socket, as if the network had dropped.
    pub async fn kick_all(&self) -> usize {
        let clients = std::mem::take(&mut self.inner.write().await.clients);
        let count = clients.len();
        for tx in clients.into_values() {
            let _ = tx.send(Message::Close(None));
        }
        count
    }

    async fn register(&self, tx: mpsc::UnboundedSender<Message>) -> ClientId {
        let mut hub = self.inner.write().await;
        hub.next_id += 1;
        let id = hub.next_id;
        hub.clients.insert(id, tx);
        id
    }

    async fn unregister(&self, id: ClientId) {
        self.inner.write().await.clients.remove(&id);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Every route the hub serves, as `METHOD path`.
pub const ROUTES: [&str; 4] = ["GET /ws", "POST /publish", "POST /kick", "GET /health"];

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/publish", post(publish_handler))
        .route("/kick", post(kick_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the hub until `shutdown` resolves, then lets open requests finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    info!(%address, routes = ?ROUTES, "hub listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"ok": true, "clients": state.client_count().await}))
}

async fn publish_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match envelope_from_value(body) {
        Ok(envelope) => {
            let delivered = state.broadcast(&envelope, None).await;
            debug!(event_type = %envelope.event_type, delivered, "published");
            (StatusCode::OK, Json(json!({"delivered": delivered})))
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": err.to_string()})),
        ),
    }
}

async fn kick_handler(State(state): State<AppState>) -> impl IntoResponse {
    let kicked = state.kick_all().await;
    info!(kicked, "kicked all clients");
    Json(json!({"kicked": kicked}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Protocol-level pings keep reverse proxies from reaping idle sockets;
    // the JSON heartbeat is the client's business.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let client_id = state.register(outbound_tx.clone()).await;
    info!(client_id, "client connected");

    let mut result = Ok(());
    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                result = Err(err.to_string());
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let envelope = match decode_envelope(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(client_id, "dropping malformed message: {}", err);
                        continue;
                    }
                };

                match envelope.kind() {
                    EventKind::Ping => {
                        let timestamp = envelope.timestamp_ms().unwrap_or_default();
                        let _ = outbound_tx.send(Message::Text(pong_frame(timestamp).into()));
                    }
                    kind if kind.is_heartbeat() => {}
                    _ => {
                        let delivered = state.broadcast(&envelope, Some(client_id)).await;
                        debug!(client_id, event_type = %envelope.event_type, delivered, "forwarded");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                warn!(client_id, "ignoring binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.unregister(client_id).await;
    send_task.abort();
    info!(client_id, "client disconnected");
    result
}
