//! Registry of dashboard WebSocket connections and their view subscriptions.

use crate::metrics::{CONNECTED_CLIENTS, PUSH_MESSAGES_TOTAL};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type ClientId = Uuid;

/// View requested by a dashboard client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiMode {
    #[default]
    None,
    TimeDomain,
    Fft,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub mode: UiMode,
    pub sensor: String,
}

impl Subscription {
    pub fn wants(&self, mode: UiMode, sensor: &str) -> bool {
        self.mode == mode && self.sensor == sensor
    }
}

/// Control messages sent by clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SetUiMode {
        #[serde(rename = "requestedUI", default)]
        requested_ui: UiMode,
        #[serde(rename = "requestedSensorMac", default)]
        requested_sensor_mac: Option<String>,
    },
}

#[derive(Debug)]
struct Client {
    outbound: mpsc::UnboundedSender<String>,
    subscription: Subscription,
}

/// Concurrent set of open connections.
///
/// Each connection owns an unbounded outbound queue drained by its own writer
/// task, so broadcasting never waits on a slow socket. A subscription is
/// replaced as a whole under the map's shard lock, so broadcasts only ever see
/// the old or the new value.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, outbound: mpsc::UnboundedSender<String>) -> ClientId {
        let id = Uuid::new_v4();
        self.clients.insert(
            id,
            Client {
                outbound,
                subscription: Subscription::default(),
            },
        );
        CONNECTED_CLIENTS.set(self.clients.len() as f64);
        id
    }

    pub fn remove(&self, id: ClientId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        CONNECTED_CLIENTS.set(self.clients.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[cfg(test)]
    pub fn subscription(&self, id: ClientId) -> Option<Subscription> {
        self.clients.get(&id).map(|c| c.subscription.clone())
    }

    pub fn set_subscription(&self, id: ClientId, subscription: Subscription) -> bool {
        match self.clients.get_mut(&id) {
            Some(mut client) => {
                client.subscription = subscription;
                true
            }
            None => false,
        }
    }

    /// Applies a raw control message. Unparseable messages are logged and dropped.
    pub fn handle_control(&self, id: ClientId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::SetUiMode {
                requested_ui,
                requested_sensor_mac,
            }) => {
                let subscription = Subscription {
                    mode: requested_ui,
                    sensor: requested_sensor_mac.unwrap_or_default(),
                };
                debug!(client = %id, ?subscription, "UI mode changed");
                self.set_subscription(id, subscription);
            }
            Err(e) => {
                warn!(client = %id, "Discarding invalid control message: {}", e);
            }
        }
    }

    pub fn has_subscriber(&self, predicate: impl Fn(&Subscription) -> bool) -> bool {
        self.clients.iter().any(|c| predicate(&c.subscription))
    }

    /// Sends to every open connection.
    pub fn broadcast<T: Serialize>(&self, message: &T) -> usize {
        self.broadcast_filtered(message, |_| true)
    }

    /// Sends only to connections whose current subscription satisfies `predicate`.
    /// Returns the number of connections the message was queued for.
    pub fn broadcast_filtered<T: Serialize>(
        &self,
        message: &T,
        predicate: impl Fn(&Subscription) -> bool,
    ) -> usize {
        if self.is_empty() {
            return 0;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize push message: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        let mut closed = Vec::new();
        for client in self.clients.iter() {
            if !predicate(&client.subscription) {
                continue;
            }
            if client.outbound.send(text.clone()).is_ok() {
                sent += 1;
            } else {
                closed.push(*client.key());
            }
        }
        for id in closed {
            debug!(client = %id, "Dropping closed connection");
            self.remove(id);
        }

        PUSH_MESSAGES_TOTAL.inc_by(sent as f64);
        sent
    }

    /// Owns `socket` until it closes: registers it, relays queued messages out
    /// and applies inbound control messages, then unregisters it.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, shutdown: CancellationToken) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let id = self.register(tx);
        info!(client = %id, total = self.len(), "Client connected");

        let mut writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_control(id, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %id, "WebSocket receive error: {}", e);
                        break;
                    }
                },
                _ = &mut writer => break,
                _ = shutdown.cancelled() => break,
            }
        }

        // Dropping the queue sender lets the writer close the socket.
        self.remove(id);
        info!(client = %id, total = self.len(), "Client disconnected");
    }
}

#[derive(Clone)]
struct WsState {
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
}

pub fn create_router(registry: Arc<ClientRegistry>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { registry, shutdown })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.registry.serve(socket, state.shutdown))
}
