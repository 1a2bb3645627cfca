//! Realtime notification hub for interactive scan sessions.
//!
//! One logical connection slot per user: a reconnect replaces (and closes)
//! the previous connection. Outbound messages sit in a small bounded buffer
//! and are dropped when it is full — the push path favors availability over
//! guaranteed delivery, since session state is recoverable by polling the
//! status endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::ApiError;
use crate::server::AppState;
use crate::server::auth_layer::resolve_user_token;

const SEND_BUFFER: usize = 16;
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no inbound frame (including pongs) for this long is
/// treated as gone.
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Server→client push message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPush {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl ScanPush {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            phase: None,
            screenshot: None,
            choice_type: None,
            login_id: None,
            message: None,
            position: None,
        }
    }

    pub fn phase(phase: impl Into<String>) -> Self {
        let mut push = Self::new("phase");
        push.phase = Some(phase.into());
        push
    }

    pub fn with_screenshot(mut self, screenshot: impl Into<String>) -> Self {
        self.screenshot = Some(screenshot.into());
        self
    }

    pub fn completed(phase: impl Into<String>, message: impl Into<String>) -> Self {
        let mut push = Self::new("completed");
        push.phase = Some(phase.into());
        push.message = Some(message.into());
        push
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut push = Self::new("failed");
        push.message = Some(message.into());
        push
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        let mut push = Self::new("cancelled");
        push.message = Some(message.into());
        push
    }
}

struct ClientSlot {
    generation: u64,
    tx: mpsc::Sender<ScanPush>,
    close: watch::Sender<bool>,
}

/// Connection registry, keyed by user id.
#[derive(Default)]
pub struct ScanHub {
    clients: Mutex<HashMap<i64, ClientSlot>>,
    next_generation: Mutex<u64>,
}

impl ScanHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user, force-closing any prior one
    /// (last-connect-wins). Returns the generation tag, the outbound message
    /// stream, and the close signal.
    pub fn register(&self, user_id: i64) -> (u64, mpsc::Receiver<ScanPush>, watch::Receiver<bool>) {
        let generation = {
            let mut counter = self.next_generation.lock().unwrap();
            *counter += 1;
            *counter
        };
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let (close_tx, close_rx) = watch::channel(false);
        let mut clients = self.clients.lock().unwrap();
        if let Some(old) = clients.insert(
            user_id,
            ClientSlot {
                generation,
                tx,
                close: close_tx,
            },
        ) {
            let _ = old.close.send(true);
            tracing::debug!(user_id, "replaced existing scan websocket connection");
        }
        (generation, rx, close_rx)
    }

    /// Deregister, but only if this generation still owns the slot — a
    /// replacement connection must not be torn down by its predecessor's
    /// cleanup.
    pub fn unregister(&self, user_id: i64, generation: u64) {
        let mut clients = self.clients.lock().unwrap();
        if clients
            .get(&user_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            if let Some(slot) = clients.remove(&user_id) {
                let _ = slot.close.send(true);
            }
        }
    }

    /// Push a message to the user's connection, silently dropping it when no
    /// connection exists or its buffer is full.
    pub fn notify_user(&self, user_id: i64, push: ScanPush) {
        let clients = self.clients.lock().unwrap();
        let Some(slot) = clients.get(&user_id) else {
            return;
        };
        if let Err(err) = slot.tx.try_send(push) {
            tracing::debug!(user_id, "dropping scan push: {err}");
        }
    }

    pub fn is_connected(&self, user_id: i64) -> bool {
        self.clients.lock().unwrap().contains_key(&user_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler; the bearer token travels as a query parameter because
/// browsers cannot set headers on WebSocket requests.
pub async fn scan_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing token".to_string()))?;
    let identity = resolve_user_token(&state, &token).await?;
    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, identity.user_id)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ScanHub>, user_id: i64) {
    let (generation, mut outbound, mut closed) = hub.register(user_id);
    let (mut sink, mut stream) = socket.split();

    // Write pump: queued pushes plus a keepalive ping.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                push = outbound.recv() => {
                    let Some(push) = push else { break };
                    let Ok(text) = serde_json::to_string(&push) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                _ = closed.changed() => break,
            }
        }
        let _ = sink.close().await;
    });

    // Read pump: clients send nothing semantic; inbound frames only refresh
    // the inactivity deadline.
    loop {
        match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) => break,
            Err(_) => {
                tracing::debug!(user_id, "scan websocket read deadline expired");
                break;
            }
        }
    }

    hub.unregister(user_id, generation);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_serializes_only_set_fields() {
        let push = ScanPush::phase("choose_zone");
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json, serde_json::json!({"type": "phase", "phase": "choose_zone"}));

        let push = ScanPush::cancelled("user gone");
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json, serde_json::json!({"type": "cancelled", "message": "user gone"}));
    }

    #[tokio::test]
    async fn notify_reaches_registered_connection() {
        let hub = ScanHub::new();
        let (_generation, mut rx, _closed) = hub.register(1);
        hub.notify_user(1, ScanPush::phase("launching"));
        let push = rx.recv().await.unwrap();
        assert_eq!(push.kind, "phase");
        assert_eq!(push.phase.as_deref(), Some("launching"));
    }

    #[tokio::test]
    async fn notify_without_connection_is_a_noop() {
        let hub = ScanHub::new();
        hub.notify_user(99, ScanPush::failed("nobody listening"));
        assert!(!hub.is_connected(99));
    }

    #[tokio::test]
    async fn reconnect_replaces_and_closes_prior_connection() {
        let hub = ScanHub::new();
        let (gen_a, mut rx_a, mut closed_a) = hub.register(1);
        let (_gen_b, mut rx_b, _closed_b) = hub.register(1);

        // The old connection got its close signal.
        closed_a.changed().await.unwrap();
        assert!(*closed_a.borrow());

        // Messages now go to the new connection only.
        hub.notify_user(1, ScanPush::phase("waiting"));
        assert_eq!(rx_b.recv().await.unwrap().kind, "phase");
        assert!(rx_a.try_recv().is_err());

        // The replaced connection's cleanup must not evict the new one.
        hub.unregister(1, gen_a);
        assert!(hub.is_connected(1));
    }

    #[tokio::test]
    async fn full_buffer_drops_messages_instead_of_blocking() {
        let hub = ScanHub::new();
        let (_generation, mut rx, _closed) = hub.register(1);
        for i in 0..(SEND_BUFFER + 5) {
            hub.notify_user(1, ScanPush::failed(format!("m{i}")));
        }
        // Exactly the buffered prefix survives.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SEND_BUFFER);
    }
}
