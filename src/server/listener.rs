//! WebSocket listener - admission control, per-message authentication and
//! broadcast to every admitted client

use super::auth::AuthManager;
use super::connection::{client_writer_task, next_text, WsClient, CLIENT_BUFFER};
use crate::protocol::{
    serialize, Notification, CLIENT_CONNECTED, CLIENT_DISCONNECTED, CLIENT_DROPPED, COMMAND_PATH,
};
use axum::extract::ws::{close_code, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default number of concurrently admitted clients
pub const DEFAULT_MAX_CONNECTIONS: usize = 2;

/// Lower and upper bound of the admitted client count
pub const MIN_CONNECTIONS: usize = 1;
pub const MAX_CONNECTIONS: usize = 64;

/// Maximum length of a close frame reason in bytes
const MAX_CLOSE_REASON: usize = 123;

/// A text frame received from an admitted, authenticated client
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub client_id: Uuid,
    pub remote_address: String,
    pub text: String,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<Uuid, WsClient>,

    /// Admitted connections still completing their handshake
    reserved: usize,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.clients.len() + self.reserved
    }
}

/// A reserved connection slot. Dropping it before the client is attached
/// hands the slot back.
pub struct Admission {
    server: Arc<MessagingServer>,
    committed: bool,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.committed {
            let mut registry = self.server.registry();
            registry.reserved = registry.reserved.saturating_sub(1);
        }
    }
}

/// The command and notification endpoint
pub struct MessagingServer {
    max_connections: usize,
    auth: Arc<dyn AuthManager>,
    registry: Mutex<Registry>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    closed: watch::Sender<bool>,
}

impl MessagingServer {
    /// `max_connections` is clamped to `[1, 64]`
    pub fn new(max_connections: usize, auth: Arc<dyn AuthManager>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            max_connections: max_connections.clamp(MIN_CONNECTIONS, MAX_CONNECTIONS),
            auth,
            registry: Mutex::new(Registry::default()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed,
        }
    }

    /// Admitted client limit after clamping
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Manager checking each inbound frame's subprotocol
    pub fn auth(&self) -> &Arc<dyn AuthManager> {
        &self.auth
    }

    /// Router serving the WebSocket endpoint. Every other path is a 404.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(COMMAND_PATH, get(upgrade_handler))
            .with_state(self)
    }

    /// Reserve a connection slot, `None` when the server is full
    pub fn admit(self: &Arc<Self>) -> Option<Admission> {
        let mut registry = self.registry();
        if registry.occupied() >= self.max_connections {
            return None;
        }
        registry.reserved += 1;
        drop(registry);
        Some(Admission {
            server: Arc::clone(self),
            committed: false,
        })
    }

    /// Handle a WebSocket handshake on the command endpoint
    pub fn upgrade(
        self: &Arc<Self>,
        ws: WebSocketUpgrade,
        remote_address: String,
        headers: &HeaderMap,
    ) -> Response {
        if self.is_closed() {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let admission = match self.admit() {
            Some(admission) => admission,
            None => {
                tracing::warn!(
                    "Dropping connection from {}: {} clients already connected",
                    remote_address,
                    self.max_connections
                );
                self.broadcast(&Notification::text(CLIENT_DROPPED, remote_address));
                return (StatusCode::TOO_MANY_REQUESTS, "Too many connections").into_response();
            }
        };

        let subprotocol = requested_subprotocol(headers);
        let ws = match &subprotocol {
            Some(proto) => ws.protocols([proto.clone()]),
            None => ws,
        };

        let server = Arc::clone(self);
        ws.on_upgrade(move |socket| async move {
            server
                .attach(socket, admission, remote_address, subprotocol)
                .await;
        })
    }

    async fn attach(
        self: Arc<Self>,
        socket: WebSocket,
        admission: Admission,
        remote_address: String,
        subprotocol: Option<String>,
    ) {
        let id = Uuid::new_v4();
        let (sink, stream) = socket.split();

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        tokio::spawn(client_writer_task(sink, rx));

        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(Arc::clone(&self).read_loop(id, stream, subprotocol, ready_rx));

        self.broadcast(&Notification::text(CLIENT_CONNECTED, remote_address.clone()));
        let client = WsClient::new(id, remote_address.clone(), tx, reader);
        if !self.register(admission, client) {
            return;
        }
        let _ = ready_tx.send(());

        tracing::info!("Client {} connected from {}", id, remote_address);
    }

    /// Move an admitted client into the registry. Fails once shutdown has
    /// begun, in which case the client is closed with 1001 and its slot is
    /// released.
    fn register(&self, mut admission: Admission, client: WsClient) -> bool {
        let mut registry = self.registry();
        if self.is_closed() {
            drop(registry);
            drop(admission);
            tracing::info!(
                "Rejecting client {}: server is shutting down",
                client.remote_address()
            );
            client.cancel_reader();
            client.close(close_code::AWAY, "Server shutting down".to_string());
            return false;
        }
        registry.reserved = registry.reserved.saturating_sub(1);
        admission.committed = true;
        registry.clients.insert(client.id(), client);
        true
    }

    /// One reader per client. Frames are authenticated one at a time and
    /// queued in arrival order.
    async fn read_loop(
        self: Arc<Self>,
        id: Uuid,
        mut stream: futures::stream::SplitStream<WebSocket>,
        subprotocol: Option<String>,
        ready: oneshot::Receiver<()>,
    ) {
        if ready.await.is_err() {
            return;
        }
        let remote_address = match self.registry().clients.get(&id) {
            Some(client) => client.remote_address().to_string(),
            None => return,
        };

        let mut rejection = None;
        while let Some(text) = next_text(&mut stream).await {
            match self
                .auth
                .validate_websocket_subprotocol(subprotocol.as_deref())
                .await
            {
                Ok(true) => {
                    let message = InboundMessage {
                        client_id: id,
                        remote_address: remote_address.clone(),
                        text,
                    };
                    if self.inbound_tx.send(message).is_err() {
                        tracing::debug!("Inbound queue closed");
                        break;
                    }
                }
                Ok(false) => {
                    tracing::warn!("Authentication failed for client {}", remote_address);
                    rejection = Some((
                        close_code::PROTOCOL,
                        format!(
                            "Invalid subprotocol \"{}\"",
                            subprotocol.as_deref().unwrap_or_default()
                        ),
                    ));
                    break;
                }
                Err(e) => {
                    tracing::error!("Authentication check failed for {}: {}", remote_address, e);
                    rejection = Some((close_code::ERROR, format!("Internal error: \"{}\"", e)));
                    break;
                }
            }
        }

        if let Some(client) = self.deregister(id) {
            if let Some((code, reason)) = rejection {
                client.close(code, truncate_reason(reason));
            }
            tracing::info!("Client {} disconnected", client.remote_address());
            self.broadcast(&Notification::text(
                CLIENT_DISCONNECTED,
                client.remote_address().to_string(),
            ));
        }
    }

    fn deregister(&self, id: Uuid) -> Option<WsClient> {
        self.registry().clients.remove(&id)
    }

    /// Forcibly remove a client. Its reader is cancelled before the socket
    /// is closed.
    pub fn evict(&self, id: Uuid) -> bool {
        let client = match self.deregister(id) {
            Some(client) => client,
            None => return false,
        };
        client.cancel_reader();
        client.close(close_code::AWAY, "Evicted".to_string());
        tracing::info!("Evicted client {}", client.remote_address());
        self.broadcast(&Notification::text(
            CLIENT_DISCONNECTED,
            client.remote_address().to_string(),
        ));
        true
    }

    /// Next queued inbound message, `None` after shutdown
    pub async fn read_message(&self) -> Option<InboundMessage> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            message = inbound.recv() => message,
            _ = closed.changed() => None,
        }
    }

    /// Serialize `message` once and queue it for every admitted client
    pub fn write_message<T: Serialize>(&self, message: &T) {
        let text = match serialize(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize outbound message: {}", e);
                return;
            }
        };
        for client in self.registry().clients.values() {
            client.send_text(text.clone());
        }
    }

    /// Queue a notification for every admitted client
    pub fn broadcast(&self, notification: &Notification) {
        self.write_message(notification);
    }

    /// Forward every published notification to the clients
    pub fn spawn_notification_pump(
        self: &Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                server.broadcast(&notification);
            }
            tracing::debug!("Notification pump finished");
        })
    }

    /// Number of registered clients. Slots still mid-handshake are not counted.
    pub fn connection_count(&self) -> usize {
        self.registry().clients.len()
    }

    /// Remote addresses of admitted clients, sorted
    pub fn client_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .registry()
            .clients
            .values()
            .map(|c| c.remote_address().to_string())
            .collect();
        addresses.sort();
        addresses
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop accepting connections, cancel every reader, close every socket
    /// and clear the registry
    pub fn shutdown(&self) {
        self.closed.send_replace(true);
        let clients: Vec<WsClient> = self
            .registry()
            .clients
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in &clients {
            client.cancel_reader();
            client.close(close_code::AWAY, "Server shutting down".to_string());
        }
        tracing::info!("Messaging server stopped, closed {} clients", clients.len());
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn upgrade_handler(
    State(server): State<Arc<MessagingServer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_address = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    server.upgrade(ws, remote_address, &headers)
}

/// First subprotocol offered by the client
fn requested_subprotocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
