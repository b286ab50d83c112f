//! WebSocket presence endpoint
//!
//! Clients say `hello`, get a client id plus ICE servers back, and keep the
//! socket open. Every inbound frame counts as a liveness signal. The
//! `ConnectionRegistry` routes reaper notifications (`ping`, `bye`) to the
//! right socket. Plain `GET /health` and `GET /stats` requests on the same
//! port return JSON counts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::IceConfig;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use crate::directory::IceDirectory;
use crate::messages::{ErrorCode, PresenceMessage};
use crate::notify::{Notifier, NotifyError};
use crate::store::{Client, PresenceStore, Room};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request lines answered with plain HTTP instead of a WebSocket upgrade
const HTTP_ROUTES: [&[u8]; 2] = [b"GET /health", b"GET /stats"];

/// How long to wait for a request line split across segments
const PEEK_ATTEMPTS: usize = 50;
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// Outbound queues of live connections, by client id
#[derive(Default)]
pub struct ConnectionRegistry {
    senders: DashMap<String, mpsc::UnboundedSender<PresenceMessage>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and get its outbound queue
    pub fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<PresenceMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(client_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        self.senders.remove(client_id);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.senders.contains_key(client_id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn send(&self, client_id: &str, msg: PresenceMessage) -> Result<(), NotifyError> {
        let sender = self
            .senders
            .get(client_id)
            .ok_or_else(|| NotifyError::NotConnected(client_id.to_string()))?;
        sender
            .send(msg)
            .map_err(|_| NotifyError::ChannelClosed(client_id.to_string()))
    }
}

#[async_trait]
impl Notifier for ConnectionRegistry {
    async fn send_ping(&self, client_id: &str) -> Result<(), NotifyError> {
        let timestamp = Utc::now().timestamp_millis().max(0) as u64;
        self.send(client_id, PresenceMessage::Ping { timestamp })
    }

    async fn send_bye(&self, client_id: &str) -> Result<(), NotifyError> {
        self.send(client_id, PresenceMessage::Bye)
    }
}

/// Presence endpoint state
pub struct PresenceServer {
    store: Arc<dyn PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    directory: IceDirectory,
    ice: IceConfig,
}

impl PresenceServer {
    pub fn new(store: Arc<dyn PresenceStore>, directory: IceDirectory, ice: IceConfig) -> Self {
        Self {
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            directory,
            ice,
        }
    }

    /// Registry to hand to the reaper as its notifier
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Bind and serve until the listener fails
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Presence server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), BoxError> {
        if is_http_request(&stream).await? {
            return self.handle_http_request(&mut stream).await;
        }

        let ws_stream = accept_async(stream).await?;

        let client_id = generate_client_id()?;
        let outbox = self.registry.register(&client_id);
        let mut session = Session::new(client_id);
        debug!("New connection from {} as {}", peer_addr, session.client_id);

        let result = self.run_session(ws_stream, outbox, &mut session).await;

        // The stored client stays until it leaves or the reaper evicts it
        self.registry.unregister(&session.client_id);
        debug!("Connection closed: {}", session.client_id);
        result
    }

    /// Pump inbound frames and outbound notifications until either side ends
    async fn run_session(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        mut outbox: mpsc::UnboundedReceiver<PresenceMessage>,
        session: &mut Session,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    let text = match inbound {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_sender.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!("WebSocket error: {:?}", e);
                            break;
                        }
                    };

                    let reply = match PresenceMessage::from_json(&text) {
                        Ok(PresenceMessage::Leave) => {
                            self.leave(session).await;
                            let _ = ws_sender.close().await;
                            break;
                        }
                        Ok(msg) => self.handle_message(msg, session).await,
                        Err(e) => Some(PresenceMessage::error(
                            ErrorCode::InvalidMessage,
                            format!("Invalid JSON: {}", e),
                        )),
                    };

                    if let Some(reply) = reply {
                        if ws_sender.send(Message::Text(reply.to_json()?)).await.is_err() {
                            break;
                        }
                    }
                }

                outbound = outbox.recv() => {
                    let Some(msg) = outbound else { break };
                    let evicted = msg == PresenceMessage::Bye;
                    if ws_sender.send(Message::Text(msg.to_json()?)).await.is_err() {
                        break;
                    }
                    if evicted {
                        debug!("Client {} evicted", session.client_id);
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single message
    async fn handle_message(
        &self,
        msg: PresenceMessage,
        session: &mut Session,
    ) -> Option<PresenceMessage> {
        if let PresenceMessage::Hello { room } = msg {
            return Some(self.hello(room, session).await);
        }

        if !session.registered {
            return Some(PresenceMessage::error(
                ErrorCode::NotRegistered,
                "Send hello first",
            ));
        }

        self.record_liveness(session).await;

        match msg {
            PresenceMessage::Heartbeat | PresenceMessage::Pong { .. } => None,

            PresenceMessage::Ping { timestamp } => Some(PresenceMessage::Pong { timestamp }),

            PresenceMessage::IceServersRequest => Some(PresenceMessage::IceServers {
                servers: self
                    .directory
                    .server_list(&session.client_id, &self.ice)
                    .await,
            }),

            _ => Some(PresenceMessage::error(
                ErrorCode::InvalidMessage,
                "Unexpected message type",
            )),
        }
    }

    async fn hello(&self, room: Option<String>, session: &mut Session) -> PresenceMessage {
        if session.registered {
            return PresenceMessage::error(ErrorCode::AlreadyRegistered, "Already registered");
        }

        let now = Utc::now();
        let client = Client {
            id: session.client_id.clone(),
            room: room.clone(),
            seen: now,
        };
        if let Err(e) = self.store.upsert_client(&client).await {
            warn!(client = %client.id, error = %e, "Failed to register client");
            return PresenceMessage::error(ErrorCode::InternalError, "Failed to register");
        }

        if let Some(room) = &room {
            let record = Room {
                id: room.clone(),
                active: now,
            };
            if let Err(e) = self.store.upsert_room(&record).await {
                warn!(room = %room, error = %e, "Failed to record room activity");
            }
        }

        session.registered = true;
        session.room = room;
        info!(
            "Client {} joined {}",
            session.client_id,
            session.room.as_deref().unwrap_or("no room")
        );

        PresenceMessage::Welcome {
            client_id: session.client_id.clone(),
            ice_servers: self
                .directory
                .server_list(&session.client_id, &self.ice)
                .await,
        }
    }

    /// Bump the client's `seen` and its room's `active`
    async fn record_liveness(&self, session: &Session) {
        let now = Utc::now();

        match self.store.touch_client(&session.client_id, now).await {
            Ok(true) => {}
            // Evicted while the socket stayed up; come back to life
            Ok(false) => {
                let client = Client {
                    id: session.client_id.clone(),
                    room: session.room.clone(),
                    seen: now,
                };
                if let Err(e) = self.store.upsert_client(&client).await {
                    warn!(client = %client.id, error = %e, "Failed to re-register client");
                }
            }
            Err(e) => warn!(client = %session.client_id, error = %e, "Failed to record liveness"),
        }

        if let Some(room) = &session.room {
            match self.store.touch_room(room, now).await {
                Ok(true) => {}
                Ok(false) => {
                    let record = Room {
                        id: room.clone(),
                        active: now,
                    };
                    if let Err(e) = self.store.upsert_room(&record).await {
                        warn!(room = %room, error = %e, "Failed to recreate room");
                    }
                }
                Err(e) => warn!(room = %room, error = %e, "Failed to record room activity"),
            }
        }
    }

    /// Remove a client that left on its own
    async fn leave(&self, session: &Session) {
        if !session.registered {
            return;
        }

        let result = match self.store.delete_client(&session.client_id).await {
            Ok(_) => self.store.commit().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!("Client {} left", session.client_id),
            Err(e) => warn!(client = %session.client_id, error = %e, "Failed to remove client"),
        }
    }

    /// Handle an HTTP request (for health checks)
    async fn handle_http_request(&self, stream: &mut TcpStream) -> Result<(), BoxError> {
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");

        let clients = self.store.client_count().await;
        let rooms = self.store.room_count().await;
        let connections = self.registry.len();

        let (status, body) = match (path, clients, rooms) {
            ("/health", Ok(clients), Ok(rooms)) => (
                "200 OK",
                serde_json::json!({
                    "status": "healthy",
                    "clients": clients,
                    "rooms": rooms,
                    "connections": connections,
                }),
            ),
            ("/stats", Ok(clients), Ok(rooms)) => (
                "200 OK",
                serde_json::json!({
                    "clients": clients,
                    "rooms": rooms,
                    "connections": connections,
                }),
            ),
            ("/health", _, _) | ("/stats", _, _) => (
                "503 Service Unavailable",
                serde_json::json!({ "status": "unhealthy", "error": "store unavailable" }),
            ),
            _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
        };

        let body = body.to_string();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

/// Per-connection state
struct Session {
    client_id: String,
    room: Option<String>,
    registered: bool,
}

impl Session {
    fn new(client_id: String) -> Self {
        Self {
            client_id,
            room: None,
            registered: false,
        }
    }
}

/// Peek at the request line until it can be routed
///
/// WebSocket upgrades are GETs too, so this routes on the path. Bytes are
/// only peeked, the handshake still sees the whole request.
async fn is_http_request(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut buf = [0u8; 16];

    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        let head = &buf[..n];

        if HTTP_ROUTES.iter().any(|route| head.starts_with(route)) {
            return Ok(true);
        }
        // Closed, or already diverged from every route
        if n == 0 || !HTTP_ROUTES.iter().any(|route| route.starts_with(head)) {
            return Ok(false);
        }

        tokio::time::sleep(PEEK_RETRY).await;
    }

    Ok(false)
}

/// Generate a unique client ID
fn generate_client_id() -> Result<String, std::io::Error> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(hex::encode(bytes))
}
