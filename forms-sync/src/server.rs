//! WebSocket server for collaborative form responses.
//!
//! Architecture:
//! ```text
//! Client A ──┐  handshake: token → IdentityVerifier
//!             │
//!             ├── reader loop ── ClientEvent ──► RoomManager ──► ResponseStore
//!             │                                     │              ├── MemoryStore
//! Client B ──┘                                     │              └── RocksStore
//!                                                   ▼
//!                                     Room (doc_id) ── BroadcastGroup
//!                                                   │
//!                          ┌────────────────────────┼───────────┐
//!                          ▼                        ▼           ▼
//!                    outbox → writer task     Client B     Client C
//! ```
//!
//! Each connection is split into a reader loop that drives the room manager
//! and a writer task that drains the connection's bounded outbox into the
//! socket. The token is read once, during the HTTP upgrade, from either an
//! `Authorization: Bearer` header or a `?token=` query parameter. A bad token
//! gets an `error` event and a close frame; no token at all means guest mode.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::Connection;
use crate::error::SyncError;
use crate::identity::{Identity, IdentityVerifier};
use crate::manager::{EventOutcome, RoomManager};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::room::RoomRegistry;
use crate::storage::{MemoryStore, ResponseStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames queued per connection before broadcasts to it are dropped
    pub outbox_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Create an empty response when a client joins an unknown document
    pub auto_create_responses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            storage_path: None,
            auto_create_responses: false,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
    pub applied_updates: u64,
    pub conflicts: u64,
    pub submissions: u64,
}

impl ServerStats {
    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Applied { .. } => self.applied_updates += 1,
            EventOutcome::Conflict => self.conflicts += 1,
            EventOutcome::Submitted => self.submissions += 1,
            EventOutcome::Joined
            | EventOutcome::Left
            | EventOutcome::Replied
            | EventOutcome::Failed => {}
        }
    }
}

/// The form sync server.
pub struct SyncServer {
    config: ServerConfig,
    manager: Arc<RoomManager>,
    verifier: Arc<dyn IdentityVerifier>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if `storage_path` is set.
    pub fn new(
        config: ServerConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn ResponseStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::info!("No storage path configured, responses are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, verifier, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(
        config: ServerConfig,
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn ResponseStore>,
    ) -> Self {
        let manager = RoomManager::new(Arc::new(RoomRegistry::new()), store)
            .with_auto_create(config.auto_create_responses);
        Self {
            config,
            manager: Arc::new(manager),
            verifier,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Form sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let verifier = self.verifier.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, manager, verifier, stats, outbox_capacity)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<RoomManager>,
        verifier: Arc<dyn IdentityVerifier>,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), BoxError> {
        let mut token = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                token = extract_token(req);
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let identity: Option<Identity> = match token {
            None => None,
            Some(token) => match verifier.verify(&token).await {
                Ok(identity) => Some(identity),
                Err(e) => {
                    log::warn!("Authentication failed for {addr}: {e}");
                    stats.write().await.rejected_connections += 1;

                    let notice = ServerEvent::error(SyncError::from(e).client_message());
                    ws_sender.send(Message::text(notice.encode()?)).await?;
                    ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "authentication failed".into(),
                        })))
                        .await?;
                    return Ok(());
                }
            },
        };

        log::info!(
            "WebSocket connection established from {addr} as {}",
            identity.as_ref().map_or("guest", |i| i.id.as_str())
        );
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (connection, mut outbox_rx) = Connection::channel(identity, outbox_capacity);

        // Writer: outbox → socket. Ends once every sender for this connection is gone.
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                    log::debug!("Write to {addr} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    stats.write().await.total_messages += 1;
                    match ClientEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let outcome = manager.handle_event(&connection, event).await;
                            let rooms = manager.registry().room_count().await;
                            let mut s = stats.write().await;
                            s.record(outcome);
                            s.active_rooms = rooms;
                        }
                        Err(e) => {
                            log::warn!("Undecodable frame from {addr}: {e}");
                            let err = SyncError::BadRequest(e.to_string());
                            Self::reply(&connection, ServerEvent::error(err.client_message())).await;
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    log::warn!("Binary frame from {addr} rejected");
                    let notice = ServerEvent::error(ProtocolError::UnsupportedFrame.to_string());
                    Self::reply(&connection, notice).await;
                }
                Ok(Message::Close(_)) => break,
                // Ping/pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    log::debug!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        let left = manager.disconnect(connection.id()).await;
        drop(connection);
        let _ = writer.await;

        {
            let rooms = manager.registry().room_count().await;
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms;
        }
        log::info!("Connection from {addr} closed (left {left} rooms)");
        Ok(())
    }

    async fn reply(connection: &Connection, event: ServerEvent) {
        if let Err(e) = connection.send(&event).await {
            log::debug!("Reply to {} dropped: {e}", connection.id());
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn ResponseStore> {
        self.manager.store()
    }
}

/// Token from `Authorization: Bearer …`, falling back to `?token=…`.
fn extract_token(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
