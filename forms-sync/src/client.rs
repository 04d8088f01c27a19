//! WebSocket client for the form sync server.
//!
//! Provides:
//! - Connection lifecycle with an optional bearer token (guest mode without one)
//! - Typed senders for every inbound event
//! - Server events delivered on a channel, in arrival order
//!
//! The client never retries a conflicting update on its own; after a
//! `formConflict` the caller decides whether to `request_state` and re-propose.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::storage::FieldValues;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the form client.
#[derive(Debug, Clone, PartialEq)]
pub enum FormEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed by the server
    Disconnected,
    /// An event pushed by the server
    Server(ServerEvent),
}

pub struct FormClient {
    server_url: String,
    token: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<FormEvent>>,
    event_tx: mpsc::Sender<FormEvent>,
}

impl FormClient {
    /// Create a client. Without a token the server treats it as a guest.
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<FormEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self.server_url.as_str().into_client_request().map_err(|e| {
            log::warn!("Invalid server URL {}: {e}", self.server_url);
            ProtocolError::ConnectionClosed
        })?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(FormEvent::Connected).await;

        // Reader task: decode server events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(FormEvent::Server(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(FormEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a raw inbound event.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(event.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::JoinForm { document_id }).await
    }

    pub async fn leave(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::LeaveForm { document_id }).await
    }

    pub async fn request_participants(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::RequestParticipants { document_id })
            .await
    }

    pub async fn request_state(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::RequestState { document_id }).await
    }

    /// Propose a single-field edit against `expected_version`.
    pub async fn update(
        &self,
        document_id: Uuid,
        field_id: impl Into<String>,
        value: Value,
        expected_version: u64,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::FormUpdate {
            document_id,
            field_id: field_id.into(),
            value,
            expected_version,
        })
        .await
    }

    pub async fn submit(&self, document_id: Uuid, answers: FieldValues) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::SubmitForm {
            document_id,
            answers,
        })
        .await
    }

    /// Close the connection. The server treats this as a disconnect.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}
