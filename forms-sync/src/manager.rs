//! Room lifecycle and event routing.
//!
//! ```text
//!  ClientEvent ──► RoomManager::handle_event
//!                    ├── joinForm / leaveForm ──► RoomRegistry + PresenceTracker ──► activeParticipants
//!                    ├── requestParticipants  ──► reply activeParticipants
//!                    ├── requestState         ──► reply formState
//!                    ├── formUpdate           ──► UpdateDispatcher::propose ──► formUpdated | formConflict
//!                    └── submitForm           ──► UpdateDispatcher::submit_final ──► formSubmitted
//! ```
//!
//! The manager also remembers which rooms each connection joined, so a
//! disconnect can leave all of them without scanning the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::Connection;
use crate::dispatcher::{AppliedUpdate, PendingMutation, UpdateDispatcher};
use crate::error::SyncError;
use crate::presence::{ConnectionId, Participant};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::room::{Room, RoomRegistry};
use crate::storage::{FieldValues, FinalSubmission, ResponseState, ResponseStore, StoreError};

/// What handling one inbound event amounted to. Used for server statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Joined,
    Left,
    Replied,
    Applied { version: u64 },
    Conflict,
    Submitted,
    Failed,
}

pub struct RoomManager {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ResponseStore>,
    dispatcher: UpdateDispatcher,
    memberships: RwLock<HashMap<ConnectionId, HashSet<Uuid>>>,
    auto_create: bool,
}

impl RoomManager {
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn ResponseStore>) -> Self {
        Self {
            dispatcher: UpdateDispatcher::new(store.clone()),
            registry,
            store,
            memberships: RwLock::new(HashMap::new()),
            auto_create: false,
        }
    }

    /// Create an empty response on first join instead of failing with `NotFound`.
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ResponseStore> {
        &self.store
    }

    /// Subscribe `connection` to the document's room.
    ///
    /// A verified connection also becomes a participant and the new presence
    /// snapshot is broadcast to the room. A guest only gets the snapshot as a
    /// private reply. Returns the snapshot either way.
    pub async fn join(
        &self,
        connection: &Connection,
        document_id: Uuid,
    ) -> Result<Vec<Participant>, SyncError> {
        self.ensure_response(document_id).await?;

        let snapshot = loop {
            let room = self.registry.get_or_create(document_id).await;
            let mut inner = room.lock().await;
            if inner.closed {
                // Lost a race with garbage collection of the previous room
                continue;
            }

            let newly_subscribed = inner.broadcast.subscribe(connection.id(), connection.outbox());

            let changed = match connection.identity() {
                Some(identity) => inner.presence.join(connection.id(), identity.clone()),
                None => false,
            };

            let snapshot = inner.presence.snapshot();
            let event = ServerEvent::active_participants(document_id, &snapshot);
            let sent = if changed {
                inner.broadcast.broadcast(&event).map(|_| ())
            } else {
                inner.broadcast.send_to(&connection.id(), &event).map(|_| ())
            };
            if let Err(e) = sent {
                log::error!("Failed to send presence for {document_id}: {e}");
            }

            if newly_subscribed {
                log::info!(
                    "Connection {} joined {document_id} as {} ({} participants)",
                    connection.id(),
                    connection.identity().map_or("guest", |i| i.id.as_str()),
                    snapshot.len()
                );
            }
            break snapshot;
        };

        self.memberships
            .write()
            .await
            .entry(connection.id())
            .or_default()
            .insert(document_id);

        Ok(snapshot)
    }

    /// Remove the connection from one room. Remaining subscribers get the new
    /// presence snapshot if a participant left. Returns `false` if the
    /// connection was not in the room.
    pub async fn leave(&self, connection_id: ConnectionId, document_id: Uuid) -> bool {
        {
            let mut memberships = self.memberships.write().await;
            if let Some(rooms) = memberships.get_mut(&connection_id) {
                rooms.remove(&document_id);
                if rooms.is_empty() {
                    memberships.remove(&connection_id);
                }
            }
        }

        let Some(room) = self.registry.get(&document_id).await else {
            return false;
        };

        let was_subscribed = {
            let mut inner = room.lock().await;
            let was_subscribed = inner.broadcast.unsubscribe(&connection_id);
            if let Some(participant) = inner.presence.leave(&connection_id) {
                let event =
                    ServerEvent::active_participants(document_id, &inner.presence.snapshot());
                if let Err(e) = inner.broadcast.broadcast(&event) {
                    log::error!("Failed to broadcast presence for {document_id}: {e}");
                }
                log::info!(
                    "{} left {document_id} ({} participants remain)",
                    participant.identity.id,
                    inner.presence.len()
                );
            }
            was_subscribed
        };

        self.registry.remove_if_empty(&document_id).await;
        was_subscribed
    }

    /// Leave every room the connection joined. Returns how many rooms it left.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> usize {
        let rooms = self
            .memberships
            .write()
            .await
            .remove(&connection_id)
            .unwrap_or_default();

        let mut left = 0;
        for document_id in rooms {
            if self.leave(connection_id, document_id).await {
                left += 1;
            }
        }
        left
    }

    /// Current participants of a document. Empty when nobody has joined;
    /// `NotFound` when the document has no response record.
    pub async fn snapshot(&self, document_id: Uuid) -> Result<Vec<Participant>, SyncError> {
        self.store.get_version(document_id).await?;
        Ok(match self.registry.get(&document_id).await {
            Some(room) => room.snapshot().await,
            None => Vec::new(),
        })
    }

    /// Authoritative values and version of a document's response.
    pub async fn state(&self, document_id: Uuid) -> Result<ResponseState, SyncError> {
        Ok(self.store.load_state(document_id).await?)
    }

    pub async fn propose(
        &self,
        connection: &Connection,
        document_id: Uuid,
        field_id: String,
        value: Value,
        expected_version: u64,
    ) -> Result<AppliedUpdate, SyncError> {
        let submitter = connection
            .identity()
            .cloned()
            .ok_or_else(|| SyncError::Unauthorized("guests may not edit responses".into()))?;
        let room = self.joined_room(connection, document_id).await?;

        self.dispatcher
            .propose(
                &room,
                connection.id(),
                PendingMutation {
                    field_id,
                    value,
                    submitter,
                    expected_version,
                },
            )
            .await
    }

    pub async fn submit(
        &self,
        connection: &Connection,
        document_id: Uuid,
        answers: FieldValues,
    ) -> Result<FinalSubmission, SyncError> {
        let Some(submitter) = connection.identity() else {
            return Err(SyncError::Unauthorized("guests may not submit responses".into()));
        };
        let room = self.joined_room(connection, document_id).await?;
        self.dispatcher
            .submit_final(&room, connection.id(), submitter, answers)
            .await
    }

    /// Route one inbound event. Replies and error notices go to `connection`;
    /// room-wide effects are broadcast by the operation itself.
    pub async fn handle_event(&self, connection: &Connection, event: ClientEvent) -> EventOutcome {
        let document_id = event.document_id();
        log::debug!("Connection {} → {:?}", connection.id(), event);

        let result = match event {
            ClientEvent::JoinForm { document_id } => self
                .join(connection, document_id)
                .await
                .map(|_| EventOutcome::Joined),
            ClientEvent::LeaveForm { document_id } => {
                self.leave(connection.id(), document_id).await;
                Ok(EventOutcome::Left)
            }
            ClientEvent::RequestParticipants { document_id } => {
                match self.snapshot(document_id).await {
                    Ok(participants) => {
                        self.reply(
                            connection,
                            ServerEvent::active_participants(document_id, &participants),
                        )
                        .await;
                        Ok(EventOutcome::Replied)
                    }
                    Err(e) => Err(e),
                }
            }
            ClientEvent::RequestState { document_id } => match self.state(document_id).await {
                Ok(state) => {
                    self.reply(
                        connection,
                        ServerEvent::FormState {
                            document_id,
                            values: state.values,
                            version: state.version,
                        },
                    )
                    .await;
                    Ok(EventOutcome::Replied)
                }
                Err(e) => Err(e),
            },
            ClientEvent::FormUpdate {
                document_id,
                field_id,
                value,
                expected_version,
            } => self
                .propose(connection, document_id, field_id, value, expected_version)
                .await
                .map(|u| EventOutcome::Applied { version: u.version }),
            ClientEvent::SubmitForm {
                document_id,
                answers,
            } => self
                .submit(connection, document_id, answers)
                .await
                .map(|_| EventOutcome::Submitted),
        };

        match result {
            Ok(outcome) => outcome,
            Err(SyncError::Conflict { latest_version }) => {
                let err = SyncError::Conflict { latest_version };
                self.reply(
                    connection,
                    ServerEvent::FormConflict {
                        document_id,
                        message: err.client_message(),
                        latest_version,
                    },
                )
                .await;
                EventOutcome::Conflict
            }
            Err(e) => {
                match &e {
                    SyncError::StoreUnavailable(_) => {
                        log::error!("Store failure for {document_id}: {e}")
                    }
                    e if e.is_expected() => log::debug!("Connection {}: {e}", connection.id()),
                    _ => log::warn!("Connection {}: {e}", connection.id()),
                }
                self.reply(connection, ServerEvent::error(e.client_message()))
                    .await;
                EventOutcome::Failed
            }
        }
    }

    async fn reply(&self, connection: &Connection, event: ServerEvent) {
        if let Err(e) = connection.send(&event).await {
            log::debug!(
                "Dropping {} for connection {}: {e}",
                event.name(),
                connection.id()
            );
        }
    }

    async fn joined_room(
        &self,
        connection: &Connection,
        document_id: Uuid,
    ) -> Result<Arc<Room>, SyncError> {
        let not_joined = || SyncError::Unauthorized("join the form first".into());
        let room = self.registry.get(&document_id).await.ok_or_else(not_joined)?;
        if !room.is_subscribed(&connection.id()).await {
            return Err(not_joined());
        }
        Ok(room)
    }

    async fn ensure_response(&self, document_id: Uuid) -> Result<(), SyncError> {
        match self.store.get_version(document_id).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) if self.auto_create => {
                self.store.create_response(document_id).await?;
                log::info!("Created response record for {document_id}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
