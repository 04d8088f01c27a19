//! Optimistic-concurrency field updates.
//!
//! ```text
//! propose(room, conn, mutation)
//!   │
//!   ├─ submitter is a verified participant? ── no ──► Unauthorized
//!   │
//!   ├─ [sequencer lock]
//!   ├─ store.get_version()  ≠ expected ─────────────► Conflict(latest)
//!   ├─ store.compare_and_apply() not applied ───────► Conflict(latest)
//!   │
//!   └─ broadcast formUpdated to the room (if submitter still subscribed)
//! ```
//!
//! The store's conditional write is the serialization point; the early
//! version read only short-circuits obvious conflicts. The sequencer keeps
//! commit and fan-out of one room in the same order.
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Compare-and-set)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SyncError;
use crate::identity::Identity;
use crate::presence::ConnectionId;
use crate::protocol::ServerEvent;
use crate::room::Room;
use crate::storage::{FieldValues, FinalSubmission, ResponseStore};

/// A proposed single-field edit, not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub field_id: String,
    pub value: Value,
    pub submitter: Identity,
    /// The version the submitter believed was current when composing the edit
    pub expected_version: u64,
}

/// A mutation the store accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub field_id: String,
    pub value: Value,
    pub submitter_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// Validates proposals against the store and broadcasts accepted ones.
pub struct UpdateDispatcher {
    store: Arc<dyn ResponseStore>,
}

impl UpdateDispatcher {
    pub fn new(store: Arc<dyn ResponseStore>) -> Self {
        Self { store }
    }

    pub async fn propose(
        &self,
        room: &Room,
        connection_id: ConnectionId,
        mutation: PendingMutation,
    ) -> Result<AppliedUpdate, SyncError> {
        let document_id = room.document_id();

        if mutation.field_id.is_empty() {
            return Err(SyncError::BadRequest("fieldId must not be empty".into()));
        }
        Self::require_participant(room, connection_id, &mutation.submitter).await?;

        let _turn = room.sequence().await;

        let current = self.store.get_version(document_id).await?;
        if mutation.expected_version != current {
            log::debug!(
                "Conflict on {document_id}: {} expected v{}, store at v{current}",
                mutation.submitter.id,
                mutation.expected_version
            );
            return Err(SyncError::Conflict {
                latest_version: current,
            });
        }

        let outcome = self
            .store
            .compare_and_apply(
                document_id,
                &mutation.field_id,
                mutation.value.clone(),
                mutation.expected_version,
            )
            .await?;
        if !outcome.applied {
            log::debug!(
                "Conflict on {document_id}: lost compare-and-set at v{}",
                mutation.expected_version
            );
            return Err(SyncError::Conflict {
                latest_version: outcome.version,
            });
        }

        let update = AppliedUpdate {
            field_id: mutation.field_id,
            value: mutation.value,
            submitter_id: mutation.submitter.id,
            timestamp: Utc::now(),
            version: outcome.version,
        };

        let inner = room.lock().await;
        if inner.broadcast.contains(&connection_id) {
            let event = ServerEvent::FormUpdated {
                document_id,
                field_id: update.field_id.clone(),
                value: update.value.clone(),
                submitter_id: update.submitter_id.clone(),
                timestamp: update.timestamp,
                version: update.version,
            };
            if let Err(e) = inner.broadcast.broadcast(&event) {
                log::error!("Failed to broadcast update v{} for {document_id}: {e}", update.version);
            }
        } else {
            log::debug!(
                "Submitter {connection_id} left {document_id} before v{} committed; not broadcasting",
                update.version
            );
        }

        Ok(update)
    }

    /// Append a finalized submission and announce it as `formSubmitted`.
    ///
    /// Independent of the live version counter. Shares the room's sequencer
    /// with `propose`, so submissions fan out in `sequence` order.
    pub async fn submit_final(
        &self,
        room: &Room,
        connection_id: ConnectionId,
        submitter: &Identity,
        answers: FieldValues,
    ) -> Result<FinalSubmission, SyncError> {
        let document_id = room.document_id();
        Self::require_participant(room, connection_id, submitter).await?;

        let _turn = room.sequence().await;

        let record = self
            .store
            .append_final_submission(document_id, &submitter.id, answers)
            .await?;

        let inner = room.lock().await;
        if inner.broadcast.contains(&connection_id) {
            let event = ServerEvent::FormSubmitted {
                document_id,
                record: record.clone(),
            };
            if let Err(e) = inner.broadcast.broadcast(&event) {
                log::error!("Failed to broadcast submission for {document_id}: {e}");
            }
        }

        log::info!(
            "Final submission #{} for {document_id} by {}",
            record.sequence,
            submitter.id
        );
        Ok(record)
    }

    async fn require_participant(
        room: &Room,
        connection_id: ConnectionId,
        submitter: &Identity,
    ) -> Result<(), SyncError> {
        let inner = room.lock().await;
        match inner.presence.get(&connection_id) {
            Some(p) if p.identity.id == submitter.id => Ok(()),
            _ => Err(SyncError::Unauthorized(
                "join the form with a verified identity first".into(),
            )),
        }
    }
}
