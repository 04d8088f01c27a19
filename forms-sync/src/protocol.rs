//! JSON wire protocol for form synchronization.
//!
//! Every WebSocket text frame carries one event:
//! ```text
//! { "event": "formUpdate",
//!   "data":  { "documentId": "…", "fieldId": "q1", "value": "yes", "expectedVersion": 0 } }
//! ```
//!
//! Inbound (client → server): `joinForm`, `leaveForm`, `requestParticipants`,
//! `requestState`, `formUpdate`, `submitForm`.
//!
//! Outbound (server → client): `activeParticipants`, `formUpdated`,
//! `formConflict`, `formState`, `formSubmitted`, `error`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::Role;
use crate::presence::Participant;
use crate::storage::{FieldValues, FinalSubmission};

/// A pre-encoded outbound frame, shared between every subscriber it fans out to.
pub type Frame = Arc<str>;

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinForm {
        document_id: Uuid,
    },
    LeaveForm {
        document_id: Uuid,
    },
    RequestParticipants {
        document_id: Uuid,
    },
    /// Re-fetch authoritative values, typically after a conflict
    RequestState {
        document_id: Uuid,
    },
    FormUpdate {
        document_id: Uuid,
        field_id: String,
        value: Value,
        expected_version: u64,
    },
    SubmitForm {
        document_id: Uuid,
        answers: FieldValues,
    },
}

impl ClientEvent {
    pub fn document_id(&self) -> Uuid {
        match self {
            ClientEvent::JoinForm { document_id }
            | ClientEvent::LeaveForm { document_id }
            | ClientEvent::RequestParticipants { document_id }
            | ClientEvent::RequestState { document_id }
            | ClientEvent::FormUpdate { document_id, .. }
            | ClientEvent::SubmitForm { document_id, .. } => *document_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Presence entry as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub connection_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

impl From<&Participant> for ParticipantInfo {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.identity.id.clone(),
            email: p.identity.email.clone(),
            role: p.identity.role,
            connection_id: p.connection_id,
            joined_at: p.joined_at,
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Full presence snapshot, ordered by join time
    ActiveParticipants {
        document_id: Uuid,
        participants: Vec<ParticipantInfo>,
    },
    FormUpdated {
        document_id: Uuid,
        field_id: String,
        value: Value,
        submitter_id: String,
        timestamp: DateTime<Utc>,
        version: u64,
    },
    /// Sent only to the submitter whose proposal lost
    FormConflict {
        document_id: Uuid,
        message: String,
        latest_version: u64,
    },
    FormState {
        document_id: Uuid,
        values: FieldValues,
        version: u64,
    },
    FormSubmitted {
        document_id: Uuid,
        record: FinalSubmission,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn active_participants(document_id: Uuid, participants: &[Participant]) -> Self {
        ServerEvent::ActiveParticipants {
            document_id,
            participants: participants.iter().map(ParticipantInfo::from).collect(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ActiveParticipants { .. } => "activeParticipants",
            ServerEvent::FormUpdated { .. } => "formUpdated",
            ServerEvent::FormConflict { .. } => "formConflict",
            ServerEvent::FormState { .. } => "formState",
            ServerEvent::FormSubmitted { .. } => "formSubmitted",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Encode once into a shareable frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Arc::from(self.encode()?))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Binary frames are not supported")]
    UnsupportedFrame,
    #[error("Connection closed")]
    ConnectionClosed,
}
