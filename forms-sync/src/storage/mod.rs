//! Response storage: the single source of truth for field values and versions.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   compare_and_apply   ┌──────────────────────────────┐
//! │ UpdateDispatcher│ ────────────────────► │ ResponseStore                │
//! └────────────────┘                        │  ├── MemoryStore (in-process) │
//!                                           │  └── RocksStore  (RocksDB)    │
//! ┌────────────────┐ append_final_submission│                              │
//! │ RoomManager     │ ────────────────────► │ version counter per document │
//! └────────────────┘                        └──────────────────────────────┘
//! ```
//!
//! Only the store increments a document's `version`. Every implementation must
//! make `compare_and_apply` a single serializable operation: two callers that
//! present the same `expected_version` can never both succeed.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Field id → current value. Ordered so snapshots serialize deterministically.
pub type FieldValues = BTreeMap<String, Value>;

/// Authoritative state of one document's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseState {
    pub document_id: Uuid,
    pub values: FieldValues,
    pub version: u64,
}

impl ResponseState {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            values: FieldValues::new(),
            version: 0,
        }
    }
}

/// Result of a conditional write.
///
/// When `applied` is true, `version` is the freshly committed version.
/// Otherwise it is the version the store held at the time of the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub version: u64,
}

/// An immutable, finalized snapshot of all answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalSubmission {
    pub id: Uuid,
    pub document_id: Uuid,
    pub submitter_id: String,
    /// Position in the document's append-only submission stream (starts at 1)
    pub sequence: u64,
    pub answers: FieldValues,
    pub submitted_at: DateTime<Utc>,
}

impl FinalSubmission {
    pub(crate) fn new(
        document_id: Uuid,
        submitter_id: &str,
        sequence: u64,
        answers: FieldValues,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            submitter_id: submitter_id.to_string(),
            sequence,
            answers,
            submitted_at: Utc::now(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Response not found for document {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable per-document response records with optimistic-concurrency writes.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Create an empty response record at version 0.
    ///
    /// Idempotent: an existing record is returned untouched.
    async fn create_response(&self, document_id: Uuid) -> Result<ResponseState, StoreError>;

    /// Current version of the document's response.
    async fn get_version(&self, document_id: Uuid) -> Result<u64, StoreError>;

    /// Full authoritative state (values + version).
    async fn load_state(&self, document_id: Uuid) -> Result<ResponseState, StoreError>;

    /// Apply `value` to `field_id` and bump the version, but only if the stored
    /// version still equals `expected_version`.
    async fn compare_and_apply(
        &self,
        document_id: Uuid,
        field_id: &str,
        value: Value,
        expected_version: u64,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Append a finalized submission. Never touches the live version counter.
    async fn append_final_submission(
        &self,
        document_id: Uuid,
        submitter_id: &str,
        answers: FieldValues,
    ) -> Result<FinalSubmission, StoreError>;

    /// All final submissions for a document, oldest first.
    async fn list_submissions(&self, document_id: Uuid)
        -> Result<Vec<FinalSubmission>, StoreError>;
}
