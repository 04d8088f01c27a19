//! In-process response store.
//!
//! All state sits behind one `RwLock`; each conditional write runs inside a
//! single write-lock critical section, which makes check-and-apply atomic with
//! respect to every other caller in the process.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ApplyOutcome, FieldValues, FinalSubmission, ResponseState, ResponseStore, StoreError};

#[derive(Debug, Default)]
struct DocumentRecord {
    state: Option<ResponseState>,
    submissions: Vec<FinalSubmission>,
}

/// Volatile store used when no storage path is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<Uuid, DocumentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents with a response record.
    pub async fn document_count(&self) -> usize {
        self.documents
            .read()
            .await
            .values()
            .filter(|r| r.state.is_some())
            .count()
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn create_response(&self, document_id: Uuid) -> Result<ResponseState, StoreError> {
        let mut docs = self.documents.write().await;
        let record = docs.entry(document_id).or_default();
        let state = record
            .state
            .get_or_insert_with(|| ResponseState::new(document_id));
        Ok(state.clone())
    }

    async fn get_version(&self, document_id: Uuid) -> Result<u64, StoreError> {
        let docs = self.documents.read().await;
        docs.get(&document_id)
            .and_then(|r| r.state.as_ref())
            .map(|s| s.version)
            .ok_or(StoreError::NotFound(document_id))
    }

    async fn load_state(&self, document_id: Uuid) -> Result<ResponseState, StoreError> {
        let docs = self.documents.read().await;
        docs.get(&document_id)
            .and_then(|r| r.state.clone())
            .ok_or(StoreError::NotFound(document_id))
    }

    async fn compare_and_apply(
        &self,
        document_id: Uuid,
        field_id: &str,
        value: Value,
        expected_version: u64,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut docs = self.documents.write().await;
        let state = docs
            .get_mut(&document_id)
            .and_then(|r| r.state.as_mut())
            .ok_or(StoreError::NotFound(document_id))?;

        if state.version != expected_version {
            return Ok(ApplyOutcome {
                applied: false,
                version: state.version,
            });
        }

        state.values.insert(field_id.to_string(), value);
        state.version += 1;
        Ok(ApplyOutcome {
            applied: true,
            version: state.version,
        })
    }

    async fn append_final_submission(
        &self,
        document_id: Uuid,
        submitter_id: &str,
        answers: FieldValues,
    ) -> Result<FinalSubmission, StoreError> {
        let mut docs = self.documents.write().await;
        let record = docs
            .get_mut(&document_id)
            .filter(|r| r.state.is_some())
            .ok_or(StoreError::NotFound(document_id))?;

        let sequence = record.submissions.len() as u64 + 1;
        let submission = FinalSubmission::new(document_id, submitter_id, sequence, answers);
        record.submissions.push(submission.clone());
        Ok(submission)
    }

    async fn list_submissions(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<FinalSubmission>, StoreError> {
        let docs = self.documents.read().await;
        docs.get(&document_id)
            .filter(|r| r.state.is_some())
            .map(|r| r.submissions.clone())
            .ok_or(StoreError::NotFound(document_id))
    }
}
