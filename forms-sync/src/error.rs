//! Engine error taxonomy.
//!
//! | Variant               | Surfaced as       | Connection |
//! |-----------------------|-------------------|------------|
//! | `AuthenticationFailed`| `error`, close    | closed     |
//! | `Unauthorized`        | `error`           | open       |
//! | `Conflict`            | `formConflict`    | open       |
//! | `StoreUnavailable`    | generic `error`   | open       |
//! | `NotFound`            | `error`           | open       |
//! | `BadRequest`          | `error`           | open       |

use thiserror::Error;
use uuid::Uuid;

use crate::identity::AuthError;
use crate::storage::StoreError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("version conflict, latest version is {latest_version}")]
    Conflict { latest_version: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no response exists for document {0}")]
    NotFound(Uuid),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::StoreUnavailable(other.to_string()),
        }
    }
}

impl SyncError {
    /// Text safe to send to a client. Authentication and storage failures are
    /// reported generically; the detail stays in the server log.
    pub fn client_message(&self) -> String {
        match self {
            SyncError::AuthenticationFailed(_) => "Authentication failed".to_string(),
            SyncError::StoreUnavailable(_) => "Service temporarily unavailable".to_string(),
            SyncError::Conflict { .. } => {
                "Form was updated by someone else; refresh and try again".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether this is an expected outcome of normal operation rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict { .. } | SyncError::NotFound(_) | SyncError::BadRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(SyncError::from(StoreError::NotFound(id)), SyncError::NotFound(id));
        assert!(matches!(
            SyncError::from(StoreError::Database("disk".into())),
            SyncError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_client_message_hides_detail() {
        let err = SyncError::StoreUnavailable("IO error: /var/lib/forms corrupted".into());
        assert!(!err.client_message().contains("/var/lib"));

        let err = SyncError::from(AuthError::BadSignature);
        assert_eq!(err.client_message(), "Authentication failed");

        let err = SyncError::Unauthorized("join the form first".into());
        assert!(err.client_message().contains("join the form first"));
    }

    #[test]
    fn test_expected_errors() {
        assert!(SyncError::Conflict { latest_version: 3 }.is_expected());
        assert!(SyncError::NotFound(Uuid::nil()).is_expected());
        assert!(!SyncError::StoreUnavailable("x".into()).is_expected());
    }
}
