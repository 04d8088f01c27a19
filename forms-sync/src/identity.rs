//! Identity verification at connection handshake.
//!
//! Tokens are self-contained and signed:
//! ```text
//! base64url(claims JSON) "." base64url(blake3 keyed MAC over the first part)
//! ```
//! Claims carry `sub`, `email`, `role` and `exp` (unix seconds). The signing key
//! is derived from a shared secret with `blake3::derive_key`, so the same secret
//! configured on issuer and verifier is all that is needed.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_CONTEXT: &str = "forms-sync 2026-01 identity token signing";

/// What a verified identity may do in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Respondent,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "respondent" => Ok(Role::Respondent),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role,
        }
    }
}

/// Reasons a credential is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

/// Turns a presented credential into a verified identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    role: Role,
    exp: i64,
}

fn signing_key(secret: &[u8]) -> [u8; 32] {
    blake3::derive_key(KEY_CONTEXT, secret)
}

/// Mints signed tokens.
pub struct TokenIssuer {
    key: [u8; 32],
    ttl: Duration,
}

impl TokenIssuer {
    /// Issuer with a one hour token lifetime.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: signing_key(secret),
            ttl: Duration::hours(1),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue(&self, identity: &Identity) -> String {
        let claims = Claims {
            sub: identity.id.clone(),
            email: identity.email.clone(),
            role: identity.role,
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        // Claims are plain strings and integers; serialization cannot fail.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac.as_bytes()))
    }
}

/// Verifies tokens minted by a [`TokenIssuer`] sharing the same secret.
pub struct TokenVerifier {
    key: [u8; 32],
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: signing_key(secret),
        }
    }

    fn verify_now(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("missing signature".into()))?;

        let sig_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| AuthError::Malformed("signature length".into()))?;

        // blake3::Hash equality is constant-time
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        if expected != blake3::Hash::from(sig_bytes) {
            return Err(AuthError::BadSignature);
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(Identity {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

#[async_trait]
impl IdentityVerifier for TokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_now(token)
    }
}
