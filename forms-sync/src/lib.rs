//! # forms-sync: Real-time collaborative form responses
//!
//! Several people fill in one form response together over WebSocket. Every
//! field edit names the version it was based on; the store accepts it only
//! if that version is still current, so concurrent edits never silently
//! overwrite each other.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ FormClient  │ ◄─────────────────► │ SyncServer  │── IdentityVerifier
//! │ (per user)  │     JSON events     │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ RoomManager │
//!                                     └──┬───────┬──┘
//!                                        │       │
//!                          ┌─────────────┘       └──────────────┐
//!                          ▼                                    ▼
//!                   ┌─────────────┐                     ┌──────────────────┐
//!                   │RoomRegistry │                     │ UpdateDispatcher │
//!                   │  Room:      │                     └────────┬─────────┘
//!                   │  Presence + │                              │ compare_and_apply
//!                   │  Broadcast  │                              ▼
//!                   └─────────────┘                     ┌──────────────────┐
//!                                                       │ ResponseStore    │
//!                                                       │ Memory / RocksDB │
//!                                                       └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events
//! - [`identity`]: Token verification and issuing
//! - [`storage`]: Response stores with atomic compare-and-apply
//! - [`presence`]: Per-room participant tracking
//! - [`broadcast`]: Per-room fan-out over bounded outboxes
//! - [`room`]: Rooms and the registry that owns them
//! - [`dispatcher`]: Optimistic-concurrency field updates and final submissions
//! - [`manager`]: Join/leave lifecycle and event routing
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod identity;
pub mod error;
pub mod storage;
pub mod presence;
pub mod connection;
pub mod broadcast;
pub mod room;
pub mod dispatcher;
pub mod manager;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientEvent, Frame, ParticipantInfo, ProtocolError, ServerEvent};
pub use identity::{
    AuthError, Identity, IdentityVerifier, Role, TokenIssuer, TokenVerifier,
};
pub use error::SyncError;
pub use storage::{
    ApplyOutcome, FieldValues, FinalSubmission, MemoryStore, ResponseState,
    ResponseStore, RocksStore, StoreConfig, StoreError,
};
pub use presence::{ConnectionId, Participant, PresenceTracker};
pub use connection::Connection;
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use room::{Room, RoomRegistry};
pub use dispatcher::{AppliedUpdate, PendingMutation, UpdateDispatcher};
pub use manager::{EventOutcome, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, FormClient, FormEvent};
