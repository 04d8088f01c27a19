//! Presence tracking: which verified identities are in a room right now.
//!
//! Participants are keyed by connection handle, so removal on disconnect is a
//! single map delete. Snapshots are ordered by join sequence, never by hash
//! order, so every subscriber sees the same list.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::identity::Identity;

/// Opaque handle for one client connection.
pub type ConnectionId = Uuid;

/// A verified identity present in a room through one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
    /// Per-room monotonic join order; breaks timestamp ties.
    join_seq: u64,
}

/// Presence state for one room.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: HashMap<ConnectionId, Participant>,
    next_seq: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `identity` as present through `connection_id`.
    ///
    /// Returns `false` when the connection was already present; the original
    /// entry (and its join time) is kept.
    pub fn join(&mut self, connection_id: ConnectionId, identity: Identity) -> bool {
        if self.participants.contains_key(&connection_id) {
            return false;
        }
        let join_seq = self.next_seq;
        self.next_seq += 1;
        self.participants.insert(
            connection_id,
            Participant {
                identity,
                connection_id,
                joined_at: Utc::now(),
                join_seq,
            },
        );
        true
    }

    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<Participant> {
        self.participants.remove(connection_id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&Participant> {
        self.participants.get(connection_id)
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.participants.contains_key(connection_id)
    }

    /// Current participants, earliest join first.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by_key(|p| p.join_seq);
        list
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
