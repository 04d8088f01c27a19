//! Rooms and the registry that owns them.
//!
//! ```text
//! RoomRegistry ── doc_id ──► Room
//!                             ├── inner (Mutex): BroadcastGroup + PresenceTracker
//!                             └── sequencer (Mutex): commit → broadcast, in version order
//! ```
//!
//! Membership changes and the presence snapshot they trigger happen under one
//! acquisition of `inner`, so no subscriber can observe a stale snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::presence::{ConnectionId, Participant, PresenceTracker};

pub(crate) struct RoomInner {
    pub(crate) broadcast: BroadcastGroup,
    pub(crate) presence: PresenceTracker,
    /// Set when the registry drops an empty room; joiners must fetch a fresh one.
    pub(crate) closed: bool,
}

/// Live subscribers and participants of one document.
pub struct Room {
    document_id: Uuid,
    inner: Mutex<RoomInner>,
    sequencer: Mutex<()>,
}

impl Room {
    fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            inner: Mutex::new(RoomInner {
                broadcast: BroadcastGroup::new(),
                presence: PresenceTracker::new(),
                closed: false,
            }),
            sequencer: Mutex::new(()),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RoomInner> {
        self.inner.lock().await
    }

    /// Held from store commit through broadcast so updates fan out in commit order.
    pub(crate) async fn sequence(&self) -> MutexGuard<'_, ()> {
        self.sequencer.lock().await
    }

    /// Current participants, earliest join first.
    pub async fn snapshot(&self) -> Vec<Participant> {
        self.inner.lock().await.presence.snapshot()
    }

    pub async fn is_participant(&self, connection_id: &ConnectionId) -> bool {
        self.inner.lock().await.presence.contains(connection_id)
    }

    pub async fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.inner.lock().await.broadcast.contains(connection_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.broadcast.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.inner.lock().await.broadcast.stats()
    }
}

/// Maps document ids to rooms. Rooms are created lazily on first join.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, document_id: Uuid) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&document_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(document_id)
            .or_insert_with(|| Arc::new(Room::new(document_id)))
            .clone()
    }

    pub async fn get(&self, document_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Drop the room if nobody is subscribed.
    pub async fn remove_if_empty(&self, document_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(document_id) {
            Some(room) => room.clone(),
            None => return false,
        };

        let mut inner = room.lock().await;
        if !inner.broadcast.is_empty() {
            return false;
        }
        inner.closed = true;
        drop(inner);

        rooms.remove(document_id);
        log::debug!("Room {document_id} removed (empty)");
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, Role};
    use crate::protocol::Frame;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = RoomRegistry::new();
        let doc = Uuid::new_v4();

        let a = registry.get_or_create(doc).await;
        let b = registry.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.document_id(), doc);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_isolated() {
        let registry = RoomRegistry::new();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();

        let room1 = registry.get_or_create(doc1).await;
        let _room2 = registry.get_or_create(doc2).await;

        let (tx, _rx) = mpsc::channel(1);
        room1.lock().await.broadcast.subscribe(Uuid::new_v4(), tx);

        assert_eq!(registry.room_count().await, 2);
        assert_eq!(registry.get(&doc1).await.unwrap().subscriber_count().await, 1);
        assert_eq!(registry.get(&doc2).await.unwrap().subscriber_count().await, 0);

        let docs = registry.active_documents().await;
        assert!(docs.contains(&doc1));
        assert!(docs.contains(&doc2));
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let registry = RoomRegistry::new();
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let room = registry.get_or_create(doc).await;
        let (tx, _rx) = mpsc::channel(1);
        room.lock().await.broadcast.subscribe(conn, tx);

        assert!(!registry.remove_if_empty(&doc).await);
        assert_eq!(registry.room_count().await, 1);

        room.lock().await.broadcast.unsubscribe(&conn);
        assert!(registry.remove_if_empty(&doc).await);
        assert_eq!(registry.room_count().await, 0);
        assert!(room.lock().await.closed);

        // A later join gets a fresh room
        let fresh = registry.get_or_create(doc).await;
        assert!(!Arc::ptr_eq(&room, &fresh));
        assert!(!fresh.lock().await.closed);
    }

    #[tokio::test]
    async fn test_participants_and_subscribers_tracked_separately() {
        let registry = RoomRegistry::new();
        let room = registry.get_or_create(Uuid::new_v4()).await;
        let member = Uuid::new_v4();
        let guest = Uuid::new_v4();

        let (member_tx, _member_rx) = mpsc::channel(1);
        let (guest_tx, _guest_rx) = mpsc::channel(1);
        {
            let mut inner = room.lock().await;
            inner.broadcast.subscribe(member, member_tx);
            inner.broadcast.subscribe(guest, guest_tx);
            inner
                .presence
                .join(member, Identity::new("alice", "alice@example.com", Role::Respondent));
        }

        assert!(room.is_participant(&member).await);
        assert!(!room.is_participant(&guest).await);
        assert!(room.is_subscribed(&guest).await);
        assert_eq!(room.snapshot().await.len(), 1);

        let stats = room.stats().await;
        assert_eq!(stats.active_subscribers, 2);
        assert_eq!(stats.messages_sent, 0);

        // Both outboxes hold one frame; the next broadcast is dropped for each
        room.lock().await.broadcast.broadcast_raw(Frame::from("a"));
        room.lock().await.broadcast.broadcast_raw(Frame::from("b"));
        let stats = room.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 2);
    }
}
