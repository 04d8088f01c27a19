//! Connection handle: identity plus the outbound queue of one client.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::identity::Identity;
use crate::presence::ConnectionId;
use crate::protocol::{Frame, ProtocolError, ServerEvent};

/// A client connection as seen by rooms.
///
/// Cloning is cheap; every clone feeds the same outbound queue. A connection
/// without an identity is a guest: it may observe broadcasts but never
/// appears in presence.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    identity: Option<Identity>,
    outbox: mpsc::Sender<Frame>,
}

impl Connection {
    pub fn new(identity: Option<Identity>, outbox: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            outbox,
        }
    }

    /// Connection plus the receiving end of its outbound queue.
    pub fn channel(identity: Option<Identity>, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(identity, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_guest(&self) -> bool {
        self.identity.is_none()
    }

    /// Send a reply to this connection only.
    pub async fn send(&self, event: &ServerEvent) -> Result<(), ProtocolError> {
        let frame = event.to_frame()?;
        self.outbox
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub(crate) fn outbox(&self) -> mpsc::Sender<Frame> {
        self.outbox.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    #[tokio::test]
    async fn test_send_reaches_outbox() {
        let (conn, mut rx) = Connection::channel(None, 4);
        assert!(conn.is_guest());

        conn.send(&ServerEvent::error("boom")).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame).unwrap(), ServerEvent::error("boom"));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let identity = Identity::new("u1", "u1@example.com", Role::Admin);
        let (conn, rx) = Connection::channel(Some(identity), 4);
        assert!(!conn.is_guest());
        drop(rx);
        assert_eq!(
            conn.send(&ServerEvent::error("late")).await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[test]
    fn test_ids_unique() {
        let (a, _ra) = Connection::channel(None, 1);
        let (b, _rb) = Connection::channel(None, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
