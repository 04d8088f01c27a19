//! Fan-out of room events to every subscribed connection.
//!
//! Each event is encoded once into a shared [`Frame`] and pushed into every
//! subscriber's bounded outbound queue with `try_send`, so one slow client
//! never stalls the room. A full queue drops the frame for that subscriber
//! and counts it; the client notices the version gap and re-requests state.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::presence::ConnectionId;
use crate::protocol::{Frame, ProtocolError, ServerEvent};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of one room.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    subscribers: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, connection_id: ConnectionId, outbox: mpsc::Sender<Frame>) -> bool {
        self.subscribers.insert(connection_id, outbox).is_none()
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        self.subscribers.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Encode `event` once and deliver it to every subscriber.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn broadcast(&self, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let frame = event.to_frame()?;
        Ok(self.broadcast_raw(frame))
    }

    /// Deliver a pre-encoded frame to every subscriber.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let mut delivered = 0;
        for (connection_id, outbox) in &self.subscribers {
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Subscriber {connection_id} outbox full, frame dropped");
                }
                // Connection is shutting down; its disconnect will unsubscribe it.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Queue `event` for one subscriber only. Returns `false` if it is not
    /// subscribed or its outbox cannot take the frame.
    pub fn send_to(&self, connection_id: &ConnectionId, event: &ServerEvent) -> Result<bool, ProtocolError> {
        let Some(outbox) = self.subscribers.get(connection_id) else {
            return Ok(false);
        };
        match outbox.try_send(event.to_frame()?) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Subscriber {connection_id} outbox full, reply dropped");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Ok(false),
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let mut group = BroadcastGroup::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = Uuid::new_v4();

        assert!(group.subscribe(conn, tx.clone()));
        assert!(!group.subscribe(conn, tx));
        assert_eq!(group.len(), 1);
        assert!(group.contains(&conn));

        assert!(group.unsubscribe(&conn));
        assert!(!group.unsubscribe(&conn));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out() {
        let mut group = BroadcastGroup::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(4);
            group.subscribe(Uuid::new_v4(), tx);
            receivers.push(rx);
        }

        let count = group.broadcast(&ServerEvent::error("hello")).unwrap();
        assert_eq!(count, 3);

        for rx in &mut receivers {
            let frame = rx.recv().await.unwrap();
            assert_eq!(ServerEvent::decode(&frame).unwrap(), ServerEvent::error("hello"));
        }
    }

    #[tokio::test]
    async fn test_full_outbox_drops_and_counts() {
        let mut group = BroadcastGroup::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        group.subscribe(Uuid::new_v4(), slow_tx);
        group.subscribe(Uuid::new_v4(), fast_tx);

        assert_eq!(group.broadcast_raw(Frame::from("1")), 2);
        assert_eq!(group.broadcast_raw(Frame::from("2")), 1);

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_subscribers, 2);

        assert_eq!(&*fast_rx.recv().await.unwrap(), "1");
        assert_eq!(&*fast_rx.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_closed_subscriber_skipped() {
        let mut group = BroadcastGroup::new();
        let (tx, rx) = mpsc::channel(1);
        group.subscribe(Uuid::new_v4(), tx);
        drop(rx);

        assert_eq!(group.broadcast_raw(Frame::from("x")), 0);
        assert_eq!(group.stats().messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_send_to_single_subscriber() {
        let mut group = BroadcastGroup::new();
        let a = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        group.subscribe(a, tx_a);
        group.subscribe(Uuid::new_v4(), tx_b);

        assert!(group.send_to(&a, &ServerEvent::error("only a")).unwrap());
        assert!(!group.send_to(&Uuid::new_v4(), &ServerEvent::error("nobody")).unwrap());

        assert_eq!(
            ServerEvent::decode(&rx_a.recv().await.unwrap()).unwrap(),
            ServerEvent::error("only a")
        );
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_preserved_per_subscriber() {
        let mut group = BroadcastGroup::new();
        let (tx, mut rx) = mpsc::channel(128);
        group.subscribe(Uuid::new_v4(), tx);

        for i in 0..100 {
            group.broadcast_raw(Frame::from(i.to_string()));
        }
        for i in 0..100 {
            assert_eq!(&*rx.recv().await.unwrap(), i.to_string());
        }
    }
}
