//! Fan-out of relayed frames to the sessions of one document.
//!
//! Uses a tokio broadcast channel so one send reaches every subscriber.
//! Each frame carries the connection it originated from; sessions skip
//! their own frames instead of echoing them back.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `RecvError::Lagged` and must resynchronise from full state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::replica::ConnectionId;

/// A pre-encoded frame on its way to other sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    /// Connection that caused the frame (`None` for server-originated frames)
    pub origin: Option<ConnectionId>,
    /// Encoded protocol frame
    pub bytes: Vec<u8>,
}

impl RelayFrame {
    /// Whether a session with identity `conn` should forward this frame.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.origin != Some(conn)
    }
}

pub type RelayReceiver = broadcast::Receiver<Arc<RelayFrame>>;
pub type RelaySender = broadcast::Sender<Arc<RelayFrame>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub subscribers: usize,
}

/// Broadcast group for a single document.
pub struct BroadcastGroup {
    sender: RelaySender,
    capacity: usize,
    frames_sent: Arc<AtomicU64>,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// New receiver; sees every frame sent after this call.
    pub fn subscribe(&self) -> RelayReceiver {
        self.sender.subscribe()
    }

    /// Send an encoded frame to all subscribers.
    ///
    /// Returns how many receivers it was queued for (zero when nobody is
    /// listening, which is not an error).
    pub fn send(&self, origin: Option<ConnectionId>, bytes: Vec<u8>) -> usize {
        send_counted(&self.sender, &self.frames_sent, origin, bytes)
    }

    /// Detached sending half, for callbacks that cannot borrow the group.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            sender: self.sender.clone(),
            frames_sent: self.frames_sent.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Cloneable sending half of a [`BroadcastGroup`].
#[derive(Clone)]
pub struct Publisher {
    sender: RelaySender,
    frames_sent: Arc<AtomicU64>,
}

impl Publisher {
    pub fn send(&self, origin: Option<ConnectionId>, bytes: Vec<u8>) -> usize {
        send_counted(&self.sender, &self.frames_sent, origin, bytes)
    }
}

fn send_counted(
    sender: &RelaySender,
    frames_sent: &AtomicU64,
    origin: Option<ConnectionId>,
    bytes: Vec<u8>,
) -> usize {
    let count = sender
        .send(Arc::new(RelayFrame { origin, bytes }))
        .unwrap_or(0);
    frames_sent.fetch_add(1, Ordering::Relaxed);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_send_reaches_all_subscribers() {
        let group = BroadcastGroup::new(16);
        let mut a = group.subscribe();
        let mut b = group.subscribe();

        let origin = Uuid::new_v4();
        assert_eq!(group.send(Some(origin), vec![1, 2]), 2);

        let fa = a.recv().await.unwrap();
        let fb = b.recv().await.unwrap();
        assert_eq!(fa.bytes, vec![1, 2]);
        assert_eq!(fb.origin, Some(origin));
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.send(None, vec![0]), 0);
        assert_eq!(group.stats().frames_sent, 1);
    }

    #[test]
    fn test_origin_filter() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let frame = RelayFrame { origin: Some(me), bytes: vec![] };
        assert!(!frame.is_for(me));
        assert!(frame.is_for(other));
        assert!(RelayFrame { origin: None, bytes: vec![] }.is_for(me));
    }

    #[tokio::test]
    async fn test_publisher_shares_channel() {
        let group = BroadcastGroup::new(4);
        let mut rx = group.subscribe();
        let publisher = group.publisher();

        publisher.send(None, vec![9]);
        assert_eq!(rx.recv().await.unwrap().bytes, vec![9]);
        assert_eq!(group.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.send(None, vec![i]);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_subscriber_count() {
        let group = BroadcastGroup::new(8);
        assert_eq!(group.subscriber_count(), 0);
        let rx = group.subscribe();
        assert_eq!(group.subscriber_count(), 1);
        drop(rx);
        assert_eq!(group.subscriber_count(), 0);
        assert_eq!(group.capacity(), 8);
    }
}
