//! Fan-out of sync frames to every member of a document room.
//!
//! Uses a tokio broadcast channel: one encode, O(1) send to all
//! subscribers. Each frame carries the connection id it came from so a
//! member can skip its own echo without decoding.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, SyncMessage};

/// Identifier the relay assigns to each accepted socket.
pub type ConnectionId = u64;

/// Pre-encoded frame plus its origin.
#[derive(Debug)]
pub struct Frame {
    pub origin: ConnectionId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow member may fall behind before
    /// it starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Join the group. Returns the member's receiver.
    pub async fn add_member(&self, conn: ConnectionId) -> broadcast::Receiver<Arc<Frame>> {
        self.members.write().await.insert(conn);
        self.sender.subscribe()
    }

    /// Returns true if the member was present.
    pub async fn remove_member(&self, conn: ConnectionId) -> bool {
        self.members.write().await.remove(&conn)
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, origin: ConnectionId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(origin, bytes))
    }

    pub fn broadcast_raw(&self, origin: ConnectionId, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Frame { origin, bytes }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging member missed.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, conn: ConnectionId) -> bool {
        self.members.read().await.contains(&conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_member(1).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(1).await);

        assert!(group.remove_member(1).await);
        assert!(!group.remove_member(1).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_tags_origin() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_member(1).await;
        let mut rx2 = group.add_member(2).await;

        let msg = SyncMessage::update("demo", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(1, &msg).unwrap(), 2);

        // Filtering the echo is the receiver's job.
        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.origin, 1);
        assert_eq!(SyncMessage::decode(&f2.bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_lagging_member_detected() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_member(1).await;
        for i in 0..5 {
            group.broadcast_raw(2, vec![i]);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("Expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
    }
}
