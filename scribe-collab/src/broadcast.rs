//! Fan-out of encoded frames to every connection in a room.
//!
//! Uses a tokio broadcast channel so one send reaches all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind skips ahead and
//! the skipped count is recorded as dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames handed to the channel, whatever the number of receivers
    pub messages_sent: u64,
    /// Frames lagging receivers skipped
    pub messages_dropped: u64,
    /// Connections currently in the group
    pub active_peers: usize,
}

/// An encoded frame tagged with the connection that produced it, so the
/// producer can skip its own echo.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection id of the producer
    pub from: Uuid,
    /// Encoded [`SyncMessage`], shared by every receiver
    pub frame: Arc<Vec<u8>>,
}

/// Broadcast group for a single room. Members are keyed by connection id.
///
/// Connection ids are minted by the relay per WebSocket, not taken from the
/// peer ids clients stamp on their frames, so a client cannot join twice
/// under one id or impersonate another connection.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    /// Remote address per connection, for logging
    peers: Mutex<HashMap<Uuid, SocketAddr>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group whose receivers buffer up to `capacity` frames each.
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Mutex::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a connection and return its receiver.
    ///
    /// The receiver only sees frames sent after this call; catching up on
    /// earlier state is the sync handshake's job.
    pub fn add_peer(&self, conn_id: Uuid, addr: SocketAddr) -> broadcast::Receiver<Envelope> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, addr);
        self.sender.subscribe()
    }

    /// Remove a connection. Its receiver keeps working until dropped, but
    /// it no longer counts toward the room's size.
    pub fn remove_peer(&self, conn_id: &Uuid) -> Option<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conn_id)
    }

    /// Encode and fan out a message. Returns the number of receivers,
    /// the sender's own included; filtering is the receiver's job.
    pub fn broadcast(&self, from: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(from, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, from: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, frame }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Number of connections currently in the group.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of the group's counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerMetadata;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn, addr());
        assert_eq!(group.peer_count(), 1);
        assert_eq!(group.stats().active_peers, 1);

        assert_eq!(group.remove_peer(&conn), Some(addr()));
        assert_eq!(group.peer_count(), 0);
        assert_eq!(group.remove_peer(&conn), None);
    }

    #[tokio::test]
    async fn test_fan_out_tags_sender() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut rx_alice = group.add_peer(alice, addr());
        let mut rx_bob = group.add_peer(bob, addr());

        let msg = SyncMessage::awareness(Uuid::new_v4(), 1, Some(&PeerMetadata::default()));
        assert_eq!(group.broadcast(alice, &msg).unwrap(), 2);

        let seen_by_alice = rx_alice.recv().await.unwrap();
        let seen_by_bob = rx_bob.recv().await.unwrap();
        assert_eq!(seen_by_alice.from, alice);
        assert_eq!(seen_by_bob.from, alice);
        assert_eq!(SyncMessage::decode(&seen_by_bob.frame).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips() {
        let group = BroadcastGroup::new(2);
        let conn = Uuid::new_v4();
        let mut rx = group.add_peer(conn, addr());

        for i in 0..5u8 {
            group.broadcast_raw(conn, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(*rx.recv().await.unwrap().frame, vec![3]);
    }
}
