//! Fan-out of encoded frames to every session in a pipeline room.
//!
//! One tokio broadcast channel per room; each session holds its own receiver
//! buffering up to `capacity` frames. A session that falls further behind
//! observes `Lagged` and skips ahead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Broadcast channel plus membership for one pipeline room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a session. Returns its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.session_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(session_id)
    }

    /// Encode once and send to every receiver, the sender's included.
    /// Receivers filter their own frames.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps pipeline ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, pipeline_id: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(pipeline_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, pipeline_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(pipeline_id).cloned()
    }

    /// Drop the room if nobody is in it.
    pub async fn remove_if_empty(&self, pipeline_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(pipeline_id) {
            if room.peer_count().await == 0 {
                rooms.remove(pipeline_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_pipelines(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(Uuid::new_v4(), name.to_lowercase(), name)
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let id = alice.session_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert!(group.remove_peer(&id).await.is_some());
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_everyone() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(peer("Bob")).await;

        let msg = SyncMessage::delta(alice.session_id, "p", 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        for rx in [&mut rx1, &mut rx2] {
            let bytes = rx.recv().await.unwrap();
            let decoded = SyncMessage::decode(&bytes).unwrap();
            assert_eq!(decoded.session_id, alice.session_id);
            assert_eq!(decoded.payload, vec![1, 2, 3]);
        }
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_ahead() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(peer("Slow")).await;
        for i in 0..5u8 {
            group.broadcast_raw(Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_room_manager_reuses_rooms() {
        let manager = RoomManager::new(16);
        let a = manager.get_or_create("p1").await;
        let b = manager.get_or_create("p1").await;
        let _c = manager.get_or_create("p2").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 2);
        let mut ids = manager.active_pipelines().await;
        ids.sort();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("p1").await;
        let alice = peer("Alice");
        let id = alice.session_id;
        let _rx = room.add_peer(alice).await;

        assert!(!manager.remove_if_empty("p1").await);
        room.remove_peer(&id).await;
        assert!(manager.remove_if_empty("p1").await);
        assert!(manager.get("p1").await.is_none());
    }
}
