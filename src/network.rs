//! Peer transport collaborator (spec §6 External Interfaces).
//!
//! P2P discovery and wire transport are out of scope for this crate (§1);
//! `PeerTransport` is the trait contract the chain controller depends on,
//! grounded on the shape of the teacher's own `Network` (peer bookkeeping,
//! `async`, `tokio::sync::mpsc` message plumbing) but stripped of the
//! concrete TCP listener/stream code, which belongs to an out-of-scope
//! transport implementation. `InMemoryTransport` is the in-process stub
//! used by tests and by single-node operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::block::Block;
use crate::transaction::Transaction;

/// Opaque, type-tagged payload carried between nodes. The core tolerates
/// duplicate and out-of-order delivery (spec §6): consensus votes are
/// inserted into insertion-ordered maps keyed by (view, round, block_hash,
/// validator), so redelivery of the same message is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    NewBlock(Block),
    NewTransaction(Transaction),
    ConsensusVote { view: u64, round: u64, block_hash: String, validator: String, phase: String },
    SyncRequest { from_index: u64 },
    SyncResponse(Vec<Block>),
    Ping,
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub last_seen: i64,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub peer_count: usize,
}

/// The collaborator contract (spec §6): `broadcast`, `send`, `peers`,
/// `node_info`. Delivery is at-least-once and implementations are expected
/// to be cheap to clone/share (`Arc`-wrapped internals), since the chain
/// controller holds one instance for the lifetime of the process.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn broadcast(&self, msg: PeerMessage);
    async fn send(&self, peer_id: &str, msg: PeerMessage);
    async fn peers(&self) -> Vec<PeerInfo>;
    fn node_info(&self) -> NodeInfo;
}

/// In-process stub: messages sent to a peer land on that peer's inbox
/// channel (capacity 100, matching the bounded cross-shard queues in §5).
/// Used by tests and as the degenerate single-node transport.
pub struct InMemoryTransport {
    node_id: String,
    inboxes: Arc<Mutex<HashMap<String, mpsc::Sender<PeerMessage>>>>,
    peers: Arc<Mutex<HashMap<String, PeerInfo>>>,
}

impl InMemoryTransport {
    pub fn new(node_id: String) -> Self {
        InMemoryTransport {
            node_id,
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a peer and return the receiving end of its inbox, so a test
    /// harness can drain what was sent to it.
    pub async fn register_peer(&self, peer_id: &str) -> mpsc::Receiver<PeerMessage> {
        let (tx, rx) = mpsc::channel(100);
        self.inboxes.lock().await.insert(peer_id.to_string(), tx);
        self.peers.lock().await.insert(
            peer_id.to_string(),
            PeerInfo { id: peer_id.to_string(), address: peer_id.to_string(), last_seen: 0, connected: true },
        );
        rx
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn broadcast(&self, msg: PeerMessage) {
        let inboxes = self.inboxes.lock().await;
        for sender in inboxes.values() {
            let _ = sender.send(msg.clone()).await;
        }
    }

    async fn send(&self, peer_id: &str, msg: PeerMessage) {
        if let Some(sender) = self.inboxes.lock().await.get(peer_id) {
            let _ = sender.send(msg).await;
        }
    }

    async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().await.values().cloned().collect()
    }

    fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            address: self.node_id.clone(),
            peer_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_registered_peer() {
        let transport = InMemoryTransport::new("node-0".into());
        let mut rx_a = transport.register_peer("a").await;
        let mut rx_b = transport.register_peer("b").await;

        transport.broadcast(PeerMessage::Ping).await;

        assert!(matches!(rx_a.recv().await, Some(PeerMessage::Ping)));
        assert!(matches!(rx_b.recv().await, Some(PeerMessage::Ping)));
    }

    #[tokio::test]
    async fn send_targets_a_single_peer() {
        let transport = InMemoryTransport::new("node-0".into());
        let mut rx_a = transport.register_peer("a").await;
        let mut rx_b = transport.register_peer("b").await;

        transport.send("a", PeerMessage::Ping).await;

        assert!(matches!(rx_a.recv().await, Some(PeerMessage::Ping)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn peers_reports_registered_ids() {
        let transport = InMemoryTransport::new("node-0".into());
        transport.register_peer("a").await;
        let peers = transport.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "a");
    }
}
