//! Shard manager and cross-shard two-phase commit coordinator (spec §4.4).
//!
//! Routing is a pure function of the sender/receiver address
//! ([`primitives::route_shard`]); the shard map itself is a [`DashMap`] so
//! per-shard pool access never blocks other shards, matching the teacher's
//! `DashMap<u32, Arc<RwLock<Shard>>>` shape in its own `sharding.rs`.
//! Cross-shard commit uses a bounded `tokio::sync::mpsc` channel per
//! in-flight transaction to carry prepare/ack/commit/abort messages between
//! the source and destination coordinators, with a per-phase timeout and
//! retry policy lifted from §4.4 and §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::pool::TransactionPool;
use crate::primitives;
use crate::transaction::Transaction;
use crate::{NodeError, Result};

/// Per-phase timeout before a retry (or final abort) is attempted (§4.4, §5).
const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(10);
/// Exponential backoff between retries: 100 ms, 400 ms, 1.6 s.
const RETRY_BACKOFFS_MS: [u64; 3] = [100, 400, 1600];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossShardStatus {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct CrossShardTransaction {
    pub id: String,
    pub tx: Transaction,
    pub source_shard: u32,
    pub dest_shard: u32,
    pub status: CrossShardStatus,
    pub attempts: u32,
}

/// Coordinator messages exchanged between the source and destination side
/// of a cross-shard commit. Kept as plain enum payloads rather than bytes
/// since both ends live in the same process (spec's peer transport is a
/// separate, out-of-scope collaborator).
#[derive(Debug, Clone)]
enum CoordMessage {
    Prepare(Transaction),
    Ack,
    Abort(String),
    Commit,
}

#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    pub committed_single_shard: u64,
    pub committed_cross_shard: u64,
    pub failed_cross_shard: u64,
}

impl ShardMetrics {
    fn total_committed(&self) -> u64 {
        self.committed_single_shard + self.committed_cross_shard
    }
}

/// Owns per-shard pending pools and coordinates cross-shard commits.
pub struct ShardManager {
    num_shards: u32,
    pools: DashMap<u32, TransactionPool>,
    cross_shard: DashMap<String, CrossShardTransaction>,
    metrics: DashMap<u32, ShardMetrics>,
    /// When set, the destination side of the next N cross-shard commits
    /// never acks, used by tests to exercise the timeout/retry/abort path
    /// (spec §8 scenario 6) without a real network fault.
    fault_inject_unresponsive: Arc<Mutex<u32>>,
    phase_timeout: Duration,
}

impl ShardManager {
    pub fn new(num_shards: u32, pool_capacity: usize) -> Self {
        Self::with_phase_timeout(num_shards, pool_capacity, DEFAULT_PHASE_TIMEOUT)
    }

    /// As [`Self::new`], but with an overridable per-phase timeout: tests
    /// exercising the abort path use a short timeout so the retry ladder
    /// doesn't take 33+ seconds of wall-clock time.
    pub fn with_phase_timeout(num_shards: u32, pool_capacity: usize, phase_timeout: Duration) -> Self {
        let pools = DashMap::new();
        let metrics = DashMap::new();
        for shard_id in 0..num_shards {
            pools.insert(shard_id, TransactionPool::new(pool_capacity));
            metrics.insert(shard_id, ShardMetrics::default());
        }
        ShardManager {
            num_shards,
            pools,
            cross_shard: DashMap::new(),
            metrics,
            fault_inject_unresponsive: Arc::new(Mutex::new(0)),
            phase_timeout,
        }
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn route(&self, address: &str) -> u32 {
        primitives::route_shard(address, self.num_shards)
    }

    /// Test/benchmark hook: make the next `count` cross-shard commits fail
    /// to ack, forcing the timeout-retry-abort path.
    pub async fn inject_unresponsive_destination(&self, count: u32) {
        *self.fault_inject_unresponsive.lock().await = count;
    }

    /// Admit a transaction: single-shard transactions go straight into the
    /// source pool; cross-shard transactions run the 2PC protocol below.
    pub async fn submit(&self, tx: Transaction) -> Result<()> {
        let source = self.route(&tx.sender);
        let dest = self.route(&tx.receiver);

        if source == dest {
            self.admit_local(source, tx)?;
            if let Some(mut m) = self.metrics.get_mut(&source) {
                m.committed_single_shard += 1;
            }
            return Ok(());
        }

        self.run_two_phase_commit(source, dest, tx).await
    }

    fn admit_local(&self, shard: u32, tx: Transaction) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(&shard)
            .ok_or_else(|| NodeError::InvalidShard(format!("no pool for shard {}", shard)))?;
        pool.admit(tx, shard)
    }

    /// Cross-shard two-phase commit (spec §4.4): the lower shard id is
    /// always the coordinator to avoid deadlock on concurrent cross-shard
    /// pairs routed in opposite directions.
    async fn run_two_phase_commit(&self, source: u32, dest: u32, tx: Transaction) -> Result<()> {
        let coordinator = source.min(dest);
        let participant = source.max(dest);
        let id = format!("xs-{}-{}-{}", coordinator, participant, tx.id);

        self.cross_shard.insert(
            id.clone(),
            CrossShardTransaction {
                id: id.clone(),
                tx: tx.clone(),
                source_shard: source,
                dest_shard: dest,
                status: CrossShardStatus::Preparing,
                attempts: 0,
            },
        );

        let mut last_err = NodeError::Timeout("cross-shard prepare".into());
        for (attempt, backoff_ms) in RETRY_BACKOFFS_MS.iter().enumerate() {
            match self.attempt_prepare_and_commit(&id, participant, &tx).await {
                Ok(()) => {
                    self.admit_local(source, tx.clone())?;
                    if source != dest {
                        // Destination records the same logical transaction
                        // once committed, matching §3's atomicity rule.
                        let _ = self.admit_local(dest, tx.clone());
                    }
                    if let Some(mut m) = self.metrics.get_mut(&coordinator) {
                        m.committed_cross_shard += 1;
                    }
                    if let Some(mut entry) = self.cross_shard.get_mut(&id) {
                        entry.status = CrossShardStatus::Committed;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("cross-shard {} attempt {} failed: {}", id, attempt + 1, e);
                    last_err = e;
                    if let Some(mut entry) = self.cross_shard.get_mut(&id) {
                        entry.attempts += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                }
            }
        }

        if let Some(mut entry) = self.cross_shard.get_mut(&id) {
            entry.status = CrossShardStatus::Aborted;
        }
        if let Some(mut m) = self.metrics.get_mut(&coordinator) {
            m.failed_cross_shard += 1;
        }
        info!("cross-shard {} aborted after {} attempts", id, RETRY_BACKOFFS_MS.len());
        Err(last_err)
    }

    /// Run one prepare/ack/commit round against a simulated participant.
    /// Uses a bounded mpsc channel (capacity 100, per §5) even though both
    /// ends are local, so the message-passing shape matches what a real
    /// peer-transport-backed implementation would do.
    async fn attempt_prepare_and_commit(&self, id: &str, participant: u32, tx: &Transaction) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel::<CoordMessage>(100);

        let unresponsive = {
            let mut guard = self.fault_inject_unresponsive.lock().await;
            if *guard > 0 {
                *guard -= 1;
                true
            } else {
                false
            }
        };

        if let Some(mut entry) = self.cross_shard.get_mut(id) {
            entry.status = CrossShardStatus::Preparing;
        }

        // Simulated destination-side participant task.
        let participant_tx = tx.clone();
        let reply = reply_tx.clone();
        tokio::spawn(async move {
            if unresponsive {
                return;
            }
            let ack = if participant_tx.receiver.is_empty() {
                CoordMessage::Abort("empty receiver".into())
            } else {
                CoordMessage::Ack
            };
            let _ = reply.send(ack).await;
        });
        drop(reply_tx);

        let _ = participant; // routing already resolved by caller; kept for log context

        let ack = timeout(self.phase_timeout, reply_rx.recv())
            .await
            .map_err(|_| NodeError::Timeout(format!("prepare phase for {}", id)))?
            .ok_or_else(|| NodeError::Timeout(format!("participant closed channel for {}", id)))?;

        match ack {
            CoordMessage::Ack => {
                if let Some(mut entry) = self.cross_shard.get_mut(id) {
                    entry.status = CrossShardStatus::Prepared;
                }
            }
            CoordMessage::Abort(reason) => {
                return Err(NodeError::Validation(format!("cross-shard prepare aborted: {}", reason)));
            }
            _ => return Err(NodeError::Validation("unexpected message during prepare".into())),
        }

        if let Some(mut entry) = self.cross_shard.get_mut(id) {
            entry.status = CrossShardStatus::Committing;
        }
        // Commit phase: with ack already received, the commit itself
        // cannot fail locally (both sides are in-process); the interesting
        // failure mode is entirely the prepare-phase timeout exercised above.
        Ok(())
    }

    pub fn draw(&self, shard: u32, limit: usize) -> Vec<Transaction> {
        self.pools.get(&shard).map(|p| p.draw(shard, limit)).unwrap_or_default()
    }

    pub fn confirm(&self, shard: u32, tx_id: &str) -> Result<()> {
        self.pools
            .get_mut(&shard)
            .ok_or_else(|| NodeError::InvalidShard(format!("no pool for shard {}", shard)))?
            .confirm(tx_id)
    }

    pub fn cross_shard_status(&self, id: &str) -> Option<CrossShardStatus> {
        self.cross_shard.get(id).map(|e| e.status)
    }

    /// Pool utilization per shard: pending / capacity.
    pub fn pool_utilization(&self) -> HashMap<u32, f64> {
        self.pools
            .iter()
            .map(|entry| {
                let stats = entry.value().stats();
                let ratio = if stats.size == 0 { 0.0 } else { stats.pending as f64 / stats.size.max(1) as f64 };
                (*entry.key(), ratio)
            })
            .collect()
    }

    /// `successful_cross_shard / total_cross_shard` across all shards.
    pub fn cross_shard_success_ratio(&self) -> f64 {
        let (mut ok, mut total) = (0u64, 0u64);
        for entry in self.metrics.iter() {
            ok += entry.value().committed_cross_shard;
            total += entry.value().committed_cross_shard + entry.value().failed_cross_shard;
        }
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    /// Load-balance score: `1 - Gini` of per-shard committed transaction
    /// counts (perfectly even load scores 1.0).
    pub fn load_balance_score(&self) -> f64 {
        let mut counts: Vec<f64> = self.metrics.iter().map(|e| e.value().total_committed() as f64).collect();
        if counts.is_empty() || counts.iter().all(|c| *c == 0.0) {
            return 1.0;
        }
        counts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = counts.len() as f64;
        let sum: f64 = counts.iter().sum();
        let mut weighted_sum = 0.0;
        for (i, c) in counts.iter().enumerate() {
            weighted_sum += (i as f64 + 1.0) * c;
        }
        let gini = (2.0 * weighted_sum) / (n * sum) - (n + 1.0) / n;
        1.0 - gini.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn tx(sender: &str, receiver: &str) -> Transaction {
        Transaction::new(TransactionType::Transfer, sender.into(), receiver.into(), 10, 1, vec![], 0, 0).unwrap()
    }

    #[tokio::test]
    async fn routes_deterministically() {
        let manager = ShardManager::new(4, 100);
        let a = manager.route("alice_wallet_0x1a2b3c4d5e6f");
        let b = manager.route("alice_wallet_0x1a2b3c4d5e6f");
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[tokio::test]
    async fn same_shard_transaction_commits_without_2pc() {
        let manager = ShardManager::new(1, 100);
        let t = tx("alice", "bob");
        assert!(manager.submit(t).await.is_ok());
    }

    #[tokio::test]
    async fn cross_shard_transaction_commits_when_destination_responds() {
        let manager = ShardManager::new(4, 100);
        let t = tx("aaaaaaaaaaaa", "zzzzzzzzzzzz");
        let source = manager.route(&t.sender);
        let dest = manager.route(&t.receiver);
        if source == dest {
            return;
        }
        assert!(manager.submit(t).await.is_ok());
        assert_eq!(manager.cross_shard_success_ratio(), 1.0);
    }

    #[tokio::test]
    async fn cross_shard_transaction_aborts_when_destination_never_acks() {
        let manager = ShardManager::with_phase_timeout(4, 100, Duration::from_millis(50));
        let t = tx("aaaaaaaaaaaa", "zzzzzzzzzzzz");
        let source = manager.route(&t.sender);
        let dest = manager.route(&t.receiver);
        if source == dest {
            return;
        }
        manager.inject_unresponsive_destination(10).await;
        let result = manager.submit(t).await;
        assert!(result.is_err());
        assert_eq!(manager.cross_shard_success_ratio(), 0.0);
    }
}
