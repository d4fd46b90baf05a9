//! Chain controller (spec §4.11): round loop, genesis, append, algorithm
//! switch, and the single exclusive lock guarding chain-level state.
//!
//! Grounded on the teacher's `blockchain.rs` round/mining/append logic,
//! stripped of the contract/wallet/state-channel concerns that module also
//! carried. The controller owns the shard manager, active consensus
//! algorithm, validator set, and latest block behind one
//! `tokio::sync::RwLock` (spec §5): round-producing operations take the
//! write side, status queries take the read side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::block::Block;
use crate::config::NodeConfig;
use crate::consensus::{ConsensusAlgorithm, ConsensusMetrics};
use crate::convergence::{ConvergenceSnapshot, ConvergenceTracker};
use crate::network::PeerTransport;
use crate::sharding::ShardManager;
use crate::storage::Storage;
use crate::transaction::{Transaction, TransactionType};
use crate::validator::Validator;
use crate::{NodeError, Result};

const DRAW_LIMIT_PER_SHARD: usize = 500;

/// Outcome of one shard's round-producing attempt within a tick.
#[derive(Debug, Clone)]
pub enum RoundResult {
    Committed { shard_id: u32, index: u64, hash: String, tx_count: usize },
    Failed { shard_id: u32, error: NodeError },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub algorithm: String,
    pub block_height: u64,
    pub latest_hash: String,
    pub total_tx_count: u64,
    pub running: bool,
    pub validator_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub consensus: ConsensusMetrics,
    pub convergence: ConvergenceSnapshot,
    pub cross_shard_success_ratio: f64,
    pub load_balance_score: f64,
}

/// Chain-level state guarded by one exclusive lock (spec §5): `latest_block`,
/// `block_height`, `total_tx_count`, `validators`, `active_consensus`.
struct ChainState {
    latest_block: Block,
    block_height: u64,
    total_tx_count: u64,
    validators: Vec<Validator>,
    algorithm: ConsensusAlgorithm,
}

pub struct ChainController {
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    shard_manager: Arc<ShardManager>,
    transport: Arc<dyn PeerTransport>,
    state: RwLock<ChainState>,
    convergence: Mutex<ConvergenceTracker>,
    running: AtomicBool,
    /// Shutdown signal for LSCC's background duties (§4.10, §5): `run_loop`
    /// spawns its listeners only when LSCC is active, and `request_shutdown`
    /// broadcasts on this so they drain instead of being aborted mid-tick.
    shutdown_tx: broadcast::Sender<()>,
}

impl ChainController {
    /// Construct a controller, seeding chain state from storage if present
    /// or writing a fresh genesis block otherwise (§4.3 `genesis`).
    pub fn new(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let algorithm = ConsensusAlgorithm::new(config.algorithm.as_str(), config.consensus.clone())?;
        let shard_manager = Arc::new(ShardManager::new(config.sharding.num_shards, config.sharding.shard_size));

        let latest_block = match storage.get_latest_block()? {
            Some(block) => block,
            None => {
                let genesis = Block::genesis();
                storage.save_block(&genesis)?;
                genesis
            }
        };
        let block_height = latest_block.index;

        Ok(ChainController {
            config,
            storage,
            shard_manager,
            transport,
            state: RwLock::new(ChainState {
                latest_block,
                block_height,
                total_tx_count: 0,
                validators: Vec::new(),
                algorithm,
            }),
            convergence: Mutex::new(ConvergenceTracker::new()),
            running: AtomicBool::new(false),
            shutdown_tx: broadcast::channel(8).0,
        })
    }

    pub fn shard_manager(&self) -> &Arc<ShardManager> {
        &self.shard_manager
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Submission surface (§6): `Ok | PoolFull | Duplicate | InvalidShard`.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        tx.validate()?;
        self.shard_manager.submit(tx).await
    }

    pub async fn update_validators(&self, validators: Vec<Validator>) {
        let mut state = self.state.write().await;
        state.algorithm.update_validators(validators.clone());
        state.validators = validators;
    }

    /// Algorithm switch (§4.11): only permitted while not running; on
    /// construction failure the previous algorithm is restored.
    pub async fn switch_consensus(&self, name: &str) -> Result<()> {
        if self.is_running() {
            return Err(NodeError::ConfigConflict(
                "cannot switch consensus algorithm while the controller is running".into(),
            ));
        }
        let mut state = self.state.write().await;
        match ConsensusAlgorithm::new(name, self.config.consensus.clone()) {
            Ok(mut algorithm) => {
                algorithm.update_validators(state.validators.clone());
                state.algorithm = algorithm;
                info!("switched consensus algorithm to {}", name);
                Ok(())
            }
            Err(e) => {
                warn!("algorithm switch to {} failed, keeping {}: {}", name, state.algorithm.name(), e);
                Err(e)
            }
        }
    }

    pub async fn node_status(&self) -> NodeStatus {
        let state = self.state.read().await;
        NodeStatus {
            node_id: self.config.node.id.clone(),
            algorithm: state.algorithm.name().to_string(),
            block_height: state.block_height,
            latest_hash: state.latest_block.hash.clone(),
            total_tx_count: state.total_tx_count,
            running: self.is_running(),
            validator_count: state.validators.len(),
        }
    }

    pub async fn current_metrics(&self) -> NodeMetrics {
        let state = self.state.read().await;
        let convergence = self.convergence.lock().await.snapshot(state.algorithm.name());
        NodeMetrics {
            consensus: state.algorithm.metrics(),
            convergence,
            cross_shard_success_ratio: self.shard_manager.cross_shard_success_ratio(),
            load_balance_score: self.shard_manager.load_balance_score(),
        }
    }

    pub fn get_block(&self, hash: &str) -> Result<Option<Block>> {
        Ok(self.storage.get_block_by_hash(hash)?)
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        Ok(self.storage.get_transaction(id)?)
    }

    /// One round-producing attempt across every shard with pending work
    /// (spec §4.11). A shard with an empty draw is skipped; shards with
    /// work each get their own candidate block on the shared chain height.
    pub async fn run_round(&self) -> Result<Vec<RoundResult>> {
        let mut results = Vec::new();
        for shard_id in 0..self.shard_manager.num_shards() {
            let txs = self.shard_manager.draw(shard_id, DRAW_LIMIT_PER_SHARD);
            if txs.is_empty() {
                continue;
            }
            results.push(self.process_shard_round(shard_id, txs).await);
        }
        Ok(results)
    }

    async fn process_shard_round(&self, shard_id: u32, mut txs: Vec<Transaction>) -> RoundResult {
        let mut state = self.state.write().await;
        let next_index = state.block_height + 1;

        let proposer = state
            .algorithm
            .select_validator(&state.validators, next_index)
            .map(|v| v.address)
            .unwrap_or_else(|| "proposer-unknown".to_string());

        let reward = crate::block::block_subsidy(next_index);
        let coinbase = Transaction::new_coinbase(proposer.clone(), reward, next_index, shard_id);
        txs.insert(0, coinbase);

        let is_pow = state.algorithm.is_pow();
        let candidate = Block::create(
            next_index,
            state.latest_block.hash.clone(),
            txs,
            proposer.clone(),
            shard_id,
            self.config.consensus.difficulty,
            self.config.consensus.gas_limit,
            is_pow,
        );

        let mut candidate = match candidate {
            Ok(b) => b,
            Err(e) => {
                self.convergence.lock().await.record(state.algorithm.name(), false, state.block_height, 0);
                return RoundResult::Failed { shard_id, error: e };
            }
        };

        if is_pow {
            if let Err(e) = candidate.mine(self.config.consensus.difficulty) {
                self.convergence.lock().await.record(state.algorithm.name(), false, state.block_height, 0);
                return RoundResult::Failed { shard_id, error: e };
            }
        }

        let outcome = state.algorithm.process_block(&candidate, &state.validators);
        if !outcome.committed {
            let view_changes = state.algorithm.metrics().view_changes;
            let algo_name = state.algorithm.name().to_string();
            let height = state.block_height;
            drop(state);
            self.convergence.lock().await.record(&algo_name, false, height, view_changes);
            return RoundResult::Failed {
                shard_id,
                error: outcome.error.unwrap_or_else(|| NodeError::Validation("consensus rejected block".into())),
            };
        }

        if let Err(e) = candidate.validate(&state.latest_block, is_pow, self.config.sharding.num_shards) {
            self.convergence.lock().await.record(state.algorithm.name(), false, state.block_height, 0);
            return RoundResult::Failed { shard_id, error: e };
        }

        if let Err(e) = self.append_locked(&mut state, candidate.clone()).await {
            return RoundResult::Failed { shard_id, error: e };
        }

        let view_changes = state.algorithm.metrics().view_changes;
        let algo_name = state.algorithm.name().to_string();
        let height = state.block_height;
        drop(state);
        self.convergence.lock().await.record(&algo_name, true, height, view_changes);
        self.transport.broadcast(crate::network::PeerMessage::NewBlock(candidate.clone())).await;

        RoundResult::Committed {
            shard_id,
            index: candidate.index,
            hash: candidate.hash.clone(),
            tx_count: candidate.transaction_count(),
        }
    }

    /// Persist `block`, mark its non-coinbase transactions confirmed, and
    /// advance `latest_block`/`block_height`/`total_tx_count`. Storage
    /// durability happens before any in-memory state advances (§6, §7).
    async fn append_locked(&self, state: &mut ChainState, block: Block) -> Result<()> {
        self.storage.save_block(&block)?;

        for tx in &block.transactions {
            if tx.transaction_type == TransactionType::Coinbase {
                continue;
            }
            let _ = self.shard_manager.confirm(block.shard_id, &tx.id);
        }

        state.total_tx_count += block.transactions.len() as u64;
        state.block_height = block.index;
        state.latest_block = block;
        Ok(())
    }

    /// Append an externally-sourced block (e.g. from peer sync), validating
    /// it against `latest_block` before persisting (§4.11 `append`).
    pub async fn append(&self, block: Block) -> Result<()> {
        let mut state = self.state.write().await;
        let is_pow = state.algorithm.is_pow();
        block.validate(&state.latest_block, is_pow, self.config.sharding.num_shards)?;
        state.algorithm.validate_block(&block, &state.validators)?;
        self.append_locked(&mut state, block).await
    }

    /// Spawn LSCC's three background duties (§4.10) when LSCC is the active
    /// algorithm; a no-op list otherwise. Each task ticks on its own timer,
    /// takes the controller's lock only for the duration of its own engine
    /// call (never across a suspension point, per §5), and exits as soon as
    /// `shutdown_tx` fires rather than being aborted mid-tick.
    fn spawn_lscc_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let maintenance = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        maintenance.state.write().await.algorithm.lscc_run_consensus_maintenance();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));

        let drain = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        drain.state.write().await.algorithm.lscc_drain_channels();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));

        let health = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ratio = health.state.read().await.algorithm.lscc_health_snapshot();
                        if let Some(ratio) = ratio {
                            if ratio < 0.5 {
                                warn!("lscc network health degraded: layer activity ratio {:.2}", ratio);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));

        handles
    }

    /// Run the round loop until `request_shutdown` is called: ticks every
    /// `block_time` seconds, draining and committing available work. Meant
    /// to be driven by `tokio::spawn`; callers that only want one tick
    /// should call [`Self::run_round`] directly instead.
    pub async fn run_loop(self: Arc<Self>) {
        self.set_running(true);

        let lscc_active = self.state.read().await.algorithm.name() == "lscc";
        let background = if lscc_active {
            self.spawn_lscc_background_tasks()
        } else {
            Vec::new()
        };

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.consensus.block_time_secs.max(1)));
        let mut backoff = Duration::from_secs(1);
        loop {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }
            match self.run_round().await {
                Ok(results) => {
                    backoff = Duration::from_secs(1);
                    for r in results {
                        match r {
                            RoundResult::Committed { shard_id, index, hash, tx_count } => {
                                info!("shard {} committed block {} ({} txs, hash {})", shard_id, index, tx_count, hash);
                            }
                            RoundResult::Failed { shard_id, error } => {
                                warn!("shard {} round failed: {}", shard_id, error);
                            }
                        }
                    }
                }
                Err(NodeError::Storage(msg)) => {
                    warn!("storage error, backing off {:?}: {}", backoff, msg);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    warn!("round loop error: {}", e);
                }
            }
        }

        for handle in background {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("lscc background task did not drain within 5s of shutdown");
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.set_running(false);
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InMemoryTransport;
    use crate::storage::SledStorage;
    use crate::transaction::TransactionType;

    fn controller(algorithm: &str) -> ChainController {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
        let transport: Arc<dyn PeerTransport> = Arc::new(InMemoryTransport::new("node-0".into()));
        let mut config = NodeConfig::default();
        config.algorithm = match algorithm {
            "pow" => crate::config::AlgorithmName::Pow,
            "pos" => crate::config::AlgorithmName::Pos,
            "pbft" => crate::config::AlgorithmName::Pbft,
            "lscc" => crate::config::AlgorithmName::Lscc,
            _ => unreachable!(),
        };
        config.consensus.difficulty = 1;
        ChainController::new(config, storage, transport).unwrap()
    }

    #[tokio::test]
    async fn genesis_plus_single_pow_block_commits() {
        let chain = controller("pow");
        let tx = Transaction::new(TransactionType::Transfer, "alice".into(), "bob".into(), 10, 1, vec![], 0, 0).unwrap();
        chain.submit_transaction(tx).await.unwrap();

        let results = chain.run_round().await.unwrap();
        assert!(results.iter().any(|r| matches!(r, RoundResult::Committed { index: 1, .. })));
        assert_eq!(chain.node_status().await.block_height, 1);
    }

    #[tokio::test]
    async fn empty_round_is_skipped_without_error() {
        let chain = controller("pow");
        let results = chain.run_round().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(chain.node_status().await.block_height, 0);
    }

    #[tokio::test]
    async fn switch_consensus_rejected_while_running() {
        let chain = controller("pow");
        chain.set_running(true);
        assert!(chain.switch_consensus("pos").await.is_err());
    }

    #[tokio::test]
    async fn switch_consensus_to_unknown_algorithm_restores_previous() {
        let chain = controller("pow");
        assert!(chain.switch_consensus("nonexistent").await.is_err());
        assert_eq!(chain.node_status().await.algorithm, "pow");
    }

    #[tokio::test]
    async fn pbft_round_commits_with_quorum_of_validators() {
        let chain = controller("pbft");
        let validators = vec![
            Validator::new("v0".into(), "pk0".into(), 100, 0),
            Validator::new("v1".into(), "pk1".into(), 100, 0),
            Validator::new("v2".into(), "pk2".into(), 100, 0),
            Validator::new("v3".into(), "pk3".into(), 100, 0),
        ];
        chain.update_validators(validators).await;
        let tx = Transaction::new(TransactionType::Transfer, "alice".into(), "bob".into(), 10, 1, vec![], 0, 0).unwrap();
        chain.submit_transaction(tx).await.unwrap();

        let results = chain.run_round().await.unwrap();
        assert!(results.iter().any(|r| matches!(r, RoundResult::Committed { .. })));
    }

    #[tokio::test]
    async fn lscc_background_tasks_drain_within_shutdown_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
        let transport: Arc<dyn PeerTransport> = Arc::new(InMemoryTransport::new("node-0".into()));
        let mut config = NodeConfig::default();
        config.algorithm = crate::config::AlgorithmName::Lscc;
        config.consensus.block_time_secs = 1;
        let chain = Arc::new(ChainController::new(config, storage, transport).unwrap());

        let handle = tokio::spawn(Arc::clone(&chain).run_loop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.request_shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
