//! LSCC consensus engine (spec §4.10): Layered Sharding + Cross-Channel
//! Consensus, a four-phase hierarchical BFT variant unique to this node.
//!
//! `layer_depth` (L) layers each own a slice of shards; `channel_count` (C)
//! channels connect layers by a parity rule (`layer % 2 == channel % 2`).
//! A round runs four phases under the controller's lock: layer consensus,
//! cross-channel consensus, shard synchronization, and a weighted final
//! commitment. The three background maintenance duties this algorithm needs
//! while running (consensus maintenance, channel drain, health monitor) are
//! `tokio::spawn`ed by the chain controller, not by this engine; the methods
//! below are what those tasks call each tick.

use std::collections::{HashMap, VecDeque};
use chrono::Utc;
use log::{info, warn};
use crate::block::Block;
use crate::validator::Validator;
use crate::NodeError;
use super::{byzantine, ConsensusConfig, ConsensusEngine, ConsensusMetrics, ConsensusState, ProcessOutcome};

const COMMIT_THRESHOLD: f64 = 0.7;
const HEALTH_WINDOW_SECS: i64 = 30;
const HEALTH_RATIO: f64 = 0.6;
const MAX_DRAIN_PER_CHANNEL: usize = 5;
const CONGESTION_QUEUE_LEN: usize = 50;
const CHANNEL_INACTIVE_SECS: i64 = 60;
const LAYER_RECORD_TTL_SECS: i64 = 600;

fn ceil_div(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

fn quorum_for(n: usize) -> usize {
    (2 * n) / 3 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Active,
    Congested,
    Inactive,
}

pub struct LsccEngine {
    config: ConsensusConfig,
    state: ConsensusState,
    metrics: ConsensusMetrics,
    validators: Vec<Validator>,
    layer_last_activity: HashMap<usize, i64>,
    channel_last_activity: HashMap<usize, i64>,
    channel_queues: HashMap<usize, VecDeque<String>>,
    channel_status: HashMap<usize, ChannelStatus>,
}

impl LsccEngine {
    pub fn new(config: ConsensusConfig) -> Result<Self, NodeError> {
        if config.layer_depth == 0 {
            return Err(NodeError::ConfigConflict("lscc requires layer_depth >= 1".into()));
        }
        if config.channel_count == 0 {
            return Err(NodeError::ConfigConflict("lscc requires channel_count >= 1".into()));
        }
        Ok(LsccEngine {
            config,
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            layer_last_activity: HashMap::new(),
            channel_last_activity: HashMap::new(),
            channel_queues: HashMap::new(),
            channel_status: HashMap::new(),
        })
    }

    fn layer_members<'a>(&self, active: &[&'a Validator], layer: usize) -> Vec<&'a Validator> {
        active
            .iter()
            .enumerate()
            .filter(|(i, _)| i % self.config.layer_depth == layer)
            .map(|(_, v)| *v)
            .collect()
    }

    fn channel_members<'a>(&self, active: &[&'a Validator], channel: usize) -> Vec<&'a Validator> {
        let mut seen = std::collections::HashSet::new();
        let mut members = Vec::new();
        for layer in 0..self.config.layer_depth {
            if layer % self.config.channel_count != channel % self.config.channel_count {
                continue;
            }
            for v in self.layer_members(active, layer) {
                if seen.insert(v.address.clone()) {
                    members.push(v);
                }
            }
        }
        members
    }

    /// Phase 1: each layer votes independently; layer approved iff votes
    /// reach its own quorum `Q_l = floor(2|layer|/3)+1`.
    fn layer_consensus(&mut self, active: &[&Validator], block: &Block) -> HashMap<usize, bool> {
        let mut results = HashMap::new();
        let now = Utc::now().timestamp();
        for layer in 0..self.config.layer_depth {
            let members = self.layer_members(active, layer);
            if members.is_empty() {
                results.insert(layer, false);
                continue;
            }
            let threshold = if layer == 0 { 0.10 } else { 0.15 };
            let votes = members
                .iter()
                .filter(|v| {
                    let context = format!("layer{}:{}", layer, block.hash);
                    !byzantine::is_byzantine(self.config.byzantine_simulation, &v.address, &context, threshold)
                })
                .count();
            results.insert(layer, votes >= quorum_for(members.len()));
            self.layer_last_activity.insert(layer, now);
        }
        results
    }

    /// Phase 2: each channel votes carrying the layer_results snapshot;
    /// overall channel approval holds once `ceil((C+1)/2)` channels approve.
    fn channel_consensus(&mut self, active: &[&Validator], block: &Block) -> (HashMap<usize, bool>, bool) {
        let mut results = HashMap::new();
        let now = Utc::now().timestamp();
        for channel in 0..self.config.channel_count {
            let members = self.channel_members(active, channel);
            if members.is_empty() {
                results.insert(channel, false);
                continue;
            }
            let votes = members
                .iter()
                .filter(|v| {
                    let context = format!("channel{}:{}", channel, block.hash);
                    !byzantine::is_byzantine(self.config.byzantine_simulation, &v.address, &context, 0.12)
                })
                .count();
            results.insert(channel, votes >= quorum_for(members.len()));
            self.channel_last_activity.insert(channel, now);
            self.channel_queues
                .entry(channel)
                .or_default()
                .push_back(format!("vote:{}", block.hash));
        }
        let approved_count = results.values().filter(|v| **v).count();
        let overall = approved_count >= ceil_div(self.config.channel_count + 1, 2);
        (results, overall)
    }

    /// Phase 3: the layer owning the block's shard must itself be approved
    /// (shard-layer binding is a simple `shard_id % layer_depth`, since the
    /// shard manager's richer shard registry lives outside the engine).
    fn shard_sync_ok(&self, layer_results: &HashMap<usize, bool>, block: &Block) -> bool {
        let owning_layer = (block.shard_id as usize) % self.config.layer_depth;
        layer_results.get(&owning_layer).copied().unwrap_or(false)
    }

    /// ≥ 60% of layers and ≥ 60% of channels must have had activity in the
    /// last 30 seconds (spec §4.10).
    fn network_healthy(&self) -> bool {
        let now = Utc::now().timestamp();
        let fresh_layers = self
            .layer_last_activity
            .values()
            .filter(|&&t| now - t <= HEALTH_WINDOW_SECS)
            .count();
        let fresh_channels = self
            .channel_last_activity
            .values()
            .filter(|&&t| now - t <= HEALTH_WINDOW_SECS)
            .count();
        let layer_ok = self.config.layer_depth > 0
            && fresh_layers as f64 / self.config.layer_depth as f64 >= HEALTH_RATIO;
        let channel_ok = self.config.channel_count > 0
            && fresh_channels as f64 / self.config.channel_count as f64 >= HEALTH_RATIO;
        layer_ok && channel_ok
    }

    fn score(&self, layer_results: &HashMap<usize, bool>, channel_approved: bool, sync_ok: bool) -> f64 {
        let approved_layers = layer_results.values().filter(|v| **v).count();
        let layer_ratio = approved_layers as f64 / self.config.layer_depth.max(1) as f64;

        let mut score = 0.0;
        if layer_ratio > 0.5 {
            score += 0.4;
        }
        if channel_approved {
            score += 0.3;
        }
        if sync_ok {
            score += 0.2;
        }
        if self.network_healthy() {
            score += 0.1;
        }
        score
    }

    /// Consensus-maintenance background duty (1 s tick, spec §4.10): expire
    /// layer activity records older than 10 minutes.
    pub fn run_consensus_maintenance(&mut self) {
        let now = Utc::now().timestamp();
        self.layer_last_activity.retain(|_, t| now - *t <= LAYER_RECORD_TTL_SECS);
    }

    /// Channel-drain background duty (2 s tick, spec §4.10): dequeue up to
    /// 5 messages per channel, flag congestion/inactivity.
    pub fn drain_channels(&mut self) {
        let now = Utc::now().timestamp();
        for channel in 0..self.config.channel_count {
            let queue = self.channel_queues.entry(channel).or_default();
            for _ in 0..MAX_DRAIN_PER_CHANNEL {
                if queue.pop_front().is_none() {
                    break;
                }
            }
            let last_activity = self.channel_last_activity.get(&channel).copied().unwrap_or(0);
            let status = if queue.len() > CONGESTION_QUEUE_LEN {
                ChannelStatus::Congested
            } else if now - last_activity > CHANNEL_INACTIVE_SECS {
                ChannelStatus::Inactive
            } else {
                ChannelStatus::Active
            };
            self.channel_status.insert(channel, status);
        }
    }

    /// Health-monitor background duty (5 s tick, spec §4.10): per-layer
    /// activity ratio, for a caller to warn below 0.5.
    pub fn health_snapshot(&self) -> f64 {
        if self.config.layer_depth == 0 {
            return 0.0;
        }
        let now = Utc::now().timestamp();
        let fresh = self
            .layer_last_activity
            .values()
            .filter(|&&t| now - t <= HEALTH_WINDOW_SECS)
            .count();
        fresh as f64 / self.config.layer_depth as f64
    }
}

impl ConsensusEngine for LsccEngine {
    fn process_block(&mut self, block: &Block, validators: &[Validator]) -> ProcessOutcome {
        self.metrics.rounds_attempted += 1;
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            self.metrics.rounds_failed += 1;
            return ProcessOutcome::failed(NodeError::Validation("no active validators for lscc round".into()));
        }

        let layer_results = self.layer_consensus(&active, block);
        self.state = ConsensusState::LayerConsensus { round: block.index, layer_results: layer_results.iter().map(|(k, v)| (*k, *v)).collect() };

        let (_channel_results, channel_approved) = self.channel_consensus(&active, block);
        let sync_ok = self.shard_sync_ok(&layer_results, block);
        let score = self.score(&layer_results, channel_approved, sync_ok);

        self.state = ConsensusState::Idle;
        if score < COMMIT_THRESHOLD {
            self.metrics.rounds_failed += 1;
            warn!("lscc: block {} scored {:.2}, below threshold {:.2}", block.index, score, COMMIT_THRESHOLD);
            return ProcessOutcome::failed(NodeError::Validation(format!(
                "lscc commitment score {:.2} below threshold {:.2}",
                score, COMMIT_THRESHOLD
            )));
        }

        self.metrics.rounds_committed += 1;
        info!("lscc: block {} committed with score {:.2}", block.index, score);
        ProcessOutcome::committed()
    }

    fn validate_block(&self, block: &Block, validators: &[Validator]) -> Result<(), NodeError> {
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            return Err(NodeError::Validation("no active validators for lscc round".into()));
        }
        let mut scratch = LsccEngine {
            config: self.config.clone(),
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            layer_last_activity: self.layer_last_activity.clone(),
            channel_last_activity: self.channel_last_activity.clone(),
            channel_queues: HashMap::new(),
            channel_status: HashMap::new(),
        };
        let layer_results = scratch.layer_consensus(&active, block);
        let (_channels, channel_approved) = scratch.channel_consensus(&active, block);
        let sync_ok = scratch.shard_sync_ok(&layer_results, block);
        let score = scratch.score(&layer_results, channel_approved, sync_ok);
        if score < COMMIT_THRESHOLD {
            return Err(NodeError::Validation(format!(
                "lscc commitment score {:.2} below threshold {:.2}",
                score, COMMIT_THRESHOLD
            )));
        }
        Ok(())
    }

    /// Proposer is drawn round-robin from the active set keyed on the round
    /// number; layer/channel votes, not proposer identity, carry LSCC's
    /// Byzantine tolerance.
    fn select_validator(&self, validators: &[Validator], round: u64) -> Option<Validator> {
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            return None;
        }
        Some(active[(round as usize) % active.len()].clone())
    }

    fn state(&self) -> ConsensusState {
        self.state.clone()
    }

    fn update_validators(&mut self, validators: Vec<Validator>) {
        self.validators = validators;
    }

    fn name(&self) -> &'static str {
        "lscc"
    }

    fn metrics(&self) -> ConsensusMetrics {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.state = ConsensusState::Idle;
        self.layer_last_activity.clear();
        self.channel_last_activity.clear();
        self.channel_queues.clear();
        self.channel_status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DEFAULT_GAS_LIMIT;
    use crate::transaction::{Transaction, TransactionType};

    fn validators(n: usize) -> Vec<Validator> {
        (0..n)
            .map(|i| Validator::new(format!("v{}", i), format!("pk{}", i), 100, 0))
            .collect()
    }

    fn block_for(index: u64, shard_id: u32) -> Block {
        let tx = Transaction::new(TransactionType::Transfer, "a".into(), "b".into(), 1, 1, vec![], index, 0).unwrap();
        Block::create(index, Block::genesis().hash, vec![tx], "v0".into(), shard_id, 0, DEFAULT_GAS_LIMIT, false).unwrap()
    }

    #[test]
    fn rejects_config_with_zero_layer_depth() {
        let config = ConsensusConfig { layer_depth: 0, ..Default::default() };
        assert!(LsccEngine::new(config).is_err());
    }

    #[test]
    fn commits_with_a_healthy_honest_nine_validator_set() {
        let config = ConsensusConfig { layer_depth: 3, channel_count: 2, ..Default::default() };
        let mut engine = LsccEngine::new(config).unwrap();
        let vs = validators(9);
        let block = block_for(1, 0);
        let outcome = engine.process_block(&block, &vs);
        assert!(outcome.committed);
    }

    #[test]
    fn fails_cleanly_with_no_active_validators() {
        let mut engine = LsccEngine::new(ConsensusConfig::default()).unwrap();
        let block = block_for(1, 0);
        let outcome = engine.process_block(&block, &[]);
        assert!(!outcome.committed);
    }

    #[test]
    fn drain_channels_marks_congestion_above_threshold() {
        let config = ConsensusConfig { layer_depth: 3, channel_count: 2, ..Default::default() };
        let mut engine = LsccEngine::new(config).unwrap();
        for i in 0..60 {
            engine.channel_queues.entry(0).or_default().push_back(format!("msg{}", i));
        }
        engine.channel_last_activity.insert(0, Utc::now().timestamp());
        engine.drain_channels();
        assert_eq!(engine.channel_status.get(&0), Some(&ChannelStatus::Congested));
    }
}
