//! PPBFT consensus engine (spec §4.9): Practical PBFT extended with
//! checkpointing, a sliding watermark window, early-vote termination of the
//! prepare phase, a fast-path commit flag for high-stake-validator
//! consensus, and periodic garbage collection of old checkpoints.
//!
//! Early-vote termination and fast-path commit are distinct: early-vote
//! only shortens how long the prepare phase waits for votes once
//! `ceil(3Q/4)` are in; it never skips the commit phase or its safety
//! quorum `Q`. Fast-path is a flag recorded when the committing set
//! includes at least 2/3 of above-mean-stake validators, informational,
//! not a substitute for `Q`.

use std::collections::BTreeMap;
use log::{debug, info, warn};
use crate::block::Block;
use crate::validator::Validator;
use crate::NodeError;
use super::{byzantine, quorum, ConsensusConfig, ConsensusEngine, ConsensusMetrics, ConsensusState, ProcessOutcome};

/// How many past checkpoints to retain once garbage collection runs
/// (spec §4.9 edge case: unbounded checkpoint retention is a slow leak).
const RETAINED_CHECKPOINTS: usize = 2;

pub struct PpbftEngine {
    config: ConsensusConfig,
    state: ConsensusState,
    metrics: ConsensusMetrics,
    validators: Vec<Validator>,
    view: u64,
    low_watermark: u64,
    high_watermark: u64,
    checkpoints: BTreeMap<u64, String>,
}

impl PpbftEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        let high_watermark = config.window_size;
        PpbftEngine {
            config,
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            view: 0,
            low_watermark: 0,
            high_watermark,
            checkpoints: BTreeMap::new(),
        }
    }

    fn primary<'a>(&self, validators: &'a [Validator]) -> Option<&'a Validator> {
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            return None;
        }
        Some(active[(self.view as usize) % active.len()])
    }

    fn collect_votes(&self, validators: &[Validator], block: &Block, phase: &str) -> BTreeMap<String, String> {
        let mut votes = BTreeMap::new();
        for v in validators.iter().filter(|v| v.is_active()) {
            let context = format!("{}:{}", phase, block.hash);
            if !byzantine::is_byzantine(self.config.byzantine_simulation, &v.address, &context, 0.2) {
                votes.insert(v.address.clone(), block.hash.clone());
            }
        }
        votes
    }

    /// Fast-path check (spec §4.9): among active validators, the
    /// "high-stake" set is everyone above the mean stake. Fast path holds
    /// when at least 2/3 of that set's addresses appear in `committers`.
    /// Safety quorum is enforced by the caller regardless of this flag.
    fn is_fast_path(&self, active: &[&Validator], committers: &BTreeMap<String, String>) -> bool {
        if active.is_empty() {
            return false;
        }
        let mean_stake = active.iter().map(|v| v.stake as f64).sum::<f64>() / active.len() as f64;
        let high_stake: Vec<&&Validator> = active.iter().filter(|v| v.stake as f64 > mean_stake).collect();
        if high_stake.is_empty() {
            return false;
        }
        let voted = high_stake.iter().filter(|v| committers.contains_key(&v.address)).count();
        voted * 3 >= high_stake.len() * 2
    }

    /// Record a checkpoint for `index` and slide the watermark window
    /// forward, discarding checkpoints older than [`RETAINED_CHECKPOINTS`]
    /// intervals behind the new low watermark.
    fn maybe_checkpoint(&mut self, block: &Block) {
        if self.config.checkpoint_interval == 0 || block.index % self.config.checkpoint_interval != 0 {
            return;
        }
        self.checkpoints.insert(block.index, block.hash.clone());
        self.low_watermark = block.index;
        self.high_watermark = self.low_watermark + self.config.window_size;

        let floor = self
            .low_watermark
            .saturating_sub(self.config.checkpoint_interval * RETAINED_CHECKPOINTS as u64);
        let before = self.checkpoints.len();
        self.checkpoints.retain(|&idx, _| idx >= floor);
        if self.checkpoints.len() != before {
            debug!("ppbft: garbage collected checkpoints below index {}", floor);
        }
        info!("ppbft: checkpoint at {}, window now [{}, {}]", block.index, self.low_watermark, self.high_watermark);
    }
}

impl ConsensusEngine for PpbftEngine {
    fn process_block(&mut self, block: &Block, validators: &[Validator]) -> ProcessOutcome {
        self.metrics.rounds_attempted += 1;

        if block.index < self.low_watermark || block.index > self.high_watermark {
            self.metrics.rounds_failed += 1;
            return ProcessOutcome::failed(NodeError::OutsideWindow {
                index: block.index,
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }

        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        let n = active.len();
        let need = quorum(n);
        let early_threshold = (3 * need + 3) / 4;

        let Some(primary) = self.primary(validators) else {
            self.metrics.rounds_failed += 1;
            return ProcessOutcome::failed(NodeError::Validation("no active validators for primary selection".into()));
        };
        if primary.address != block.proposer {
            self.metrics.rounds_failed += 1;
            return ProcessOutcome::failed(NodeError::Validation(format!(
                "block proposer {} is not the view-{} primary {}",
                block.proposer, self.view, primary.address
            )));
        }

        let prepares = self.collect_votes(validators, block, "prepare");
        self.state = ConsensusState::Prepare { view: self.view, round: block.index, prepares: prepares.clone() };

        // Early-vote termination (§4.9): once >= ceil(3Q/4) prepares are in,
        // the phase may advance without waiting on stragglers. This only
        // shortens how long the prepare phase waits; the commit phase and
        // its safety quorum below are never skipped.
        if prepares.len() >= early_threshold {
            debug!("ppbft: early-vote termination for block {} with {}/{} prepares", block.index, prepares.len(), n);
        } else if prepares.len() < need {
            return self.fail_to_view_change(need, prepares.len());
        }

        let commits = self.collect_votes(validators, block, "commit");
        self.state = ConsensusState::Commit { view: self.view, round: block.index, commits: commits.clone() };
        if commits.len() < need {
            return self.fail_to_view_change(need, commits.len());
        }

        let fast_path = self.is_fast_path(&active, &commits);
        if fast_path {
            self.metrics.fast_path_commits += 1;
            info!("ppbft: block {} fast-path committed ({}/{} commits, quorum {})", block.index, commits.len(), n, need);
        }

        self.maybe_checkpoint(block);
        self.metrics.rounds_committed += 1;
        self.state = ConsensusState::Idle;
        ProcessOutcome::committed()
    }

    fn validate_block(&self, block: &Block, validators: &[Validator]) -> Result<(), NodeError> {
        if block.index < self.low_watermark || block.index > self.high_watermark {
            return Err(NodeError::OutsideWindow {
                index: block.index,
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        match self.primary(validators) {
            Some(primary) if primary.address == block.proposer => Ok(()),
            Some(primary) => Err(NodeError::Validation(format!(
                "expected primary {}, found proposer {}",
                primary.address, block.proposer
            ))),
            None => Err(NodeError::Validation("no active validators for primary selection".into())),
        }
    }

    fn select_validator(&self, validators: &[Validator], _round: u64) -> Option<Validator> {
        self.primary(validators).cloned()
    }

    fn state(&self) -> ConsensusState {
        self.state.clone()
    }

    fn update_validators(&mut self, validators: Vec<Validator>) {
        self.validators = validators;
    }

    fn name(&self) -> &'static str {
        "ppbft"
    }

    fn metrics(&self) -> ConsensusMetrics {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.view = 0;
        self.state = ConsensusState::Idle;
        self.low_watermark = 0;
        self.high_watermark = self.config.window_size;
        self.checkpoints.clear();
    }
}

impl PpbftEngine {
    fn fail_to_view_change(&mut self, need: usize, have: usize) -> ProcessOutcome {
        self.metrics.rounds_failed += 1;
        self.metrics.view_changes += 1;
        self.view += 1;
        warn!("ppbft: quorum shortfall ({}/{}), advancing to view {}", have, need, self.view);
        self.state = ConsensusState::ViewChange { view: self.view };
        ProcessOutcome::failed(NodeError::QuorumShortfall { have, need })
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

    fn block_for(proposer: &str, index: u64) -> Block {
        let tx = Transaction::new(TransactionType::Transfer, "a".into(), "b".into(), 1, 1, vec![], index, 0).unwrap();
        Block::create(index, Block::genesis().hash, vec![tx], proposer.into(), 0, 0, DEFAULT_GAS_LIMIT, false).unwrap()
    }

    #[test]
    fn commits_with_all_honest_validators_and_records_fast_path() {
        let mut engine = PpbftEngine::new(ConsensusConfig::default());
        let vs = validators(4);
        let block = block_for("v0", 1);
        let outcome = engine.process_block(&block, &vs);
        assert!(outcome.committed);
        assert_eq!(engine.metrics().fast_path_commits, 0); // uniform stake, no high-stake subset
    }

    #[test]
    fn fast_path_flag_set_when_high_stake_validators_all_commit() {
        let mut engine = PpbftEngine::new(ConsensusConfig::default());
        let mut vs = validators(4);
        vs[0].stake = 1000;
        vs[0].voting_power = 1000;
        let block = block_for("v0", 1);
        let outcome = engine.process_block(&block, &vs);
        assert!(outcome.committed);
        assert_eq!(engine.metrics().fast_path_commits, 1);
    }

    #[test]
    fn rejects_block_outside_watermark_window() {
        let config = ConsensusConfig { window_size: 5, ..Default::default() };
        let mut engine = PpbftEngine::new(config);
        let vs = validators(4);
        let block = block_for("v0", 100);
        let outcome = engine.process_block(&block, &vs);
        assert!(matches!(outcome.error, Some(NodeError::OutsideWindow { .. })));
    }

    #[test]
    fn checkpoint_slides_watermark_window_forward() {
        let config = ConsensusConfig { checkpoint_interval: 1, window_size: 5, ..Default::default() };
        let mut engine = PpbftEngine::new(config);
        let vs = validators(4);
        let block = block_for("v0", 1);
        engine.process_block(&block, &vs);
        assert_eq!(engine.low_watermark, 1);
        assert_eq!(engine.high_watermark, 6);
    }
}
