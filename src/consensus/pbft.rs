//! PBFT consensus engine (spec §4.8): three-phase pre-prepare / prepare /
//! commit with view changes on quorum shortfall.
//!
//! There is no network transport in this crate (spec's Non-goals exclude
//! P2P); the vote-collection phases are simulated locally by asking each
//! active validator whether it would prepare/commit, per the Byzantine
//! predicate in [`super::byzantine`]. With `byzantine_simulation` off every
//! validator votes honestly and the simulated phases always succeed whenever
//! count-based quorum is structurally reachable.

use std::collections::BTreeMap;
use log::{info, warn};
use crate::block::Block;
use crate::validator::Validator;
use crate::NodeError;
use super::{byzantine, quorum, ConsensusConfig, ConsensusEngine, ConsensusMetrics, ConsensusState, ProcessOutcome};

pub struct PbftEngine {
    config: ConsensusConfig,
    state: ConsensusState,
    metrics: ConsensusMetrics,
    validators: Vec<Validator>,
    view: u64,
}

impl PbftEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        PbftEngine {
            config,
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            view: 0,
        }
    }

    fn primary<'a>(&self, validators: &'a [Validator]) -> Option<&'a Validator> {
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            return None;
        }
        Some(active[(self.view as usize) % active.len()])
    }

    /// Collect votes for `phase` (e.g. "prepare" or "commit") over
    /// `block.hash`, returning the validator-address -> vote-digest map of
    /// everyone who voted honestly.
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
}

impl ConsensusEngine for PbftEngine {
    fn process_block(&mut self, block: &Block, validators: &[Validator]) -> ProcessOutcome {
        self.metrics.rounds_attempted += 1;
        let n = validators.iter().filter(|v| v.is_active()).count();
        let need = quorum(n);

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
        if prepares.len() < need {
            return self.fail_to_view_change(need, prepares.len());
        }

        let commits = self.collect_votes(validators, block, "commit");
        self.state = ConsensusState::Commit { view: self.view, round: block.index, commits: commits.clone() };
        if commits.len() < need {
            return self.fail_to_view_change(need, commits.len());
        }

        self.state = ConsensusState::Idle;
        self.metrics.rounds_committed += 1;
        info!("pbft: block {} committed in view {} with {}/{} commits", block.index, self.view, commits.len(), n);
        ProcessOutcome::committed()
    }

    fn validate_block(&self, block: &Block, validators: &[Validator]) -> Result<(), NodeError> {
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
        "pbft"
    }

    fn metrics(&self) -> ConsensusMetrics {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.view = 0;
        self.state = ConsensusState::Idle;
    }
}

impl PbftEngine {
    fn fail_to_view_change(&mut self, need: usize, have: usize) -> ProcessOutcome {
        self.metrics.rounds_failed += 1;
        self.metrics.view_changes += 1;
        self.view += 1;
        warn!("pbft: quorum shortfall ({}/{}), advancing to view {}", have, need, self.view);
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
    fn commits_with_all_honest_validators() {
        let mut engine = PbftEngine::new(ConsensusConfig::default());
        let vs = validators(4);
        let block = block_for("v0", 1);
        let outcome = engine.process_block(&block, &vs);
        assert!(outcome.committed);
    }

    #[test]
    fn rejects_block_from_non_primary() {
        let mut engine = PbftEngine::new(ConsensusConfig::default());
        let vs = validators(4);
        let block = block_for("v2", 1);
        let outcome = engine.process_block(&block, &vs);
        assert!(!outcome.committed);
    }

    #[test]
    fn byzantine_simulation_can_trigger_view_change() {
        let config = ConsensusConfig { byzantine_simulation: true, ..Default::default() };
        let mut engine = PbftEngine::new(config);
        let vs = validators(4);
        let block = block_for("v0", 1);
        let before = engine.metrics().view_changes;
        let _ = engine.process_block(&block, &vs);
        assert!(engine.metrics().view_changes >= before);
    }
}
