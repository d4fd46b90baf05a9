//! Proof-of-Stake consensus engine (spec §4.7).
//!
//! Validator selection is a deterministic, stake-weighted draw seeded from
//! the round number and the hash of the previous committed block, so every
//! honest node recomputes the same proposer without a voting round.

use log::info;
use crate::block::Block;
use crate::validator::Validator;
use crate::{primitives, NodeError};
use super::{ConsensusConfig, ConsensusEngine, ConsensusMetrics, ConsensusState, ProcessOutcome};

/// Minimum stake to be eligible for selection (spec §4.7 edge case: a
/// validator below this floor is skipped even if otherwise active).
const MIN_STAKE: u64 = 1;

pub struct ProofOfStakeEngine {
    config: ConsensusConfig,
    state: ConsensusState,
    metrics: ConsensusMetrics,
    validators: Vec<Validator>,
    last_seed_hash: String,
}

impl ProofOfStakeEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        ProofOfStakeEngine {
            config,
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            last_seed_hash: "genesis".to_string(),
        }
    }

    /// Draw a proposer from `eligible`, weighted by stake, using a seed
    /// derived from `round` and the hash of the last committed block.
    fn weighted_pick<'a>(&self, eligible: &'a [&'a Validator], round: u64) -> Option<&'a Validator> {
        if eligible.is_empty() {
            return None;
        }
        let total_stake: u64 = eligible.iter().map(|v| v.stake).sum();
        if total_stake == 0 {
            return None;
        }
        let seed_digest = primitives::calculate_hash(format!("{}:{}", round, self.last_seed_hash).as_bytes());
        let seed_bytes = &seed_digest[0..16];
        let seed = u64::from_str_radix(seed_bytes, 16).unwrap_or(0);
        let target = seed % total_stake;

        let mut acc = 0u64;
        for v in eligible {
            acc += v.stake;
            if target < acc {
                return Some(v);
            }
        }
        eligible.last().copied()
    }

    fn eligible(validators: &[Validator]) -> Vec<&Validator> {
        validators
            .iter()
            .filter(|v| v.is_active() && v.stake >= MIN_STAKE)
            .collect()
    }
}

impl ConsensusEngine for ProofOfStakeEngine {
    fn process_block(&mut self, block: &Block, validators: &[Validator]) -> ProcessOutcome {
        self.metrics.rounds_attempted += 1;
        self.state = ConsensusState::PosSelecting { round: block.index };

        let eligible = Self::eligible(validators);
        let expected = self.weighted_pick(&eligible, block.index);
        let approved = match expected {
            Some(v) => v.address == block.proposer,
            None => false,
        };

        self.state = ConsensusState::Idle;
        if !approved {
            self.metrics.rounds_failed += 1;
            return ProcessOutcome::failed(NodeError::Validation(format!(
                "proposer {} does not match stake-weighted selection for round {}",
                block.proposer, block.index
            )));
        }

        self.last_seed_hash = block.hash.clone();
        self.metrics.rounds_committed += 1;
        info!("pos: block {} committed, proposer {}", block.index, block.proposer);
        ProcessOutcome::committed()
    }

    fn validate_block(&self, block: &Block, validators: &[Validator]) -> Result<(), NodeError> {
        let eligible = Self::eligible(validators);
        match self.weighted_pick(&eligible, block.index) {
            Some(v) if v.address == block.proposer => Ok(()),
            Some(v) => Err(NodeError::Validation(format!(
                "expected proposer {}, found {}",
                v.address, block.proposer
            ))),
            None => Err(NodeError::Validation("no eligible validators for selection".into())),
        }
    }

    fn select_validator(&self, validators: &[Validator], round: u64) -> Option<Validator> {
        let eligible = Self::eligible(validators);
        self.weighted_pick(&eligible, round).cloned()
    }

    fn state(&self) -> ConsensusState {
        self.state.clone()
    }

    fn update_validators(&mut self, validators: Vec<Validator>) {
        self.validators = validators;
    }

    fn name(&self) -> &'static str {
        "pos"
    }

    fn metrics(&self) -> ConsensusMetrics {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.state = ConsensusState::Idle;
        self.last_seed_hash = "genesis".to_string();
    }
}
