//! Proof-of-Work consensus engine (spec §4.6).
//!
//! Mining itself happens on the candidate [`Block`] before it reaches
//! [`ConsensusEngine::process_block`] (the chain controller calls
//! [`Block::mine`] directly, since mining is block assembly, not a vote).
//! This engine's job is to check the result against the difficulty
//! predicate, retarget for the next round, and report outcome/metrics.

use log::info;
use crate::block::Block;
use crate::validator::Validator;
use crate::{primitives, NodeError};
use super::{ConsensusConfig, ConsensusEngine, ConsensusMetrics, ConsensusState, ProcessOutcome};

pub struct ProofOfWorkEngine {
    config: ConsensusConfig,
    difficulty: u32,
    state: ConsensusState,
    metrics: ConsensusMetrics,
    validators: Vec<Validator>,
    last_block_timestamp: Option<i64>,
}

impl ProofOfWorkEngine {
    pub fn new(config: ConsensusConfig) -> Self {
        let difficulty = config.difficulty;
        ProofOfWorkEngine {
            config,
            difficulty,
            state: ConsensusState::Idle,
            metrics: ConsensusMetrics::default(),
            validators: Vec::new(),
            last_block_timestamp: None,
        }
    }

    pub fn current_difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Simple +/-1 retarget (spec §9 Open Question: no full epoch-averaged
    /// retarget is implemented, matching the teacher's original behavior):
    /// a block that arrived faster than `block_time_secs` raises difficulty
    /// by one, a slower block lowers it by one, floor of 1.
    fn retarget(&mut self, block_timestamp: i64) {
        if let Some(previous) = self.last_block_timestamp {
            let elapsed = (block_timestamp - previous).max(0) as u64;
            if elapsed < self.config.block_time_secs {
                self.difficulty += 1;
            } else if elapsed > self.config.block_time_secs && self.difficulty > 1 {
                self.difficulty -= 1;
            }
        }
        self.last_block_timestamp = Some(block_timestamp);
    }
}

impl ConsensusEngine for ProofOfWorkEngine {
    fn process_block(&mut self, block: &Block, _validators: &[Validator]) -> ProcessOutcome {
        self.metrics.rounds_attempted += 1;
        self.state = ConsensusState::PowMining { attempts: block.nonce };

        if !primitives::hash_meets_difficulty(&block.hash, block.difficulty) {
            self.metrics.rounds_failed += 1;
            self.state = ConsensusState::Idle;
            return ProcessOutcome::failed(NodeError::Validation(
                "mined hash does not satisfy claimed difficulty".into(),
            ));
        }

        self.retarget(block.timestamp);
        self.metrics.rounds_committed += 1;
        self.state = ConsensusState::Idle;
        info!(
            "pow: block {} committed at difficulty {}, next difficulty {}",
            block.index, block.difficulty, self.difficulty
        );
        ProcessOutcome::committed()
    }

    fn validate_block(&self, block: &Block, _validators: &[Validator]) -> Result<(), NodeError> {
        if !primitives::hash_meets_difficulty(&block.hash, block.difficulty) {
            return Err(NodeError::Validation(
                "block hash does not meet its claimed difficulty".into(),
            ));
        }
        Ok(())
    }

    /// Round-robin proposer selection among active validators; PoW does not
    /// require a single designated proposer (any miner may submit a valid
    /// block), but the chain controller needs a name to attribute the block
    /// to. Falls back to a synthetic miner identity when no validators are
    /// registered, since mining does not depend on stake.
    fn select_validator(&self, validators: &[Validator], round: u64) -> Option<Validator> {
        let active: Vec<&Validator> = validators.iter().filter(|v| v.is_active()).collect();
        if active.is_empty() {
            return Some(Validator::new(
                "pow-miner".to_string(),
                "pow-miner-pubkey".to_string(),
                0,
                0,
            ));
        }
        let idx = (round as usize) % active.len();
        Some(active[idx].clone())
    }

    fn state(&self) -> ConsensusState {
        self.state.clone()
    }

    fn update_validators(&mut self, validators: Vec<Validator>) {
        self.validators = validators;
    }

    fn name(&self) -> &'static str {
        "pow"
    }

    fn metrics(&self) -> ConsensusMetrics {
        self.metrics.clone()
    }

    fn reset(&mut self) {
        self.difficulty = self.config.difficulty;
        self.state = ConsensusState::Idle;
        self.last_block_timestamp = None;
    }

    fn is_pow(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DEFAULT_GAS_LIMIT;
    use crate::transaction::{Transaction, TransactionType};

    fn tx() -> Transaction {
        Transaction::new(TransactionType::Transfer, "a".into(), "b".into(), 1, 1, vec![], 0, 0).unwrap()
    }

    #[test]
    fn accepts_a_properly_mined_block() {
        let mut engine = ProofOfWorkEngine::new(ConsensusConfig { difficulty: 1, ..Default::default() });
        let mut block = Block::create(1, Block::genesis().hash, vec![tx()], "miner".into(), 0, 1, DEFAULT_GAS_LIMIT, true).unwrap();
        block.mine(1).unwrap();
        let outcome = engine.process_block(&block, &[]);
        assert!(outcome.committed);
        assert_eq!(engine.metrics().rounds_committed, 1);
    }

    #[test]
    fn rejects_a_block_whose_hash_does_not_meet_difficulty() {
        let engine = ProofOfWorkEngine::new(ConsensusConfig::default());
        let mut block = Block::create(1, Block::genesis().hash, vec![tx()], "miner".into(), 0, 64, DEFAULT_GAS_LIMIT, true).unwrap();
        block.difficulty = 64;
        assert!(engine.validate_block(&block, &[]).is_err());
    }

    #[test]
    fn select_validator_falls_back_to_synthetic_miner_when_empty() {
        let engine = ProofOfWorkEngine::new(ConsensusConfig::default());
        let chosen = engine.select_validator(&[], 0).unwrap();
        assert_eq!(chosen.address, "pow-miner");
    }
}
