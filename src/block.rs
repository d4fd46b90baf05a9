//! Block data model, assembly, and validation (spec §3, §4.3).

use serde::{Deserialize, Serialize};
use chrono::Utc;
use log::{debug, warn};
use crate::{NodeError, Result, Transaction, merkle::MerkleTree, primitives, transaction::TransactionType};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
/// Base gas limit: 200,000,000 per block (§6 Configuration default).
pub const DEFAULT_GAS_LIMIT: u64 = 200_000_000;
const MAX_MINE_ATTEMPTS: u64 = 10_000_000;
const HASH_PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub difficulty: u32,
    pub proposer: String,
    pub shard_id: u32,
    pub size: usize,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub metadata: BlockMetadata,
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlockMetadata {
    pub merkle_depth: usize,
    pub leaf_count: usize,
    pub creation_duration_micros: u64,
}

impl Block {
    /// Assemble a candidate block (§4.3 `create_block`). `is_pow` selects
    /// which hash function computes `hash`: PoW blocks use the double-hash
    /// with byte reversal that mining searches over (§4.1); every other
    /// algorithm content-addresses with plain SHA-256.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        proposer: String,
        shard_id: u32,
        difficulty: u32,
        gas_limit: u64,
        is_pow: bool,
    ) -> Result<Self> {
        let start = std::time::Instant::now();

        let mut seen = std::collections::HashSet::new();
        for tx in &transactions {
            if !seen.insert(&tx.id) {
                return Err(NodeError::Validation(format!(
                    "duplicate transaction id in block: {}",
                    tx.id
                )));
            }
        }

        let gas_used: u64 = transactions.iter().map(|tx| tx.gas_cost()).sum();
        if gas_used > gas_limit {
            return Err(NodeError::Validation(format!(
                "block gas {} exceeds limit {}",
                gas_used, gas_limit
            )));
        }

        let merkle_tree = MerkleTree::new(&transactions)?;
        let merkle_root = merkle_tree.root_hash().unwrap_or_else(|| "0".repeat(64));
        let timestamp = Utc::now().timestamp();

        let mut block = Block {
            index,
            timestamp,
            previous_hash,
            merkle_root,
            transactions,
            nonce: 0,
            difficulty,
            proposer,
            shard_id,
            size: 0,
            gas_used,
            gas_limit,
            metadata: BlockMetadata {
                merkle_depth: merkle_tree.height,
                leaf_count: merkle_tree.leaf_count,
                creation_duration_micros: start.elapsed().as_micros() as u64,
            },
            hash: String::new(),
        };
        block.size = 200 + block.transactions.iter().map(|t| t.size()).sum::<usize>();
        block.hash = block.compute_hash(is_pow);
        Ok(block)
    }

    /// Deterministic genesis block (§4.3 `genesis`).
    pub fn genesis() -> Self {
        let tx = Transaction::new_genesis();
        let merkle_tree = MerkleTree::new(std::slice::from_ref(&tx)).expect("genesis merkle");
        let mut block = Block {
            index: 0,
            timestamp: Utc::now().timestamp(),
            previous_hash: GENESIS_HASH.to_string(),
            merkle_root: merkle_tree.root_hash().unwrap_or_default(),
            transactions: vec![tx],
            nonce: 0,
            difficulty: 1,
            proposer: "genesis".to_string(),
            shard_id: 0,
            size: 0,
            gas_used: 0,
            gas_limit: DEFAULT_GAS_LIMIT,
            metadata: BlockMetadata {
                merkle_depth: merkle_tree.height,
                leaf_count: merkle_tree.leaf_count,
                creation_duration_micros: 0,
            },
            hash: String::new(),
        };
        block.size = 200 + block.transactions.iter().map(|t| t.size()).sum::<usize>();
        block.hash = block.compute_hash(false);
        block
    }

    /// Hash input tuple: (index, previous_hash, merkle_root, proposer,
    /// timestamp, nonce), per §3.
    fn hash_input(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.index, self.previous_hash, self.merkle_root, self.proposer, self.timestamp, self.nonce
        )
    }

    fn compute_hash(&self, is_pow: bool) -> String {
        if is_pow {
            primitives::double_hash_reversed(self.hash_input().as_bytes())
        } else {
            primitives::calculate_hash(self.hash_input().as_bytes())
        }
    }

    /// PoW mining helper (§4.3 `mine`): iterate the nonce until the hash hex
    /// begins with `difficulty` leading zeros, capped at 10^7 attempts.
    /// Returns the winning nonce and hash.
    pub fn mine(&mut self, difficulty: u32) -> Result<u64> {
        self.difficulty = difficulty;
        let mut attempts: u64 = 0;
        loop {
            let hash = self.compute_hash(true);
            if primitives::hash_meets_difficulty(&hash, difficulty) {
                self.nonce = attempts;
                self.hash = hash;
                return Ok(attempts);
            }
            attempts += 1;
            if attempts > MAX_MINE_ATTEMPTS {
                return Err(NodeError::MiningTimeout(attempts));
            }
            self.nonce = attempts;
            if attempts % HASH_PROGRESS_INTERVAL == 0 {
                debug!("mining block {}: {} attempts, hash {}", self.index, attempts, hash);
            }
        }
    }

    /// Validate structural invariants against the predecessor (§3, §4.3,
    /// §8). For PoW blocks the hash is not re-derived (mining already proved
    /// it satisfies the difficulty predicate); every other algorithm must
    /// reproduce the exact claimed hash. `num_shards` is the shard count
    /// used to re-derive each transaction's routing for the shard-binding
    /// check (§3: every non-cross-shard transaction must route to this
    /// block's shard).
    pub fn validate(&self, previous: &Block, is_pow: bool, num_shards: u32) -> Result<()> {
        if self.index != previous.index + 1 {
            return Err(NodeError::Validation(format!(
                "expected index {}, found {}",
                previous.index + 1,
                self.index
            )));
        }
        if self.previous_hash != previous.hash {
            return Err(NodeError::Validation(
                "previous_hash does not match predecessor".into(),
            ));
        }
        if self.timestamp < previous.timestamp {
            return Err(NodeError::Validation("timestamp precedes predecessor".into()));
        }
        let now = Utc::now().timestamp();
        if self.timestamp > now + 600 {
            return Err(NodeError::Validation("timestamp too far in the future".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(&tx.id) {
                return Err(NodeError::Validation(format!(
                    "duplicate transaction id: {}",
                    tx.id
                )));
            }
            tx.validate()?;

            // §3: every transaction's shard routes to this block's shard,
            // or it is typed cross_shard. Coinbase and genesis transactions
            // carry a synthetic sender and are exempt along with cross_shard.
            let routed_locally = matches!(
                tx.transaction_type,
                TransactionType::Transfer | TransactionType::Stake | TransactionType::Unstake
            );
            if routed_locally {
                let routed_shard = primitives::route_shard(&tx.sender, num_shards);
                if routed_shard != self.shard_id {
                    return Err(NodeError::Validation(format!(
                        "transaction {} routes to shard {} but block is shard {}",
                        tx.id, routed_shard, self.shard_id
                    )));
                }
            }
        }

        let merkle_tree = MerkleTree::new(&self.transactions)?;
        let expected_root = merkle_tree.root_hash().unwrap_or_else(|| "0".repeat(64));
        if expected_root != self.merkle_root {
            return Err(NodeError::Validation("merkle root mismatch".into()));
        }

        let expected_gas: u64 = self.transactions.iter().map(|t| t.gas_cost()).sum();
        if expected_gas != self.gas_used {
            return Err(NodeError::Validation("gas_used mismatch".into()));
        }
        if self.gas_used > self.gas_limit {
            return Err(NodeError::Validation("gas_used exceeds gas_limit".into()));
        }

        if is_pow {
            if !primitives::hash_meets_difficulty(&self.hash, self.difficulty) {
                return Err(NodeError::Validation(
                    "block hash does not satisfy difficulty predicate".into(),
                ));
            }
        } else {
            let recomputed = self.compute_hash(false);
            if recomputed != self.hash {
                warn!("block {} hash mismatch: claimed {}, recomputed {}", self.index, self.hash, recomputed);
                return Err(NodeError::StateCorruption(format!(
                    "computed hash {} != claimed hash {} for block {}",
                    recomputed, self.hash, self.index
                )));
            }
        }

        Ok(())
    }

    /// Block reward (§4.3 `reward`): base 50e6, halved every 210,000 blocks,
    /// zero after 32 halvings; plus the sum of included transaction fees.
    pub fn reward(&self) -> u64 {
        block_subsidy(self.index) + self.transactions.iter().map(|t| t.fee).sum::<u64>()
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn total_amount(&self) -> u64 {
        self.transactions.iter().map(|t| t.amount).sum()
    }

    pub fn short_hash(&self) -> String {
        self.hash.chars().take(8).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(NodeError::from)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(NodeError::from)
    }
}

/// Block subsidy at `height`: 50,000,000 halved every 210,000 blocks, zero
/// after 32 halvings.
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / 210_000;
    if halvings >= 32 {
        return 0;
    }
    50_000_000u64 >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            "alice".into(),
            "bob".into(),
            10,
            1,
            vec![],
            nonce,
            0,
        )
        .unwrap()
    }

    #[test]
    fn genesis_block_is_well_formed() {
        let g = Block::genesis();
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash, GENESIS_HASH);
        assert_eq!(g.difficulty, 1);
    }

    #[test]
    fn mined_block_satisfies_difficulty_and_skips_hash_recheck() {
        let mut block = Block::create(1, Block::genesis().hash, vec![tx(0)], "miner".into(), 0, 1, DEFAULT_GAS_LIMIT, true).unwrap();
        block.mine(1).unwrap();
        let genesis = Block::genesis();
        assert!(block.validate(&genesis, true, 1).is_ok());
    }

    #[test]
    fn non_pow_block_requires_exact_hash_match() {
        let genesis = Block::genesis();
        let mut block = Block::create(1, genesis.hash.clone(), vec![tx(0)], "validator-a".into(), 0, 0, DEFAULT_GAS_LIMIT, false).unwrap();
        assert!(block.validate(&genesis, false, 1).is_ok());
        block.hash = "tampered".to_string();
        assert!(block.validate(&genesis, false, 1).is_err());
    }

    #[test]
    fn duplicate_transactions_rejected() {
        let t = tx(0);
        let result = Block::create(1, Block::genesis().hash, vec![t.clone(), t], "p".into(), 0, 0, DEFAULT_GAS_LIMIT, false);
        assert!(result.is_err());
    }

    #[test]
    fn gas_over_limit_rejected() {
        let result = Block::create(1, Block::genesis().hash, vec![tx(0)], "p".into(), 0, 0, 1000, false);
        assert!(result.is_err());
    }

    #[test]
    fn transaction_mis_routed_to_wrong_shard_is_rejected() {
        let genesis = Block::genesis();
        let t = tx(0);
        let num_shards = 4;
        let home_shard = primitives::route_shard(&t.sender, num_shards);
        let wrong_shard = (home_shard + 1) % num_shards;

        let ok_block = Block::create(1, genesis.hash.clone(), vec![t.clone()], "p".into(), home_shard, 0, DEFAULT_GAS_LIMIT, false).unwrap();
        assert!(ok_block.validate(&genesis, false, num_shards).is_ok());

        let mis_routed = Block::create(1, genesis.hash.clone(), vec![t], "p".into(), wrong_shard, 0, DEFAULT_GAS_LIMIT, false).unwrap();
        assert!(mis_routed.validate(&genesis, false, num_shards).is_err());
    }

    #[test]
    fn cross_shard_transaction_is_exempt_from_shard_binding() {
        let genesis = Block::genesis();
        let t = Transaction::new(TransactionType::CrossShard, "alice".into(), "bob".into(), 10, 1, vec![], 0, 0).unwrap();
        let num_shards = 4;
        let wrong_shard = (primitives::route_shard(&t.sender, num_shards) + 1) % num_shards;
        let block = Block::create(1, genesis.hash.clone(), vec![t], "p".into(), wrong_shard, 0, DEFAULT_GAS_LIMIT, false).unwrap();
        assert!(block.validate(&genesis, false, num_shards).is_ok());
    }

    #[test]
    fn subsidy_halves_and_floors_to_zero() {
        assert_eq!(block_subsidy(0), 50_000_000);
        assert_eq!(block_subsidy(210_000), 25_000_000);
        assert_eq!(block_subsidy(210_000 * 32), 0);
    }

    #[test]
    fn json_round_trip_is_byte_identical() {
        let block = Block::genesis();
        let json1 = block.to_json().unwrap();
        let back = Block::from_json(&json1).unwrap();
        let json2 = back.to_json().unwrap();
        assert_eq!(json1, json2);
    }
}
