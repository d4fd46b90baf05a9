use std::fmt;

/// Error taxonomy for the consensus engine and shard coordinator (spec §7).
#[derive(Debug, Clone)]
pub enum NodeError {
    /// Block or transaction fails one of the invariants in §3.
    Validation(String),
    /// PBFT/PPBFT prepare or commit votes fell short of quorum.
    QuorumShortfall { have: usize, need: usize },
    /// PPBFT: block index outside the current watermark window.
    OutsideWindow { index: u64, low: u64, high: u64 },
    /// Consensus round or cross-shard phase exceeded its deadline.
    Timeout(String),
    /// Transaction pool is at capacity.
    PoolFull,
    /// Transaction identifier already present (pool or chain).
    Duplicate(String),
    /// Submitted transaction/identifier unknown to the pool.
    Unknown(String),
    /// Transaction routes to a shard the manager does not own.
    InvalidShard(String),
    /// Durable storage failed; fatal to the current round.
    Storage(String),
    /// Conflicting configuration, e.g. an algorithm switch while running.
    ConfigConflict(String),
    /// Non-recoverable inconsistency in already-accepted chain state.
    StateCorruption(String),
    /// Mining exceeded its attempt cap without finding a valid nonce.
    MiningTimeout(u64),
    /// Difficulty parameter outside the accepted range.
    InvalidDifficulty(u32),
    /// Serialization/deserialization failure.
    Serialization(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Validation(msg) => write!(f, "validation failed: {}", msg),
            NodeError::QuorumShortfall { have, need } => {
                write!(f, "quorum shortfall: have {}, need {}", have, need)
            }
            NodeError::OutsideWindow { index, low, high } => {
                write!(f, "block index {} outside watermark window [{}, {}]", index, low, high)
            }
            NodeError::Timeout(msg) => write!(f, "timeout: {}", msg),
            NodeError::PoolFull => write!(f, "transaction pool full"),
            NodeError::Duplicate(id) => write!(f, "duplicate identifier: {}", id),
            NodeError::Unknown(id) => write!(f, "unknown identifier: {}", id),
            NodeError::InvalidShard(msg) => write!(f, "invalid shard: {}", msg),
            NodeError::Storage(msg) => write!(f, "storage error: {}", msg),
            NodeError::ConfigConflict(msg) => write!(f, "configuration conflict: {}", msg),
            NodeError::StateCorruption(msg) => write!(f, "state corruption: {}", msg),
            NodeError::MiningTimeout(attempts) => write!(f, "mining timeout after {} attempts", attempts),
            NodeError::InvalidDifficulty(d) => write!(f, "invalid difficulty: {}", d),
            NodeError::Serialization(msg) => write!(f, "serialization error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Storage(err.to_string())
    }
}

impl From<crate::storage::StorageError> for NodeError {
    fn from(err: crate::storage::StorageError) -> Self {
        NodeError::Storage(err.to_string())
    }
}
