//! Node configuration shape (spec §1c, §6 Configuration).
//!
//! Loading a TOML file from disk, environment overlays, and CLI flag parsing
//! are all collaborator concerns out of scope for this crate; this module
//! only defines the struct, its defaults, and structural validation.

use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusConfig;
use crate::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Bootstrap,
    Validator,
    Observer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    pub role: NodeRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingSettings {
    pub num_shards: u32,
    pub shard_size: usize,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        ShardingSettings { num_shards: 4, shard_size: 500 }
    }
}

/// `consensus.algorithm` name, kept distinct from [`ConsensusAlgorithm`]
/// so config can be validated before construction is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmName {
    Pow,
    Pos,
    Pbft,
    Ppbft,
    Lscc,
}

impl AlgorithmName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmName::Pow => "pow",
            AlgorithmName::Pos => "pos",
            AlgorithmName::Pbft => "pbft",
            AlgorithmName::Ppbft => "ppbft",
            AlgorithmName::Lscc => "lscc",
        }
    }
}

/// Every recognized option in spec §6 Configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub sharding: ShardingSettings,
    pub algorithm: AlgorithmName,
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node: NodeSettings { id: "node-0".to_string(), role: NodeRole::Validator },
            sharding: ShardingSettings::default(),
            algorithm: AlgorithmName::Pow,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reject nonsensical combinations (§1c): a zero shard count, or an
    /// `lscc` layer/channel configuration that cannot be constructed.
    pub fn validate(&self) -> Result<()> {
        if self.sharding.num_shards == 0 {
            return Err(NodeError::ConfigConflict("sharding.num_shards must be >= 1".into()));
        }
        if self.sharding.shard_size == 0 {
            return Err(NodeError::ConfigConflict("sharding.shard_size must be >= 1".into()));
        }
        if self.consensus.block_time_secs == 0 {
            return Err(NodeError::ConfigConflict("consensus.block_time must be >= 1".into()));
        }
        if matches!(self.algorithm, AlgorithmName::Pow) && !(1..=31).contains(&self.consensus.difficulty) {
            return Err(NodeError::ConfigConflict("consensus.difficulty must be in [1, 31]".into()));
        }
        if matches!(self.algorithm, AlgorithmName::Lscc) {
            if self.consensus.layer_depth == 0 {
                return Err(NodeError::ConfigConflict("consensus.layer_depth must be >= 1 for lscc".into()));
            }
            if self.consensus.channel_count == 0 {
                return Err(NodeError::ConfigConflict("consensus.channel_count must be >= 1 for lscc".into()));
            }
        }
        Ok(())
    }
}

/// Process exit codes (spec §6). Reading these into an actual `main` is a
/// CLI-hosting concern out of scope for the core; this just names the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Normal = 0,
    ConfigInvalid = 2,
    StorageFailure = 3,
    ConsensusInitFailure = 4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_shards_is_config_conflict() {
        let mut config = NodeConfig::default();
        config.sharding.num_shards = 0;
        assert!(matches!(config.validate(), Err(NodeError::ConfigConflict(_))));
    }

    #[test]
    fn lscc_requires_nonzero_layers_and_channels() {
        let mut config = NodeConfig::default();
        config.algorithm = AlgorithmName::Lscc;
        config.consensus.layer_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pow_requires_difficulty_in_range() {
        let mut config = NodeConfig::default();
        config.algorithm = AlgorithmName::Pow;
        config.consensus.difficulty = 0;
        assert!(config.validate().is_err());
    }
}
