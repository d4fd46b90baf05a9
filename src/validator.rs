//! Validator data model (spec §3).

use serde::{Deserialize, Serialize};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Active,
    Jailed,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    pub public_key: String,
    pub stake: u64,
    pub voting_power: u64,
    pub last_active: i64,
    pub shard_assignment: u32,
    pub status: ValidatorStatus,
    /// Score in [0, 1] reflecting recent validation behavior.
    pub reputation: f64,
}

impl Validator {
    pub fn new(address: String, public_key: String, stake: u64, shard_assignment: u32) -> Self {
        Validator {
            address,
            public_key,
            stake,
            voting_power: stake,
            last_active: Utc::now().timestamp(),
            shard_assignment,
            status: ValidatorStatus::Active,
            reputation: 1.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now().timestamp();
    }

    pub fn record_outcome(&mut self, success: bool) {
        self.touch();
        if success {
            self.reputation = (self.reputation + 0.01).min(1.0);
        } else {
            self.reputation = (self.reputation - 0.1).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validator_is_active_with_full_reputation() {
        let v = Validator::new("addr".into(), "pub".into(), 1000, 0);
        assert!(v.is_active());
        assert_eq!(v.reputation, 1.0);
    }

    #[test]
    fn reputation_clamps_to_bounds() {
        let mut v = Validator::new("addr".into(), "pub".into(), 1000, 0);
        for _ in 0..50 {
            v.record_outcome(false);
        }
        assert_eq!(v.reputation, 0.0);
        for _ in 0..50 {
            v.record_outcome(true);
        }
        assert_eq!(v.reputation, 1.0);
    }
}
