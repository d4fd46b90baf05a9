//! Per-shard transaction pool (spec §4.2).

use std::collections::HashMap;
use chrono::Utc;
use log::debug;
use crate::{NodeError, Result, Transaction};

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl serde::Serialize for TxStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let label = match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Rejected => "rejected",
        };
        s.serialize_str(label)
    }
}

impl<'de> serde::Deserialize<'de> for TxStatus {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(d)?;
        match s.as_str() {
            "pending" => Ok(TxStatus::Pending),
            "confirmed" => Ok(TxStatus::Confirmed),
            "rejected" => Ok(TxStatus::Rejected),
            other => Err(serde::de::Error::custom(format!("unknown tx status {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    tx: Transaction,
    shard: u32,
    arrival_seq: u64,
    arrival_time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub size: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub median_confirmation_latency_ms: Option<i64>,
}

/// Mapping from shard identifier to an ordered pending set, plus a status
/// side-table, bounded by a system-wide capacity (§3, §4.2).
pub struct TransactionPool {
    capacity: usize,
    pending: HashMap<u32, Vec<Entry>>,
    status: HashMap<String, TxStatus>,
    confirmation_latencies_ms: Vec<i64>,
    arrival_counter: u64,
}

impl TransactionPool {
    pub fn new(capacity: usize) -> Self {
        TransactionPool {
            capacity,
            pending: HashMap::new(),
            status: HashMap::new(),
            confirmation_latencies_ms: Vec::new(),
            arrival_counter: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    fn total_pending(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    /// Admit a transaction, routing it to `shard` (computed by the caller
    /// via `primitives::route_shard`). Idempotent by identifier.
    pub fn admit(&mut self, tx: Transaction, shard: u32) -> Result<()> {
        if self.status.contains_key(&tx.id) {
            return Err(NodeError::Duplicate(tx.id.clone()));
        }
        if self.total_pending() >= self.capacity {
            return Err(NodeError::PoolFull);
        }

        self.arrival_counter += 1;
        let entry = Entry {
            tx: tx.clone(),
            shard,
            arrival_seq: self.arrival_counter,
            arrival_time: Utc::now().timestamp(),
        };
        self.status.insert(tx.id.clone(), TxStatus::Pending);
        self.pending.entry(shard).or_default().push(entry);
        debug!("admitted tx {} to shard {}", tx.id, shard);
        Ok(())
    }

    /// Draw up to `limit` pending transactions for `shard`, ordered by fee
    /// descending then arrival order ascending, with id as a final
    /// deterministic tie-break.
    pub fn draw(&self, shard: u32, limit: usize) -> Vec<Transaction> {
        let Some(entries) = self.pending.get(&shard) else {
            return Vec::new();
        };
        let mut sorted: Vec<&Entry> = entries.iter().collect();
        sorted.sort_by(|a, b| {
            b.tx.fee
                .cmp(&a.tx.fee)
                .then(a.arrival_seq.cmp(&b.arrival_seq))
                .then(a.tx.id.cmp(&b.tx.id))
        });
        sorted.into_iter().take(limit).map(|e| e.tx.clone()).collect()
    }

    /// Mark a transaction confirmed, evicting it from the pending set and
    /// recording its confirmation latency.
    pub fn confirm(&mut self, tx_id: &str) -> Result<()> {
        let status = self
            .status
            .get_mut(tx_id)
            .ok_or_else(|| NodeError::Unknown(tx_id.to_string()))?;
        *status = TxStatus::Confirmed;

        let mut found_time = None;
        for entries in self.pending.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.tx.id == tx_id) {
                found_time = Some(entries.remove(pos).arrival_time);
                break;
            }
        }
        if let Some(arrival) = found_time {
            let latency_ms = (Utc::now().timestamp() - arrival).max(0) * 1000;
            self.confirmation_latencies_ms.push(latency_ms);
        }
        Ok(())
    }

    /// Mark a transaction rejected (e.g. cross-shard abort), evicting it
    /// from the pending set without recording a confirmation latency.
    pub fn reject(&mut self, tx_id: &str) -> Result<()> {
        let status = self
            .status
            .get_mut(tx_id)
            .ok_or_else(|| NodeError::Unknown(tx_id.to_string()))?;
        *status = TxStatus::Rejected;
        for entries in self.pending.values_mut() {
            entries.retain(|e| e.tx.id != tx_id);
        }
        Ok(())
    }

    pub fn status_of(&self, tx_id: &str) -> Option<TxStatus> {
        self.status.get(tx_id).copied()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.status.contains_key(tx_id)
    }

    pub fn stats(&self) -> PoolStats {
        let mut pending = 0;
        let mut confirmed = 0;
        let mut rejected = 0;
        for status in self.status.values() {
            match status {
                TxStatus::Pending => pending += 1,
                TxStatus::Confirmed => confirmed += 1,
                TxStatus::Rejected => rejected += 1,
            }
        }

        let mut latencies = self.confirmation_latencies_ms.clone();
        latencies.sort_unstable();
        let median = if latencies.is_empty() {
            None
        } else {
            Some(latencies[latencies.len() / 2])
        };

        PoolStats {
            size: self.status.len(),
            pending,
            confirmed,
            rejected,
            median_confirmation_latency_ms: median,
        }
    }
}
