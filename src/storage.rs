//! Durable storage collaborator (spec §6 External Interfaces).
//!
//! `Storage` is the trait the chain controller depends on; `SledStorage` is
//! the reference implementation, grounded directly on the teacher's
//! tree-per-entity `sled` layout (`blocks`, `transactions`, `validators`,
//! `metadata`). Kept synchronous, matching the teacher's blocking `sled`
//! API and the spec's note that `async_trait` is not required here.

use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use crate::block::Block;
use crate::transaction::Transaction;
use crate::validator::Validator;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Durable block/transaction/validator storage (spec §6).
///
/// `save_block` must be durable before the controller advances
/// `latest_block`; implementations that buffer writes must flush inside
/// `save_block` itself, not defer it to a background task.
pub trait Storage: Send + Sync {
    fn save_block(&self, block: &Block) -> StorageResult<()>;
    fn get_block_by_hash(&self, hash: &str) -> StorageResult<Option<Block>>;
    fn get_block_by_index(&self, index: u64) -> StorageResult<Option<Block>>;
    fn get_latest_block(&self) -> StorageResult<Option<Block>>;
    fn save_transaction(&self, tx: &Transaction) -> StorageResult<()>;
    fn get_transaction(&self, id: &str) -> StorageResult<Option<Transaction>>;
    fn get_transactions_by_address(&self, address: &str) -> StorageResult<Vec<Transaction>>;
    fn save_validator(&self, validator: &Validator) -> StorageResult<()>;
    fn get_all_validators(&self) -> StorageResult<Vec<Validator>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageMetadata {
    latest_index: u64,
    latest_hash: String,
}

/// `sled`-backed reference implementation (spec §6).
pub struct SledStorage {
    #[allow(dead_code)]
    db: Arc<Db>,
    blocks_by_index: Tree,
    blocks_by_hash: Tree,
    transactions: Tree,
    tx_by_address: Tree,
    validators: Tree,
    metadata: Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = Arc::new(sled::open(path)?);
        let storage = SledStorage {
            blocks_by_index: db.open_tree("blocks")?,
            blocks_by_hash: db.open_tree("block_hash")?,
            transactions: db.open_tree("transactions")?,
            tx_by_address: db.open_tree("tx_addr")?,
            validators: db.open_tree("validators")?,
            metadata: db.open_tree("metadata")?,
            db,
        };
        info!("opened sled storage");
        Ok(storage)
    }

    fn write_metadata(&self, block: &Block) -> StorageResult<()> {
        let meta = StorageMetadata { latest_index: block.index, latest_hash: block.hash.clone() };
        self.metadata.insert("latest", serde_json::to_vec(&meta)?)?;
        self.metadata.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn save_block(&self, block: &Block) -> StorageResult<()> {
        let bytes = serde_json::to_vec(block)?;
        self.blocks_by_index.insert(block.index.to_be_bytes(), bytes.clone())?;
        self.blocks_by_hash.insert(block.hash.as_bytes(), block.index.to_be_bytes().to_vec())?;
        for tx in &block.transactions {
            self.save_transaction(tx)?;
        }
        self.write_metadata(block)?;
        self.blocks_by_index.flush()?;
        self.blocks_by_hash.flush()?;
        Ok(())
    }

    fn get_block_by_hash(&self, hash: &str) -> StorageResult<Option<Block>> {
        let Some(index_bytes) = self.blocks_by_hash.get(hash.as_bytes())? else {
            return Ok(None);
        };
        let index = u64::from_be_bytes(
            index_bytes
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corruption("malformed block_hash index entry".into()))?,
        );
        self.get_block_by_index(index)
    }

    fn get_block_by_index(&self, index: u64) -> StorageResult<Option<Block>> {
        match self.blocks_by_index.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_latest_block(&self) -> StorageResult<Option<Block>> {
        let Some(bytes) = self.metadata.get("latest")? else {
            return Ok(None);
        };
        let meta: StorageMetadata = serde_json::from_slice(&bytes)?;
        self.get_block_by_index(meta.latest_index)
    }

    fn save_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        let bytes = serde_json::to_vec(tx)?;
        self.transactions.insert(tx.id.as_bytes(), bytes)?;
        let sender_key = format!("{}:{}", tx.sender, tx.id);
        let receiver_key = format!("{}:{}", tx.receiver, tx.id);
        self.tx_by_address.insert(sender_key.as_bytes(), tx.id.as_bytes())?;
        self.tx_by_address.insert(receiver_key.as_bytes(), tx.id.as_bytes())?;
        Ok(())
    }

    fn get_transaction(&self, id: &str) -> StorageResult<Option<Transaction>> {
        match self.transactions.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_transactions_by_address(&self, address: &str) -> StorageResult<Vec<Transaction>> {
        let prefix = format!("{}:", address);
        let mut out = Vec::new();
        for entry in self.tx_by_address.scan_prefix(prefix.as_bytes()) {
            let (_, tx_id) = entry?;
            let tx_id = String::from_utf8_lossy(&tx_id).to_string();
            if let Some(tx) = self.get_transaction(&tx_id)? {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn save_validator(&self, validator: &Validator) -> StorageResult<()> {
        let bytes = serde_json::to_vec(validator)?;
        self.validators.insert(validator.address.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_all_validators(&self) -> StorageResult<Vec<Validator>> {
        let mut out = Vec::new();
        for entry in self.validators.iter() {
            let (_, bytes) = entry?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn storage() -> SledStorage {
        let dir = tempfile::tempdir().unwrap();
        SledStorage::open(dir.path()).unwrap()
    }

    #[test]
    fn save_and_load_block_round_trips() {
        let storage = storage();
        let block = Block::genesis();
        storage.save_block(&block).unwrap();
        let loaded = storage.get_block_by_index(0).unwrap().unwrap();
        assert_eq!(loaded.hash, block.hash);
        let by_hash = storage.get_block_by_hash(&block.hash).unwrap().unwrap();
        assert_eq!(by_hash.index, 0);
    }

    #[test]
    fn latest_block_tracks_most_recent_save() {
        let storage = storage();
        storage.save_block(&Block::genesis()).unwrap();
        assert_eq!(storage.get_latest_block().unwrap().unwrap().index, 0);
    }

    #[test]
    fn transactions_indexed_by_both_sender_and_receiver() {
        let storage = storage();
        let tx = Transaction::new(TransactionType::Transfer, "alice".into(), "bob".into(), 10, 1, vec![], 0, 0).unwrap();
        storage.save_transaction(&tx).unwrap();
        assert_eq!(storage.get_transactions_by_address("alice").unwrap().len(), 1);
        assert_eq!(storage.get_transactions_by_address("bob").unwrap().len(), 1);
    }

    #[test]
    fn validators_round_trip() {
        let storage = storage();
        let v = Validator::new("addr".into(), "pub".into(), 100, 0);
        storage.save_validator(&v).unwrap();
        let all = storage.get_all_validators().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "addr");
    }
}
