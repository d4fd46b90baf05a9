//! Merkle tree construction and inclusion proofs (spec §4.1, §8).

use serde::{Deserialize, Serialize};
use log::debug;
use crate::{NodeError, Result, Transaction, primitives};

/// A node in the Merkle tree, kept for structural introspection; proof
/// generation works off the flattened `levels` representation in
/// [`MerkleTree`] rather than walking this tree, which is the efficient way
/// to answer "give me the siblings on the path from leaf i to the root".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleNode {
    pub hash: String,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
    pub is_leaf: bool,
}

/// Merkle tree over a block's transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MerkleTree {
    pub root: Option<MerkleNode>,
    pub leaf_count: usize,
    pub height: usize,
    /// `levels[0]` are leaf hashes, `levels[last]` is `[root_hash]`. Built
    /// alongside `root` so that [`MerkleTree::generate_proof`] can look up
    /// siblings by index instead of walking boxed nodes.
    levels: Vec<Vec<String>>,
}

/// Ordered list of (sibling hash, direction) steps from a leaf to the root.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MerkleProof {
    pub path: Vec<(String, Direction)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The sibling is to the left of our node (we are the right child).
    Left,
    /// The sibling is to the right of our node (we are the left child).
    Right,
}

impl MerkleTree {
    /// Build a tree from a block's transactions. Leaves are SHA-256 of each
    /// transaction's identifier; an odd-sized level duplicates its last node;
    /// internal nodes hash the hex concatenation of their children.
    ///
    /// ```
    /// use shardcore::merkle::MerkleTree;
    /// use shardcore::transaction::{Transaction, TransactionType};
    ///
    /// let tx1 = Transaction::new(TransactionType::Transfer, "alice".into(), "bob".into(), 100, 1, vec![], 0, 0).unwrap();
    /// let tx2 = Transaction::new(TransactionType::Transfer, "bob".into(), "carol".into(), 50, 1, vec![], 1, 0).unwrap();
    /// let tree = MerkleTree::new(&[tx1, tx2]).unwrap();
    /// assert!(tree.root_hash().is_some());
    /// assert_eq!(tree.leaf_count, 2);
    /// ```
    pub fn new(transactions: &[Transaction]) -> Result<Self> {
        if transactions.is_empty() {
            return Ok(MerkleTree {
                root: None,
                leaf_count: 0,
                height: 0,
                levels: Vec::new(),
            });
        }

        let leaves: Vec<String> = transactions
            .iter()
            .map(|tx| primitives::calculate_hash(tx.id.as_bytes()))
            .collect();

        let levels = build_levels(leaves.clone());
        let root = build_node_tree(leaves)?;
        let height = levels.len().saturating_sub(1);

        debug!(
            "built merkle tree: {} leaves, height {}",
            transactions.len(),
            height
        );

        Ok(MerkleTree {
            root: Some(root),
            leaf_count: transactions.len(),
            height,
            levels,
        })
    }

    pub fn root_hash(&self) -> Option<String> {
        self.root.as_ref().map(|node| node.hash.clone())
    }

    /// Generate the inclusion proof for the leaf at `index`.
    pub fn generate_proof(&self, index: usize) -> Result<MerkleProof> {
        if self.root.is_none() {
            return Err(NodeError::Validation("merkle tree is empty".into()));
        }
        if index >= self.leaf_count {
            return Err(NodeError::Validation(format!(
                "transaction index {} out of bounds (leaf_count {})",
                index, self.leaf_count
            )));
        }

        let mut path = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // Odd-length levels duplicate the last node, so sibling_idx is
            // always in range after that padding.
            let sibling_hash = level[sibling_idx.min(level.len() - 1)].clone();
            let direction = if idx % 2 == 0 {
                Direction::Right
            } else {
                Direction::Left
            };
            path.push((sibling_hash, direction));
            idx /= 2;
        }

        Ok(MerkleProof { path })
    }

    /// Verify that `transaction` at `index` is included in this tree by
    /// replaying the hash chain described by `proof` and comparing the
    /// result to the tree's claimed root.
    pub fn verify_transaction(
        &self,
        transaction: &Transaction,
        proof: &MerkleProof,
        index: usize,
    ) -> Result<bool> {
        let Some(expected_root) = self.root_hash() else {
            return Err(NodeError::Validation("merkle tree is empty".into()));
        };
        if index >= self.leaf_count {
            return Err(NodeError::Validation(format!(
                "transaction index {} out of bounds (leaf_count {})",
                index, self.leaf_count
            )));
        }

        let mut current = primitives::calculate_hash(transaction.id.as_bytes());
        for (sibling, direction) in &proof.path {
            current = match direction {
                Direction::Right => primitives::calculate_hash_concat(&[&current, sibling]),
                Direction::Left => primitives::calculate_hash_concat(&[sibling, &current]),
            };
        }

        Ok(current == expected_root)
    }

    pub fn size(&self) -> usize {
        self.to_json().map(|j| j.len()).unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(NodeError::from)
    }
}

impl MerkleProof {
    pub fn new() -> Self {
        MerkleProof { path: Vec::new() }
    }

    pub fn size(&self) -> usize {
        self.path.len() * (64 + 1)
    }
}

/// Build the full levels array (leaves through root) for proof lookups.
fn build_levels(mut level: Vec<String>) -> Vec<Vec<String>> {
    let mut levels = vec![level.clone()];
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            level.push(level.last().unwrap().clone());
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(primitives::calculate_hash_concat(&[&pair[0], &pair[1]]));
        }
        levels.push(next.clone());
        level = next;
    }
    levels
}

/// Build the boxed node tree, mirroring `build_levels` for consumers that
/// want to walk node structure rather than the flat level arrays.
fn build_node_tree(leaves: Vec<String>) -> Result<MerkleNode> {
    let mut nodes: Vec<MerkleNode> = leaves
        .into_iter()
        .map(|hash| MerkleNode {
            hash,
            left: None,
            right: None,
            is_leaf: true,
        })
        .collect();

    loop {
        if nodes.len() == 1 {
            return Ok(nodes.remove(0));
        }
        if nodes.len() % 2 != 0 {
            nodes.push(nodes.last().unwrap().clone());
        }
        let mut next_level = Vec::with_capacity(nodes.len() / 2);
        for chunk in nodes.chunks(2) {
            let left = chunk[0].clone();
            let right = chunk[1].clone();
            let hash = primitives::calculate_hash_concat(&[&left.hash, &right.hash]);
            next_level.push(MerkleNode {
                hash,
                left: Some(Box::new(left)),
                right: Some(Box::new(right)),
                is_leaf: false,
            });
        }
        nodes = next_level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn tx(sender: &str, receiver: &str, nonce: u64) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            sender.to_string(),
            receiver.to_string(),
            100,
            1,
            vec![],
            nonce,
            0,
        )
        .unwrap()
    }

    #[test]
    fn empty_tree_has_no_root() {
        let tree = MerkleTree::new(&[]).unwrap();
        assert!(tree.root.is_none());
        assert_eq!(tree.leaf_count, 0);
    }

    #[test]
    fn single_transaction_proof_verifies() {
        let t = tx("alice", "bob", 0);
        let tree = MerkleTree::new(&[t.clone()]).unwrap();
        let proof = tree.generate_proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(tree.verify_transaction(&t, &proof, 0).unwrap());
    }

    #[test]
    fn odd_sized_tree_all_proofs_verify() {
        let txs = vec![
            tx("alice", "bob", 0),
            tx("bob", "carol", 1),
            tx("carol", "alice", 2),
        ];
        let tree = MerkleTree::new(&txs).unwrap();
        for (i, t) in txs.iter().enumerate() {
            let proof = tree.generate_proof(i).unwrap();
            assert!(tree.verify_transaction(t, &proof, i).unwrap());
        }
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let txs = vec![tx("alice", "bob", 0), tx("bob", "carol", 1)];
        let tree = MerkleTree::new(&txs).unwrap();
        let mut proof = tree.generate_proof(0).unwrap();
        if let Some(first) = proof.path.first_mut() {
            first.0 = "0".repeat(64);
        }
        assert!(!tree.verify_transaction(&txs[0], &proof, 0).unwrap());
    }

    #[test]
    fn out_of_bounds_index_errors() {
        let txs = vec![tx("alice", "bob", 0)];
        let tree = MerkleTree::new(&txs).unwrap();
        assert!(tree.generate_proof(5).is_err());
    }
}
