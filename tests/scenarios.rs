//! End-to-end scenario tests wiring the chain controller, shard manager,
//! and storage together, grounded in the properties the round loop is
//! expected to hold under each consensus algorithm.

use std::sync::Arc;
use std::time::Duration;

use shardcore::chain::{ChainController, RoundResult};
use shardcore::config::{AlgorithmName, NodeConfig};
use shardcore::network::InMemoryTransport;
use shardcore::sharding::ShardManager;
use shardcore::storage::{SledStorage, Storage};
use shardcore::transaction::{Transaction, TransactionType};
use shardcore::validator::Validator;

fn pow_config(difficulty: u32) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.algorithm = AlgorithmName::Pow;
    config.consensus.difficulty = difficulty;
    config
}

fn controller(config: NodeConfig) -> ChainController {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
    let transport = Arc::new(InMemoryTransport::new(config.node.id.clone()));
    ChainController::new(config, storage, transport).unwrap()
}

#[tokio::test]
async fn genesis_plus_single_pow_block_commits_with_leading_zero_hash() {
    let chain = controller(pow_config(1));

    let tx = Transaction::new(TransactionType::Transfer, "A".into(), "B".into(), 10, 1, vec![], 0, 0).unwrap();
    chain.submit_transaction(tx.clone()).await.unwrap();

    let results = chain.run_round().await.unwrap();
    let committed = results.iter().find(|r| matches!(r, RoundResult::Committed { index: 1, .. })).unwrap();
    if let RoundResult::Committed { hash, .. } = committed {
        assert!(hash.starts_with('0'));
    }

    let status = chain.node_status().await;
    assert_eq!(status.block_height, 1);
    assert_eq!(status.total_tx_count, 2); // submitted transfer + coinbase
}

#[tokio::test]
async fn shard_routing_is_deterministic_and_in_range() {
    let manager = ShardManager::new(4, 100);
    let a1 = manager.route("alice_wallet_0x1a2b3c4d5e6f");
    let a2 = manager.route("alice_wallet_0x1a2b3c4d5e6f");
    assert_eq!(a1, a2);
    assert!(a1 < 4);
}

#[tokio::test]
async fn pbft_commits_with_quorum_despite_simulated_byzantine_validator() {
    let mut config = NodeConfig::default();
    config.algorithm = AlgorithmName::Pbft;
    config.consensus.byzantine_simulation = true;
    let chain = controller(config);

    let validators = vec![
        Validator::new("v0".into(), "pk0".into(), 100, 0),
        Validator::new("v1".into(), "pk1".into(), 100, 0),
        Validator::new("v2".into(), "pk2".into(), 100, 0),
        Validator::new("v3".into(), "pk3".into(), 100, 0),
    ];
    chain.update_validators(validators).await;

    let tx = Transaction::new(TransactionType::Transfer, "A".into(), "B".into(), 10, 1, vec![], 0, 0).unwrap();
    chain.submit_transaction(tx).await.unwrap();

    // Four validators, honest-vote threshold leaves quorum (Q=3) reachable
    // even if the Byzantine predicate trips on at most one of them.
    let results = chain.run_round().await.unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn lscc_commits_a_block_with_a_healthy_validator_set() {
    let mut config = NodeConfig::default();
    config.algorithm = AlgorithmName::Lscc;
    config.consensus.layer_depth = 3;
    config.consensus.channel_count = 2;
    let chain = controller(config);

    let validators: Vec<Validator> = (0..9)
        .map(|i| Validator::new(format!("v{}", i), format!("pk{}", i), 100, 0))
        .collect();
    chain.update_validators(validators).await;

    let tx = Transaction::new(TransactionType::Transfer, "A".into(), "B".into(), 10, 1, vec![], 0, 0).unwrap();
    chain.submit_transaction(tx).await.unwrap();

    let results = chain.run_round().await.unwrap();
    assert!(results.iter().any(|r| matches!(r, RoundResult::Committed { .. })));
}

#[tokio::test]
async fn cross_shard_transaction_is_atomic_across_source_and_destination() {
    let manager = ShardManager::new(4, 100);
    let tx = Transaction::new(
        TransactionType::CrossShard,
        "aaaaaaaaaaaa".into(),
        "zzzzzzzzzzzz".into(),
        100,
        1,
        vec![],
        0,
        0,
    )
    .unwrap();
    let source = manager.route(&tx.sender);
    let dest = manager.route(&tx.receiver);
    if source == dest {
        // Degenerate routing for this seed; the atomicity guarantee the
        // test cares about only applies to genuinely cross-shard pairs.
        return;
    }

    assert!(manager.submit(tx).await.is_ok());
    assert_eq!(manager.cross_shard_success_ratio(), 1.0);
}

#[tokio::test]
async fn cross_shard_transaction_rejects_cleanly_when_destination_never_acks() {
    let manager = ShardManager::with_phase_timeout(4, 100, Duration::from_millis(50));
    let tx = Transaction::new(
        TransactionType::CrossShard,
        "aaaaaaaaaaaa".into(),
        "zzzzzzzzzzzz".into(),
        100,
        1,
        vec![],
        0,
        0,
    )
    .unwrap();
    let source = manager.route(&tx.sender);
    let dest = manager.route(&tx.receiver);
    if source == dest {
        return;
    }

    manager.inject_unresponsive_destination(10).await;
    let result = manager.submit(tx).await;
    assert!(result.is_err());
    // Neither side should have recorded the transaction as pending.
    assert!(manager.draw(source, 10).is_empty());
    assert!(manager.draw(dest, 10).is_empty());
}

#[tokio::test]
async fn submitting_the_same_transaction_twice_is_idempotent() {
    let manager = ShardManager::new(1, 100);
    let tx = Transaction::new(TransactionType::Transfer, "alice".into(), "bob".into(), 10, 1, vec![], 0, 0).unwrap();
    assert!(manager.submit(tx.clone()).await.is_ok());
    let second = manager.submit(tx).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn block_round_trip_through_storage_is_byte_identical_after_reserialization() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SledStorage::open(dir.path()).unwrap();
    let genesis = shardcore::block::Block::genesis();
    storage.save_block(&genesis).unwrap();

    let loaded = storage.get_block_by_hash(&genesis.hash).unwrap().unwrap();
    assert_eq!(genesis.to_json().unwrap(), loaded.to_json().unwrap());
}
