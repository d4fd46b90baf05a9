use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};

use shardcore::chain::ChainController;
use shardcore::config::{AlgorithmName, NodeConfig};
use shardcore::network::InMemoryTransport;
use shardcore::storage::SledStorage;
use shardcore::transaction::{Transaction, TransactionType};

/// Thin CLI entry point. Flag parsing, config-file loading, and process
/// hosting beyond the exit codes in `config::ExitCode` are collaborator
/// concerns out of scope for the core; this binary just wires it together.
#[derive(Parser)]
#[command(name = "shardcore", version, about = "Multi-algorithm sharded consensus node")]
struct Cli {
    #[arg(long, default_value = "pow")]
    algorithm: String,

    #[arg(long, default_value_t = 4)]
    num_shards: u32,

    #[arg(long, default_value = "./data")]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the round loop for a fixed number of ticks.
    Run {
        #[arg(long, default_value_t = 10)]
        rounds: u64,
    },
    /// Submit one transfer transaction and report the result.
    Submit { sender: String, receiver: String, amount: u64 },
    /// Print node status as JSON.
    Status,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();

    let cli = Cli::parse();

    let mut config = NodeConfig::default();
    config.sharding.num_shards = cli.num_shards;
    config.algorithm = match cli.algorithm.as_str() {
        "pow" => AlgorithmName::Pow,
        "pos" => AlgorithmName::Pos,
        "pbft" => AlgorithmName::Pbft,
        "ppbft" => AlgorithmName::Ppbft,
        "lscc" => AlgorithmName::Lscc,
        other => {
            error!("unknown consensus algorithm: {}", other);
            std::process::exit(2);
        }
    };

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        std::process::exit(2);
    }

    let storage = match SledStorage::open(&cli.data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open storage at {}: {}", cli.data_dir, e);
            std::process::exit(3);
        }
    };
    let transport = Arc::new(InMemoryTransport::new(config.node.id.clone()));

    let chain = match ChainController::new(config, storage, transport) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("failed to initialize consensus: {}", e);
            std::process::exit(4);
        }
    };

    match cli.command {
        Command::Run { rounds } => {
            chain.set_running(true);
            for i in 0..rounds {
                match chain.run_round().await {
                    Ok(results) => info!("round {}: {:?}", i, results),
                    Err(e) => error!("round {} failed: {}", i, e),
                }
            }
            chain.request_shutdown();
        }
        Command::Submit { sender, receiver, amount } => {
            match Transaction::new(TransactionType::Transfer, sender, receiver, amount, 1, Vec::new(), 0, 0) {
                Ok(tx) => match chain.submit_transaction(tx).await {
                    Ok(()) => info!("transaction submitted"),
                    Err(e) => error!("submission failed: {}", e),
                },
                Err(e) => error!("invalid transaction: {}", e),
            }
        }
        Command::Status => {
            let status = chain.node_status().await;
            match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("failed to serialize status: {}", e),
            }
        }
    }
}
