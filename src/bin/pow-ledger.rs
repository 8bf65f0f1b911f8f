//! pow-ledger: boot a node from a data directory, mine, and flush state

use anyhow::Context;
use clap::{Parser, Subcommand};
use pow_ledger::mining::Miner;
use pow_ledger::storage::{recover, Storage};
use pow_ledger::{Address, ConsensusParams, Node, NodeConfig, NoopRelay, PayoutAddressSource};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pow-ledger", about = "Proof-of-work UTXO ledger node")]
struct Cli {
    /// JSON config file; defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the config file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use regtest consensus parameters
    #[arg(long, global = true)]
    regtest: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mine blocks to an address, then flush state to disk
    Mine {
        /// Payout address (40 hex characters)
        #[arg(long)]
        address: String,
        /// Stop after this many blocks
        #[arg(long, default_value_t = 1)]
        blocks: u64,
    },
    /// Print chain information as JSON
    Info,
    /// Print an address balance
    Balance { address: String },
    /// Replay the persisted chain and report where it was recovered from
    Verify,
    /// Copy the current chain file into the backup directory
    Backup,
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if cli.regtest {
        config.consensus = ConsensusParams::regtest();
        config.mempool = pow_ledger::MempoolPolicy::regtest();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn parse_address(s: &str) -> anyhow::Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow::anyhow!("invalid address {:?}: {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pow_ledger::telemetry::init(&cli.log);
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Mine { address, blocks } => {
            let payout: Arc<dyn PayoutAddressSource> = Arc::new(parse_address(address)?);
            let (node, source) = Node::open(config, Arc::new(NoopRelay)).context("opening node")?;
            tracing::info!(?source, height = node.height(), "starting miner");
            let node = Arc::new(node);
            let mined = Miner::spawn(Arc::clone(&node), payout, Some(*blocks))
                .context("spawning miner")?
                .join();
            node.shutdown().context("flushing chain state")?;
            println!("{}", serde_json::to_string_pretty(&node.get_chain_info())?);
            tracing::info!(mined, "done");
        }
        Commands::Info => {
            let (node, _) = Node::open(config, Arc::new(NoopRelay)).context("opening node")?;
            println!("{}", serde_json::to_string_pretty(&node.get_chain_info())?);
        }
        Commands::Balance { address } => {
            let address = parse_address(address)?;
            let (node, _) = Node::open(config, Arc::new(NoopRelay)).context("opening node")?;
            println!("{}", node.get_balance(&address));
        }
        Commands::Verify => {
            let storage = Storage::open(&config.data_dir, config.backup_retention)?;
            if storage.detect_corruption() {
                tracing::warn!("chain file is corrupt");
            }
            let (chain, source) = recover(
                &storage,
                &config.consensus,
                config.orphan_limit,
                config.orphan_ttl_secs,
            );
            println!("recovered height {} from {:?}", chain.height(), source);
        }
        Commands::Backup => {
            let storage = Storage::open(&config.data_dir, config.backup_retention)?;
            let path = storage.backup().context("writing backup")?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
