//! RingCache Simulator - drives cache, ring and collapsing workloads

mod workload;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ringcache::CacheConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache capacity (number of items), overrides the config file
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Virtual replicas per node, overrides the config file
    #[arg(long, global = true)]
    replicas: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a skewed read-through workload against the LRU cache
    Lru {
        /// Number of requests
        #[arg(long, default_value_t = 100_000)]
        requests: usize,

        /// Number of distinct keys
        #[arg(long, default_value_t = 1_000)]
        key_space: u64,

        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Report key distribution over ring nodes and the keys moved by a removal
    Ring {
        /// Comma separated node ids
        #[arg(long, value_delimiter = ',', default_value = "server1,server2,server3")]
        nodes: Vec<String>,

        /// Number of keys to place
        #[arg(long, default_value_t = 10_000)]
        keys: usize,

        /// Node to remove after placement
        #[arg(long)]
        remove: Option<String>,
    },

    /// Fire concurrent callers at one missing key
    Collapse {
        /// Number of concurrent callers
        #[arg(long, default_value_t = 50)]
        callers: usize,

        /// Origin latency in milliseconds
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,

        /// Use tokio tasks instead of threads
        #[arg(long = "async")]
        use_async: bool,
    },
}

/// Load the config file if given, then apply flag overrides
fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(replicas) = args.replicas {
        config.replicas = replicas;
    }
    config.validate().context("invalid configuration")?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Starting RingCache Simulator v{}", env!("CARGO_PKG_VERSION"));
    info!("Node: {}", config.node_id);
    info!("Cache capacity: {}", config.capacity);
    info!("Replicas per node: {}", config.replicas);

    let report = match args.command {
        Command::Lru {
            requests,
            key_space,
            seed,
        } => serde_json::to_value(workload::run_lru(&config, requests, key_space, seed)?)?,
        Command::Ring {
            nodes,
            keys,
            remove,
        } => serde_json::to_value(workload::run_ring(&config, &nodes, keys, remove.as_deref())?)?,
        Command::Collapse {
            callers,
            delay_ms,
            use_async,
        } => {
            let delay = Duration::from_millis(delay_ms);
            let report = if use_async {
                workload::run_collapse_async(&config, callers, delay).await?
            } else {
                tokio::task::spawn_blocking(move || workload::run_collapse(&config, callers, delay))
                    .await
                    .context("collapse workload panicked")??
            };
            serde_json::to_value(report)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
