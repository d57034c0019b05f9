//! Storage Server Binary
//!
//! Production TCP server for the Sutra storage engine.
//!
//! Exit codes: 0 ok, 1 config error, 2 corrupt data, 3 fatal I/O.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use sutra_storage::{
    build_acceptor, ConcurrentConfig, ConfigError, DeploymentMeta, EngineConfig, FileConfig,
    LearningPipeline, ShardConfig, ShardedStorage, StorageError, StorageServer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_CORRUPT: u8 = 2;
const EXIT_IO: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "storage-server", about = "Sutra knowledge graph storage server")]
struct Cli {
    /// Data directory (created on first start)
    #[arg(long, env = "SUTRA_DATA_DIR")]
    data_dir: PathBuf,

    /// Listen address, e.g. 0.0.0.0:50051
    #[arg(long)]
    bind: Option<String>,

    /// Number of shards; must match meta.json on existing data
    #[arg(long, env = "SUTRA_SHARDS")]
    shards: Option<u32>,

    /// Embedding dimension D; pinned in meta.json on first start
    #[arg(long)]
    dimension: Option<usize>,

    /// Embedding service base URL (enables LearnConceptV2 / LearnBatch)
    #[arg(long, env = "SUTRA_EMBEDDING_URL")]
    embedding_url: Option<String>,

    /// TLS certificate path (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key path (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Optional JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Allow plaintext on non-loopback binds
    #[arg(long)]
    dev: bool,

    /// Start even if the WAL has mid-log corruption (data past the damage
    /// is lost)
    #[arg(long)]
    force_recovery: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // SUTRA_LOG_LEVEL drives the filter; default info
    let filter = EnvFilter::try_from_env("SUTRA_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => match FileConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => FileConfig::default(),
    };

    let config = match EngineConfig::resolve(
        cli.data_dir,
        cli.bind,
        cli.shards,
        cli.dimension,
        cli.embedding_url,
        cli.tls_cert,
        cli.tls_key,
        cli.dev,
        cli.force_recovery,
        file_config,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!("starting sutra storage server");
    info!("  data dir: {}", config.data_dir.display());
    info!("  bind: {}", config.bind);
    info!("  shards: {}", config.shards);
    info!("  dimension: {}", config.dimension);
    if let Some(url) = &config.embedding_url {
        info!("  embedding service: {}", url);
    }

    // meta.json pins D and the shard count once data exists
    if let Err(e) = DeploymentMeta::load_or_init(&config.data_dir, config.dimension, config.shards)
    {
        error!("{}", e);
        return match e {
            ConfigError::Corrupt(_) => ExitCode::from(EXIT_CORRUPT),
            ConfigError::Invalid(_) => ExitCode::from(EXIT_CONFIG),
            ConfigError::Io(_) => ExitCode::from(EXIT_IO),
        };
    }

    let shard_config = ShardConfig {
        num_shards: config.shards,
        base_path: config.data_dir.clone(),
        shard_config: ConcurrentConfig::from_engine(&config, config.data_dir.clone()),
    };

    let storage = match ShardedStorage::open(shard_config) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!("failed to open storage: {}", e);
            return match e {
                StorageError::Corruption(_) => ExitCode::from(EXIT_CORRUPT),
                _ => ExitCode::from(EXIT_IO),
            };
        }
    };

    let stats = storage.stats();
    info!(
        "storage ready: {} concepts, {} edges across {} shards (generation {})",
        stats.total_concepts, stats.total_edges, stats.num_shards, stats.max_generation
    );

    let pipeline = match &config.embedding_url {
        Some(url) => match LearningPipeline::new(url.clone(), config.dimension) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                error!("failed to initialize learning pipeline: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => None,
    };

    let mut server = StorageServer::new(Arc::clone(&storage), pipeline);
    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        match build_acceptor(cert, key) {
            Ok(acceptor) => server = server.with_tls(acceptor),
            Err(e) => {
                error!("TLS setup failed: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    if let Err(e) = Arc::new(server).serve(config.bind).await {
        error!("server error: {}", e);
        return ExitCode::from(EXIT_IO);
    }

    info!("server shutdown complete");
    ExitCode::SUCCESS
}
