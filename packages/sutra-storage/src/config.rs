//! Engine configuration and deployment metadata
//!
//! Resolution precedence: command-line flag > environment variable >
//! config file > built-in default. The clap layer handles flag vs env;
//! this module merges the optional JSON config file and the defaults, and
//! owns `meta.json`, which pins the deployment-wide embedding dimension
//! and shard count once data exists.

use crate::reconciler::AdaptiveReconcilerConfig;
use crate::types::current_timestamp_us;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_BIND: &str = "0.0.0.0:50051";
pub const DEFAULT_SHARDS: u32 = 1;
pub const DEFAULT_DIMENSION: usize = 768;
pub const META_VERSION: u32 = 0;

/// Shard counts the router supports
pub const VALID_SHARD_COUNTS: [u32; 4] = [1, 4, 8, 16];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fully resolved engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub bind: SocketAddr,
    pub shards: u32,
    pub dimension: usize,
    pub embedding_url: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Permits plaintext on non-loopback binds
    pub dev_mode: bool,
    pub write_log_capacity: usize,
    /// Per-shard concept quota
    pub max_concepts: Option<u64>,
    /// Continue past mid-log WAL corruption instead of refusing to start
    pub force_recovery: bool,
    pub reconciler: AdaptiveReconcilerConfig,
}

/// Optional JSON config file; every field may be omitted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub shards: Option<u32>,
    pub dimension: Option<usize>,
    pub embedding_url: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub write_log_capacity: Option<usize>,
    pub max_concepts: Option<u64>,
    pub reconciler: Option<AdaptiveReconcilerConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| ConfigError::Invalid(format!("config file {}: {}", path.display(), e)))
    }
}

impl EngineConfig {
    /// Merge CLI-resolved values (flag or env, via clap) with the config
    /// file and defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        data_dir: PathBuf,
        bind: Option<String>,
        shards: Option<u32>,
        dimension: Option<usize>,
        embedding_url: Option<String>,
        tls_cert: Option<PathBuf>,
        tls_key: Option<PathBuf>,
        dev_mode: bool,
        force_recovery: bool,
        file: FileConfig,
    ) -> Result<Self, ConfigError> {
        let bind_str = bind
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind address '{}': {}", bind_str, e)))?;

        let shards = shards.or(file.shards).unwrap_or(DEFAULT_SHARDS);
        let dimension = dimension.or(file.dimension).unwrap_or(DEFAULT_DIMENSION);

        let config = Self {
            data_dir,
            bind,
            shards,
            dimension,
            embedding_url: embedding_url.or(file.embedding_url),
            tls_cert: tls_cert.or(file.tls_cert),
            tls_key: tls_key.or(file.tls_key),
            dev_mode,
            write_log_capacity: file.write_log_capacity.unwrap_or(100_000),
            max_concepts: file.max_concepts,
            force_recovery,
            reconciler: file.reconciler.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_SHARD_COUNTS.contains(&self.shards) {
            return Err(ConfigError::Invalid(format!(
                "shards must be one of {:?}, got {}",
                VALID_SHARD_COUNTS, self.shards
            )));
        }
        if self.dimension == 0 {
            return Err(ConfigError::Invalid("dimension must be > 0".into()));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls-cert and tls-key must be provided together".into(),
            ));
        }
        if self.tls_cert.is_none() && !self.bind.ip().is_loopback() && !self.dev_mode {
            return Err(ConfigError::Invalid(format!(
                "plaintext on non-loopback bind {} requires --dev",
                self.bind
            )));
        }
        self.reconciler
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Deployment metadata pinned at data-dir creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    #[serde(rename = "D")]
    pub dimension: usize,
    pub shards: u32,
    pub version: u32,
    pub created_at: u64,
}

impl DeploymentMeta {
    /// Load `meta.json`, or create it on first start. An existing file must
    /// agree with the configured dimension and shard count.
    pub fn load_or_init(
        data_dir: &Path,
        dimension: usize,
        shards: u32,
    ) -> Result<Self, ConfigError> {
        let path = data_dir.join("meta.json");

        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let meta: DeploymentMeta = serde_json::from_str(&data)
                .map_err(|e| ConfigError::Corrupt(format!("meta.json: {}", e)))?;

            if meta.version != META_VERSION {
                return Err(ConfigError::Corrupt(format!(
                    "meta.json version {} unsupported",
                    meta.version
                )));
            }
            if meta.dimension != dimension {
                return Err(ConfigError::Invalid(format!(
                    "configured dimension {} does not match existing data (D={})",
                    dimension, meta.dimension
                )));
            }
            if meta.shards != shards {
                return Err(ConfigError::Invalid(format!(
                    "configured shards {} does not match existing data (shards={})",
                    shards, meta.shards
                )));
            }
            return Ok(meta);
        }

        std::fs::create_dir_all(data_dir)?;
        let meta = DeploymentMeta {
            dimension,
            shards,
            version: META_VERSION,
            created_at: current_timestamp_us(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(meta)
    }
}
