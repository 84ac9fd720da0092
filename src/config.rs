//! Runtime configuration for paged-kv-sync.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Model layout, paging, transport topology and driver knobs live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::sync::store::Device;
use crate::transfer::tensor::DType;
use crate::transfer::topology::TransportConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "paged-kv-sync", about = "KV cache sync driver for a cache-storage process")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override this process's transport rank.
    #[arg(long)]
    pub rank: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model KV layout.
    pub model: ModelConfig,

    /// Paging configuration.
    pub cache: CacheConfig,

    /// Transport topology.
    pub transport: TransportConfig,

    /// Sync driver settings.
    pub driver: DriverConfig,
}

/// KV layout of the model slice served by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// First layer held by this pipeline stage.
    pub start_layer: usize,

    /// One past the last layer held by this pipeline stage.
    pub end_layer: usize,

    /// Number of KV heads.
    pub num_heads: usize,

    /// Head dimension.
    pub head_size: usize,

    /// Hidden size of the model (width of the filler tensor).
    pub hidden_size: usize,

    /// Element type of KV tensors.
    pub dtype: DType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            start_layer: 0,
            end_layer: 32,
            num_heads: 8,
            head_size: 128,
            hidden_size: 4096,
            dtype: DType::F16,
        }
    }
}

impl ModelConfig {
    pub fn num_layers(&self) -> usize {
        self.end_layer.saturating_sub(self.start_layer)
    }

    /// Bytes of K and V for one token across all layers of this stage.
    pub fn kv_bytes_per_token(&self) -> usize {
        self.num_layers() * 2 * self.num_heads * self.head_size * self.dtype.size_in_bytes()
    }
}

/// Paged KV cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per block. Must match the block allocator's block size.
    pub block_size: usize,

    /// Physical blocks in the pool.
    pub num_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 4096,
        }
    }
}

/// Sync driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Deadline for one phase in seconds; `None` waits for the peer forever.
    pub phase_timeout_secs: Option<u64>,

    /// Device retrieved KV tensors are materialized on.
    pub device: Device,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            phase_timeout_secs: None,
            device: Device::Cpu,
        }
    }
}

impl DriverConfig {
    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject layouts that would make slot or tensor arithmetic meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.model.end_layer > self.model.start_layer,
            "model.end_layer ({}) must exceed model.start_layer ({})",
            self.model.end_layer,
            self.model.start_layer
        );
        anyhow::ensure!(self.model.num_heads > 0, "model.num_heads must be positive");
        anyhow::ensure!(self.model.head_size > 0, "model.head_size must be positive");
        anyhow::ensure!(self.cache.block_size > 0, "cache.block_size must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.block_size, 16);
        assert_eq!(cfg.model.num_layers(), 32);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_kv_bytes_per_token() {
        let cfg = Config::default();
        // layers(32) * K+V(2) * heads(8) * head_size(128) * fp16(2)
        assert_eq!(cfg.model.kv_bytes_per_token(), 32 * 2 * 8 * 128 * 2);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"cache":{"block_size":32,"num_blocks":8}}"#).unwrap();
        assert_eq!(cfg.cache.block_size, 32);
        assert_eq!(cfg.model.dtype, DType::F16);
        assert_eq!(cfg.transport.tag, 24_857_323);
        assert!(cfg.driver.phase_timeout().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"transport":{"tag":7,"rank":0,"world_size":2,"send_peer":1,"recv_peer":1,
                "endpoints":[{"rank":0,"addr":"127.0.0.1:4000"},{"rank":1,"addr":"127.0.0.1:4001"}],
                "groups":[{"name":"world","ranks":[0,1]}],"link_group":"world",
                "connect_retries":3,"connect_backoff_ms":10},
               "driver":{"phase_timeout_secs":30,"device":"cpu"}}"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.transport.tag, 7);
        assert_eq!(cfg.transport.send_peer, 1);
        assert_eq!(cfg.driver.phase_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.cache.block_size, 16);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.model.num_heads, 8);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cache":{"block_size":0,"num_blocks":1}}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_empty_layer_range_rejected() {
        let mut cfg = Config::default();
        cfg.model.end_layer = cfg.model.start_layer;
        assert!(cfg.validate().is_err());
    }
}
