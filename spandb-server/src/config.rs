//! Server configuration file

use anyhow::Context;
use serde::Deserialize;
use spandb_core::backend::BackendConfig;
use spandb_core::cache::{BackgroundConfig, MemoryCacheConfig};
use spandb_core::compactor::CompactorConfig;
use spandb_core::db::DbConfig;
use spandb_core::ingester::IngesterConfig;
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    pub log: LogConfig,
    pub db: DbConfig,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub ingester: IngesterConfig,
    pub compactor: CompactorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3200)),
            log: LogConfig::default(),
            db: DbConfig::default(),
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
            ingester: IngesterConfig::default(),
            compactor: CompactorConfig::default(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Read cache in front of the backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub memory: MemoryCacheConfig,
    pub background: BackgroundConfig,
}

impl ServerConfig {
    /// Load from a TOML file; missing sections and fields take defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.cache.enabled {
            config.cache.background.policy().context("invalid [cache.background] section")?;
        }
        Ok(config)
    }
}
