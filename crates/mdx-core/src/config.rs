//! Configuration parsing for the market-data publisher.
//!
//! The producer reads a single JSON file. Optional fields fall back to
//! defaults through the `effective_*` accessors so a minimal config only has
//! to name its book caches and sources.
//!
//! # Example config
//!
//! ```json
//! {
//!   "module": { "module_name": "mdx_pub", "log_path": "/tmp/log" },
//!   "publisher": { "name": "mdx", "port": 9100, "heartbeat_interval_ms": 1000 },
//!   "book_caches": [{
//!     "name": "futures",
//!     "symbol_data_file": "/dev/shm/mdx.symbols",
//!     "num_products": 4096,
//!     "exchanges": [{ "exchange": 1, "depth": 5 }, { "exchange": 5, "depth": 5 }]
//!   }],
//!   "sources": [{ "exchange": 1, "cpu_affinity": 3, "instruments": ["IF2406"] }]
//! }
//! ```

use std::{net::SocketAddr, path::Path};

use serde::Deserialize;

use crate::{
    book::ExchangeDepth,
    error::{MdxError, Result},
    shm::DEFAULT_SHM_DIR,
    symbol_table::DEFAULT_CAPACITY,
};

pub const DEFAULT_PUBLISHER_NAME: &str = "mdx";
pub const DEFAULT_PORT: u16 = 9100;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_MISSING_HEARTBEATS: u32 = 5;
pub const MIN_HOUSE_KEEPING_INTERVAL_MS: u64 = 20;
pub const MAX_HOUSE_KEEPING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_HOUSE_KEEPING_BATCH: usize = 50;
pub const DEFAULT_QUEUE_SIZE: usize = 16 * 1024 * 1024;

/// Top-level config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub module: Option<ModuleMeta>,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub book_caches: Vec<BookCacheConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Control channel and session settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublisherConfig {
    /// Prefix for ring segment names.
    pub name: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub heartbeat_interval_ms: Option<u64>,
    pub max_missing_heartbeats: Option<u32>,
    pub house_keeping_interval_ms: Option<u64>,
    /// Maximum queued subscribe/unsubscribe commands executed per tick.
    pub house_keeping_batch: Option<usize>,
    /// Ring capacity in bytes per consumer queue.
    pub queue_size: Option<usize>,
    pub shm_dir: Option<String>,
    /// Emit book-changed events on every update, not just refreshes.
    pub send_book_update: Option<bool>,
}

impl PublisherConfig {
    pub fn effective_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| DEFAULT_PUBLISHER_NAME.to_string())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip = self.ip.as_deref().unwrap_or("127.0.0.1");
        let port = self.port.unwrap_or(DEFAULT_PORT);
        format!("{ip}:{port}")
            .parse()
            .map_err(|e| MdxError::Config(format!("bad listen address {ip}:{port}: {e}")))
    }

    pub fn effective_heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS).max(1)
    }

    pub fn effective_max_missing_heartbeats(&self) -> u32 {
        self.max_missing_heartbeats.unwrap_or(DEFAULT_MAX_MISSING_HEARTBEATS).max(1)
    }

    pub fn effective_house_keeping_interval_ms(&self) -> u64 {
        self.house_keeping_interval_ms
            .unwrap_or(MIN_HOUSE_KEEPING_INTERVAL_MS)
            .clamp(MIN_HOUSE_KEEPING_INTERVAL_MS, MAX_HOUSE_KEEPING_INTERVAL_MS)
    }

    pub fn effective_house_keeping_batch(&self) -> usize {
        self.house_keeping_batch.unwrap_or(DEFAULT_HOUSE_KEEPING_BATCH).max(1)
    }

    /// Queue capacity rounded up to a power of two.
    pub fn effective_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE).max(1024).next_power_of_two()
    }

    pub fn effective_shm_dir(&self) -> String {
        self.shm_dir.clone().unwrap_or_else(|| DEFAULT_SHM_DIR.to_string())
    }

    pub fn effective_send_book_update(&self) -> bool {
        self.send_book_update.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeDepthConfig {
    pub exchange: u16,
    pub depth: u8,
}

/// One shared book cache and the symbol table its locators come from.
#[derive(Debug, Clone, Deserialize)]
pub struct BookCacheConfig {
    pub name: String,
    pub symbol_data_file: String,
    pub symbol_capacity: Option<u32>,
    /// Product slots; defaults to the symbol table capacity.
    pub num_products: Option<u16>,
    pub exchanges: Vec<ExchangeDepthConfig>,
    /// Writer lock timeout in TSC cycles.
    pub write_timeout_cycles: Option<u64>,
}

impl BookCacheConfig {
    pub fn effective_symbol_capacity(&self) -> u32 {
        self.symbol_capacity.unwrap_or(DEFAULT_CAPACITY)
    }

    pub fn effective_num_products(&self) -> u16 {
        self.num_products
            .unwrap_or_else(|| self.effective_symbol_capacity().min(u16::MAX as u32) as u16)
    }

    pub fn exchange_depths(&self) -> Vec<ExchangeDepth> {
        self.exchanges.iter().map(|e| ExchangeDepth { exchange: e.exchange, depth: e.depth }).collect()
    }
}

/// One upstream data source, driven by its own market-data thread.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub exchange: u16,
    /// CPU core to pin the market-data thread to (-1 or absent: no pinning).
    pub cpu_affinity: Option<i32>,
    pub can_unsubscribe: Option<bool>,
    /// Tradable universe; empty accepts every symbol.
    #[serde(default)]
    pub instruments: Vec<String>,
}

impl SourceConfig {
    pub fn effective_can_unsubscribe(&self) -> bool {
        self.can_unsubscribe.unwrap_or(false)
    }
}

impl AppConfig {
    pub fn module_name(&self) -> String {
        self.module
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "mdx_pub".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.module.as_ref().and_then(|m| m.log_path.clone())
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.book_caches.is_empty() {
            return Err(MdxError::Config("at least one book cache is required".into()));
        }
        let mut seen = Vec::new();
        for cache in &self.book_caches {
            if cache.exchanges.is_empty() {
                return Err(MdxError::Config(format!("book cache {} has no exchanges", cache.name)));
            }
            if cache.effective_num_products() == 0 {
                return Err(MdxError::Config(format!("book cache {} has no product slots", cache.name)));
            }
            for e in &cache.exchanges {
                if e.depth == 0 {
                    return Err(MdxError::Config(format!("exchange {} in {} has zero depth", e.exchange, cache.name)));
                }
                if seen.contains(&e.exchange) {
                    return Err(MdxError::Config(format!("exchange {} is provisioned twice", e.exchange)));
                }
                seen.push(e.exchange);
            }
        }
        let mut sourced = Vec::new();
        for source in &self.sources {
            if !seen.contains(&source.exchange) {
                return Err(MdxError::Config(format!("source exchange {} has no book cache", source.exchange)));
            }
            // one writing thread per venue block
            if sourced.contains(&source.exchange) {
                return Err(MdxError::Config(format!("exchange {} has more than one source", source.exchange)));
            }
            sourced.push(source.exchange);
        }
        self.publisher.listen_addr()?;
        Ok(())
    }
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "module": { "module_name": "mdx_test" },
        "publisher": { "port": 9200, "house_keeping_interval_ms": 5, "queue_size": 5000 },
        "book_caches": [{
            "name": "futures",
            "symbol_data_file": "/tmp/x.symbols",
            "exchanges": [{ "exchange": 1, "depth": 5 }, { "exchange": 5, "depth": 10 }]
        }],
        "sources": [{ "exchange": 5, "cpu_affinity": 2 }]
    }"#;

    #[test]
    fn defaults_and_clamps() {
        let cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.module_name(), "mdx_test");
        assert_eq!(cfg.log_path(), None);

        let p = &cfg.publisher;
        assert_eq!(p.effective_name(), "mdx");
        assert_eq!(p.listen_addr().unwrap().port(), 9200);
        assert_eq!(p.effective_heartbeat_interval_ms(), 1000);
        assert_eq!(p.effective_max_missing_heartbeats(), 5);
        assert_eq!(p.effective_house_keeping_interval_ms(), 20);
        assert_eq!(p.effective_house_keeping_batch(), 50);
        assert_eq!(p.effective_queue_size(), 8192);
        assert!(p.effective_send_book_update());

        let cache = &cfg.book_caches[0];
        assert_eq!(cache.effective_symbol_capacity(), 8192);
        assert_eq!(cache.effective_num_products(), 8192);
        assert_eq!(cache.exchange_depths().len(), 2);
        assert!(!cfg.sources[0].effective_can_unsubscribe());
        assert!(cfg.sources[0].instruments.is_empty());
    }

    #[test]
    fn source_without_cache_is_rejected() {
        let mut cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        cfg.sources[0].exchange = 3;
        assert!(matches!(cfg.validate(), Err(MdxError::Config(_))));
    }

    #[test]
    fn duplicate_exchange_is_rejected() {
        let mut cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        let dup = cfg.book_caches[0].clone();
        cfg.book_caches.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn two_sources_for_one_exchange_are_rejected() {
        let mut cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        let dup = cfg.sources[0].clone();
        cfg.sources.push(dup);
        assert!(matches!(cfg.validate(), Err(MdxError::Config(_))));

        // venues sharing a cache may each have their own source
        cfg.sources[1].exchange = 1;
        cfg.validate().unwrap();
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdx.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.book_caches[0].name, "futures");

        std::fs::write(&path, "{").unwrap();
        assert!(load_config(&path).is_err());
    }
}
