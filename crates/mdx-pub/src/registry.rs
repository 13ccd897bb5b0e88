//! Book caches and symbol tables keyed by exchange.
//!
//! The registry is built once at startup and passed explicitly to the
//! publisher and every market-data source, so tests can run several
//! independent instances side by side.

use std::{path::Path, sync::Arc};

use ahash::AHashMap;
use mdx_core::{
    book_cache::SharedBookCache,
    config::AppConfig,
    error::{MdxError, Result},
    lock::DEFAULT_TIMEOUT_CYCLES,
    shm::shm_path,
    symbol_table::{OpenMode, SymbolTable},
};
use tracing::info;

use crate::consumer::CacheGrant;

/// One book cache and the symbol table its locators come from.
#[derive(Clone)]
pub struct CacheEntry {
    pub cache: Arc<SharedBookCache>,
    pub symbols: Arc<SymbolTable>,
    pub write_timeout_cycles: u64,
}

#[derive(Default)]
pub struct CacheRegistry {
    entries: Vec<CacheEntry>,
    by_exchange: AHashMap<u16, usize>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` for every exchange its cache provisions.
    pub fn insert(&mut self, entry: CacheEntry) -> Result<()> {
        let exchanges: Vec<u16> = entry.cache.layout().venues().iter().map(|v| v.exchange).collect();
        if let Some(dup) = exchanges.iter().find(|e| self.by_exchange.contains_key(*e)) {
            return Err(MdxError::Config(format!("exchange {dup} already has a book cache")));
        }
        let index = self.entries.len();
        for exchange in exchanges {
            self.by_exchange.insert(exchange, index);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Create every configured cache under `shm_dir` and open its symbol
    /// table read-write. Any failure is fatal for the producer.
    pub fn from_config(config: &AppConfig, shm_dir: &Path) -> Result<Self> {
        let prefix = config.publisher.effective_name();
        let mut registry = Self::new();
        for cfg in &config.book_caches {
            let path = shm_path(shm_dir, &format!("{prefix}.{}", cfg.name));
            let cache = SharedBookCache::create(&path, &cfg.exchange_depths(), cfg.effective_num_products())?;
            let symbols = SymbolTable::open_with_capacity(
                &cfg.symbol_data_file,
                OpenMode::ReadWrite,
                cfg.effective_symbol_capacity(),
            )?;
            info!(
                "[registry] cache {} at {} with symbol table {} ({} symbols)",
                cfg.name,
                path.display(),
                cfg.symbol_data_file,
                symbols.count()
            );
            registry.insert(CacheEntry {
                cache: Arc::new(cache),
                symbols: Arc::new(symbols),
                write_timeout_cycles: cfg.write_timeout_cycles.unwrap_or(DEFAULT_TIMEOUT_CYCLES),
            })?;
        }
        Ok(registry)
    }

    pub fn get(&self, exchange: u16) -> Option<&CacheEntry> {
        self.by_exchange.get(&exchange).map(|&i| &self.entries[i])
    }

    pub fn has_exchange(&self, exchange: u16) -> bool {
        self.by_exchange.contains_key(&exchange)
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// What a consumer is told about in the connect response: one grant per
    /// provisioned exchange.
    pub fn grants(&self) -> Vec<CacheGrant> {
        let mut grants = Vec::new();
        for entry in &self.entries {
            for venue in entry.cache.layout().venues() {
                grants.push(CacheGrant {
                    exchange: venue.exchange,
                    path: entry.cache.path().to_path_buf(),
                    size: entry.cache.size() as u64,
                });
            }
        }
        grants
    }
}

#[cfg(test)]
mod tests {
    use mdx_core::book::ExchangeDepth;

    use super::*;

    fn entry(dir: &Path, name: &str, exchanges: &[u16]) -> CacheEntry {
        let depths: Vec<_> = exchanges.iter().map(|&exchange| ExchangeDepth { exchange, depth: 2 }).collect();
        CacheEntry {
            cache: Arc::new(SharedBookCache::create(dir.join(name), &depths, 4).unwrap()),
            symbols: Arc::new(SymbolTable::open(dir.join(format!("{name}.symbols")), OpenMode::ReadWrite).unwrap()),
            write_timeout_cycles: 1_000,
        }
    }

    #[test]
    fn lookup_by_exchange_and_grants() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = CacheRegistry::new();
        reg.insert(entry(dir.path(), "a", &[1, 5])).unwrap();
        reg.insert(entry(dir.path(), "b", &[3])).unwrap();

        assert!(reg.has_exchange(5));
        assert!(!reg.has_exchange(2));
        assert!(Arc::ptr_eq(&reg.get(1).unwrap().cache, &reg.get(5).unwrap().cache));

        let grants = reg.grants();
        assert_eq!(grants.iter().map(|g| g.exchange).collect::<Vec<_>>(), vec![1, 5, 3]);
        assert!(grants[2].path.ends_with("b"));
    }

    #[test]
    fn exchange_cannot_be_provisioned_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = CacheRegistry::new();
        reg.insert(entry(dir.path(), "a", &[1])).unwrap();
        assert!(matches!(reg.insert(entry(dir.path(), "b", &[1])), Err(MdxError::Config(_))));
    }

    #[test]
    fn builds_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{
                "publisher": {{ "name": "t" }},
                "book_caches": [{{
                    "name": "fut",
                    "symbol_data_file": "{}",
                    "symbol_capacity": 64,
                    "num_products": 16,
                    "exchanges": [{{ "exchange": 5, "depth": 3 }}]
                }}]
            }}"#,
            dir.path().join("fut.symbols").display()
        );
        let config: AppConfig = serde_json::from_str(&json).unwrap();
        let reg = CacheRegistry::from_config(&config, dir.path()).unwrap();
        let entry = reg.get(5).unwrap();
        assert_eq!(entry.cache.capacity(), 16);
        assert_eq!(entry.symbols.capacity(), 64);
        assert!(entry.cache.path().ends_with("t.fut"));
        assert_eq!(entry.write_timeout_cycles, DEFAULT_TIMEOUT_CYCLES);
    }
}
