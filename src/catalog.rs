// =============================================================================
// Symbol Catalog — cached exchange instrument metadata
// =============================================================================
//
// Loaded once at startup. If the startup load fails the catalog degrades to a
// pass-through that verifies each symbol against the exchange on first use —
// degraded mode never silently accepts a symbol the exchange does not list.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::exchange::{ExchangeClient, SymbolInfo};

pub struct SymbolCatalog {
    symbols: RwLock<HashMap<String, SymbolInfo>>,
    loaded: AtomicBool,
}

impl SymbolCatalog {
    pub fn new() -> Self {
        Self { symbols: RwLock::new(HashMap::new()), loaded: AtomicBool::new(false) }
    }

    /// Populate the cache from the exchange. Failure leaves the catalog in
    /// degraded pass-through mode.
    pub async fn load(&self, client: &dyn ExchangeClient) -> Result<usize> {
        match client.all_symbols().await {
            Ok(infos) => {
                let count = infos.len();
                let mut map = self.symbols.write();
                map.clear();
                for info in infos {
                    map.insert(info.symbol.clone(), info);
                }
                drop(map);
                self.loaded.store(true, Ordering::SeqCst);
                info!(count, "symbol catalog loaded");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "symbol catalog load failed — degrading to per-symbol lookups");
                Err(e)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.read().contains_key(symbol)
    }

    pub fn info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.symbols.read().get(symbol).cloned()
    }

    /// Insert or replace one entry (startup seeding and tests).
    pub fn insert(&self, info: SymbolInfo) {
        self.symbols.write().insert(info.symbol.clone(), info);
    }

    /// Rewrite `BASE+signal_suffix` into `BASE+execution_suffix` when the two
    /// suffixes differ and the base form is non-empty.
    pub fn normalize(&self, symbol: &str, signal_suffix: &str, execution_suffix: &str) -> String {
        if signal_suffix == execution_suffix {
            return symbol.to_string();
        }
        match symbol.strip_suffix(signal_suffix) {
            Some(base) if !base.is_empty() => format!("{base}{execution_suffix}"),
            _ => symbol.to_string(),
        }
    }

    /// Metadata for `symbol`, honouring degraded mode: when the startup load
    /// failed, existence is re-verified against the exchange and cached.
    pub async fn resolve(&self, client: &dyn ExchangeClient, symbol: &str) -> Option<SymbolInfo> {
        if let Some(info) = self.info(symbol) {
            return Some(info);
        }
        if self.is_loaded() {
            // The full listing is authoritative; an absent symbol is unknown.
            return None;
        }

        match client.symbol_info(symbol).await {
            Ok(info) => {
                self.insert(info.clone());
                Some(info)
            }
            Err(e) => {
                warn!(symbol, error = %e, "symbol verification failed in degraded mode");
                None
            }
        }
    }
}

impl Default for SymbolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;

    #[tokio::test]
    async fn load_populates_cache() {
        let exchange = MockExchange::new();
        exchange.add_symbol(MockExchange::basic_info("BTCUSDT"));
        exchange.add_symbol(MockExchange::basic_info("ETHUSDT"));

        let catalog = SymbolCatalog::new();
        let count = catalog.load(&exchange).await.unwrap();
        assert_eq!(count, 2);
        assert!(catalog.is_loaded());
        assert!(catalog.contains("BTCUSDT"));
        assert!(!catalog.contains("DOGEUSDT"));
        assert_eq!(catalog.info("ETHUSDT").unwrap().symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn loaded_catalog_rejects_unknown_symbols() {
        let exchange = MockExchange::new();
        exchange.add_symbol(MockExchange::basic_info("BTCUSDT"));

        let catalog = SymbolCatalog::new();
        catalog.load(&exchange).await.unwrap();

        // Present even though the mock would answer symbol_info for it later.
        exchange.add_symbol(MockExchange::basic_info("NEWUSDT"));
        assert!(catalog.resolve(&exchange, "NEWUSDT").await.is_none());
    }

    #[tokio::test]
    async fn degraded_mode_verifies_against_exchange() {
        let exchange = MockExchange::new();
        exchange.add_symbol(MockExchange::basic_info("BTCUSDT"));

        // No load() — catalog is in degraded mode.
        let catalog = SymbolCatalog::new();
        assert!(!catalog.is_loaded());

        let info = catalog.resolve(&exchange, "BTCUSDT").await.unwrap();
        assert_eq!(info.symbol, "BTCUSDT");
        // Result is cached for subsequent lookups.
        assert!(catalog.contains("BTCUSDT"));

        // Non-existent symbols are still refused.
        assert!(catalog.resolve(&exchange, "FAKEUSDT").await.is_none());
    }

    #[test]
    fn normalize_swaps_suffix() {
        let catalog = SymbolCatalog::new();
        assert_eq!(catalog.normalize("BTCBUSD", "BUSD", "USDT"), "BTCUSDT");
        // Same suffix: untouched.
        assert_eq!(catalog.normalize("BTCUSDT", "USDT", "USDT"), "BTCUSDT");
        // Suffix-only symbol: base would be empty, untouched.
        assert_eq!(catalog.normalize("BUSD", "BUSD", "USDT"), "BUSD");
        // Foreign suffix: untouched.
        assert_eq!(catalog.normalize("BTCUSDC", "BUSD", "USDT"), "BTCUSDC");
    }
}
