//! Upstream feed boundary.
//!
//! A [`FeedAdapter`] is whatever turns a venue's API into ticker mutations.
//! It lives on the market-data thread next to the tickers it drives, so it
//! only needs to be `Send`.

use ahash::{AHashMap, AHashSet};
use tracing::{debug, info};

use crate::ticker::Ticker;

/// Live tickers of one source, keyed by symbol.
pub type TickerMap = AHashMap<String, Ticker>;

pub trait FeedAdapter: Send {
    fn name(&self) -> &str;

    /// `false` while the upstream session is down; subscriptions are held
    /// back until it comes up.
    fn is_ready(&self) -> bool;

    /// Request `symbol` upstream. `false` means the venue does not list it.
    fn subscribe(&mut self, symbol: &str) -> bool;

    fn unsubscribe(&mut self, symbol: &str);

    /// Apply whatever arrived since the last call to `tickers`; returns the
    /// number of upstream events handled.
    fn poll(&mut self, tickers: &mut TickerMap) -> usize;
}

/// Feed with a fixed instrument universe and no market data of its own.
///
/// An empty universe lists every symbol.
pub struct StaticFeed {
    name: String,
    universe: AHashSet<String>,
    subscribed: AHashSet<String>,
    ready: bool,
}

impl StaticFeed {
    pub fn new(name: impl Into<String>, instruments: &[String]) -> Self {
        let name = name.into();
        info!("[feed] {name}: static universe of {} instrument(s)", instruments.len());
        Self {
            name,
            universe: instruments.iter().cloned().collect(),
            subscribed: AHashSet::new(),
            ready: true,
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.contains(symbol)
    }
}

impl FeedAdapter for StaticFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn subscribe(&mut self, symbol: &str) -> bool {
        if !self.universe.is_empty() && !self.universe.contains(symbol) {
            debug!("[feed] {}: {symbol} not listed", self.name);
            return false;
        }
        self.subscribed.insert(symbol.to_string());
        true
    }

    fn unsubscribe(&mut self, symbol: &str) {
        self.subscribed.remove(symbol);
    }

    fn poll(&mut self, _tickers: &mut TickerMap) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universe_filters_symbols() {
        let mut feed = StaticFeed::new("shfe", &["cu2409".to_string()]);
        assert!(feed.subscribe("cu2409"));
        assert!(!feed.subscribe("ZZZZ"));
        assert!(feed.is_subscribed("cu2409"));
        feed.unsubscribe("cu2409");
        assert!(!feed.is_subscribed("cu2409"));
    }

    #[test]
    fn empty_universe_lists_everything() {
        let mut feed = StaticFeed::new("any", &[]);
        assert!(feed.subscribe("anything"));
        assert!(feed.is_ready());
        feed.set_ready(false);
        assert!(!feed.is_ready());
    }
}
