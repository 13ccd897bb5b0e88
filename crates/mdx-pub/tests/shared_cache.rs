//! Two market-data threads writing different venues of one book cache.
//!
//! Exchanges 1 and 5 share a cache, so the same instrument's bid block and
//! its lock word are written by both threads. A consumer-side view keeps
//! snapshotting both venues and must never validate a mixed generation.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use mdx_core::{
    book::ExchangeDepth,
    book_cache::{BookCacheView, SharedBookCache, SnapPolicy, SnapStatus},
    config::SourceConfig,
    protocol::flags,
    symbol_table::{OpenMode, SymbolTable},
    types::Side,
};
use mdx_pub::{
    MarketDataSource,
    consumer::{ConsumerDetails, ConsumerProxy, DataChannel},
    feed::{FeedAdapter, StaticFeed, TickerMap},
    registry::CacheEntry,
};
use tokio::sync::mpsc;

const DEPTH: u8 = 5;
const SYMBOL: &str = "cu2409";

/// Republishes the full bid side every poll; generation `n` is carried in the
/// shares of every level.
struct PumpFeed {
    inner: StaticFeed,
    base: i64,
    generation: u64,
}

impl FeedAdapter for PumpFeed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn subscribe(&mut self, symbol: &str) -> bool {
        self.inner.subscribe(symbol)
    }

    fn unsubscribe(&mut self, symbol: &str) {
        self.inner.unsubscribe(symbol);
    }

    fn poll(&mut self, tickers: &mut TickerMap) -> usize {
        self.generation += 1;
        let mut n = 0;
        for ticker in tickers.values_mut() {
            ticker.reset_price_levels(Side::Bid);
            for i in 0..DEPTH as i64 {
                ticker.insert_bid_price_level(self.base - i, self.generation, 1, 0);
            }
            ticker.process_book_refresh_bid();
            n += 1;
        }
        n
    }
}

fn consumer(dir: &std::path::Path) -> (Arc<ConsumerProxy>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let proxy = ConsumerProxy::new(1, peer, 7, tx, true, 0);
    proxy.set_details(ConsumerDetails {
        pid: 42,
        client_id: 0,
        flags: flags::SEND_BOOK_REFRESHED,
        user: String::new(),
        shm_key: "shared".into(),
    });
    proxy.attach_data_channel(DataChannel::create(dir, "mdx", "shared", 2, 1 << 12).unwrap());
    (Arc::new(proxy), rx)
}

fn base(exchange: u16) -> i64 {
    exchange as i64 * 1_000_000
}

#[test]
fn venues_sharing_a_cache_never_tear() {
    let dir = tempfile::tempdir().unwrap();
    let venues = [ExchangeDepth { exchange: 1, depth: DEPTH }, ExchangeDepth { exchange: 5, depth: DEPTH }];
    let entry = CacheEntry {
        cache: Arc::new(SharedBookCache::create(dir.path().join("mdx.multi"), &venues, 16).unwrap()),
        symbols: Arc::new(SymbolTable::open(dir.path().join("multi.symbols"), OpenMode::ReadWrite).unwrap()),
        write_timeout_cycles: 1_000_000,
    };
    let (proxy, _control) = consumer(dir.path());

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    let mut threads = Vec::new();
    for (queue_index, exchange) in [(0u8, 1u16), (1, 5)] {
        let cfg = SourceConfig { exchange, cpu_affinity: None, can_unsubscribe: None, instruments: vec![] };
        let inner = StaticFeed::new(format!("ex{exchange}"), &[]);
        let feed = PumpFeed { inner, base: base(exchange), generation: 0 };
        let (mut source, handle) = MarketDataSource::new(&cfg, queue_index, feed, &entry, 1_000);
        source.on_subscribe(&proxy, SYMBOL);
        assert!(source.ticker(SYMBOL).is_some());
        handles.push(handle);

        let stop = Arc::clone(&stop);
        threads.push(std::thread::spawn(move || source.run(stop)));
    }

    let locate = entry.symbols.locate(SYMBOL, false).unwrap().unwrap();
    let view = BookCacheView::attach(entry.cache.path()).unwrap();
    let mut out = Vec::new();
    let mut validated = [0u64; 2];
    let deadline = Instant::now() + Duration::from_millis(500);

    while Instant::now() < deadline {
        for (k, (exchange, reader_id)) in [(1u16, 10u8), (5, 11)].into_iter().enumerate() {
            let status =
                view.snapshot(locate, exchange, Side::Bid, reader_id, SnapPolicy::default(), &mut out).unwrap();
            let SnapStatus::Ok(_) = status else { continue };
            assert_eq!(out.len(), DEPTH as usize);
            if out.iter().all(|l| l.is_blank()) {
                continue;
            }
            let generation = out[0].shares;
            for (i, level) in out.iter().enumerate() {
                assert_eq!(level.price, base(exchange) - i as i64, "exchange {exchange} level {i}: {out:?}");
                assert_eq!(level.shares, generation, "exchange {exchange} mixed generations: {out:?}");
            }
            validated[k] += 1;
        }
    }

    stop.store(true, Ordering::Relaxed);
    for t in threads {
        t.join().unwrap();
    }
    drop(handles);

    assert!(validated[0] > 0 && validated[1] > 0, "validated {validated:?}");
    let slot = entry.cache.product(locate, 1).unwrap();
    assert_eq!(slot.lock(Side::Bid).version() % 2, 0);
    assert_eq!(slot.lock(Side::Bid).readers(), 0);
}
