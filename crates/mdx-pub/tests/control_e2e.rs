//! End-to-end control channel scenarios over real TCP.
//!
//! Each test starts a control channel on an ephemeral port and one
//! market-data thread for SHFE whose feed lists `cu2409` and applies
//! scripted top-of-book updates.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use mdx_core::{
    book::{BookLevel, ExchangeDepth},
    book_cache::{BookCacheView, SharedBookCache, SnapPolicy, SnapStatus},
    config::SourceConfig,
    protocol::{
        self, Connect, ConnectStatus, FrameHeader, HEADER_LEN, Message, STREAM_ID_CONTROL, ShmType, Subscribe,
        SubscribeStatus, flags, poll_frame,
    },
    ring::RingBuffer,
    symbol_table::{OpenMode, SymbolTable},
    types::{EXCHANGE_SHFE, Side},
};
use mdx_pub::{
    ControlChannel, MarketDataSource, Publisher, PublisherSettings,
    feed::{FeedAdapter, StaticFeed, TickerMap},
    registry::{CacheEntry, CacheRegistry},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);
const EVENT_FLAGS: u32 = flags::SEND_BOOK_REFRESHED | flags::SEND_BOOK_CHANGED | flags::SEND_TRADING_ACTION;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Static universe plus a channel of (symbol, bid price, bid shares) ticks.
struct ScriptFeed {
    inner: StaticFeed,
    ticks: Receiver<(String, i64, u64)>,
}

impl FeedAdapter for ScriptFeed {
    fn name(&self) -> &str {
        "script"
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
        let mut n = 0;
        while let Ok((symbol, price, shares)) = self.ticks.try_recv() {
            if let Some(ticker) = tickers.get_mut(&symbol) {
                ticker.update_best_bid_price_level(price, shares, 1, 0);
                ticker.process_book_refresh_l1();
                n += 1;
            }
        }
        n
    }
}

struct Harness {
    dir: tempfile::TempDir,
    control: ControlChannel,
    entry: CacheEntry,
    ticks: Sender<(String, i64, u64)>,
    stop: Arc<AtomicBool>,
    md: Option<JoinHandle<()>>,
}

impl Harness {
    async fn start(heartbeat_interval_ms: u64, max_missing_heartbeats: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry {
            cache: Arc::new(
                SharedBookCache::create(
                    dir.path().join("mdx.fut"),
                    &[ExchangeDepth { exchange: EXCHANGE_SHFE, depth: 5 }],
                    64,
                )
                .unwrap(),
            ),
            symbols: Arc::new(SymbolTable::open(dir.path().join("fut.symbols"), OpenMode::ReadWrite).unwrap()),
            write_timeout_cycles: 1_000_000,
        };
        let mut registry = CacheRegistry::new();
        registry.insert(entry.clone()).unwrap();

        let source_cfg = SourceConfig {
            exchange: EXCHANGE_SHFE,
            cpu_affinity: None,
            can_unsubscribe: None,
            instruments: vec!["cu2409".into()],
        };
        let (ticks, rx) = crossbeam_channel::unbounded();
        let feed = ScriptFeed { inner: StaticFeed::new("shfe", &source_cfg.instruments), ticks: rx };
        let (source, handle) = MarketDataSource::new(&source_cfg, 0, feed, &entry, heartbeat_interval_ms);
        let stop = Arc::new(AtomicBool::new(false));
        let md = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || source.run(stop))
        };

        let settings = PublisherSettings {
            name: "mdx".into(),
            shm_dir: dir.path().to_path_buf(),
            queue_size: 1 << 16,
            heartbeat_interval_ms,
            max_missing_heartbeats,
            house_keeping_interval_ms: 20,
            house_keeping_batch: 50,
            send_book_update: true,
        };
        let publisher = Publisher::new(settings, Arc::new(registry), vec![handle]);
        let control = ControlChannel::start("127.0.0.1:0".parse().unwrap(), publisher).await.unwrap();
        Self { dir, control, entry, ticks, stop, md: Some(md) }
    }

    async fn client(&self) -> Client {
        Client { stream: TcpStream::connect(self.control.local_addr()).await.unwrap(), seq: 0 }
    }

    async fn shutdown(mut self) {
        self.control.stop().await;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(md) = self.md.take() {
            md.join().unwrap();
        }
    }
}

struct Client {
    stream: TcpStream,
    seq: u64,
}

impl Client {
    async fn send(&mut self, messages: &[Message]) {
        self.seq += 1;
        let frame = protocol::encode_frame(0, self.seq, STREAM_ID_CONTROL, 0, messages).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn connect(&mut self, client_id: u8, pid: u32, shm_key: &str, flags: u32) {
        self.send(&[Message::Connect(Connect {
            pid,
            client_id,
            flags,
            user: "test".into(),
            pwd: String::new(),
            shm_key: shm_key.into(),
        })])
        .await;
    }

    async fn subscribe(&mut self, symbol: &str) {
        self.send(&[Message::Subscribe(Subscribe { symbol: symbol.into(), exchange: EXCHANGE_SHFE, flags: 0 })])
            .await;
    }

    /// Next non-heartbeat frame's records, or `None` once the producer
    /// closed the connection.
    async fn recv(&mut self) -> Option<Vec<Message>> {
        loop {
            let mut header = [0u8; HEADER_LEN];
            match timeout(WAIT, self.stream.read_exact(&mut header)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return None,
                Err(_) => panic!("no control frame within {WAIT:?}"),
            }
            let header_fields = FrameHeader::decode(&header).unwrap();
            let mut frame = header.to_vec();
            frame.resize(HEADER_LEN + header_fields.size as usize, 0);
            self.stream.read_exact(&mut frame[HEADER_LEN..]).await.unwrap();
            let (h, messages) = protocol::decode_frame(&frame).unwrap();
            assert_eq!(h.stream_id, STREAM_ID_CONTROL);
            if !h.is_heartbeat() {
                return Some(messages);
            }
        }
    }
}

fn connect_responses(messages: &[Message]) -> Vec<&protocol::ConnectResponse> {
    messages
        .iter()
        .map(|m| match m {
            Message::ConnectResponse(r) => r,
            other => panic!("expected connect response, got {other:?}"),
        })
        .collect()
}

fn subscribe_response(messages: Vec<Message>) -> protocol::SubscribeResponse {
    match messages.into_iter().next() {
        Some(Message::SubscribeResponse(r)) => r,
        other => panic!("expected subscribe response, got {other:?}"),
    }
}

async fn poll_ring_until<M: mdx_core::ring::RingMemory>(ring: &mut RingBuffer<M>) -> Vec<Message> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some((_, messages)) = poll_frame(ring).unwrap() {
            return messages;
        }
        assert!(tokio::time::Instant::now() < deadline, "no data frame within {WAIT:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn read_top_bid(cache_path: &Path, locate: u16) -> BookLevel {
    let view = BookCacheView::attach(cache_path).unwrap();
    let mut out = Vec::new();
    let status = view.snapshot(locate, EXCHANGE_SHFE, Side::Bid, 11, SnapPolicy::default(), &mut out).unwrap();
    assert!(matches!(status, SnapStatus::Ok(_)));
    out[0]
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_grants_queue_and_cache() {
    let h = Harness::start(1_000, 5).await;
    let mut c = h.client().await;
    c.connect(0, 1234, "alpha", flags::ALL).await;

    let messages = c.recv().await.unwrap();
    let responses = connect_responses(&messages);
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.status == ConnectStatus::Ok && r.client_id == 0));

    assert_eq!(responses[0].shm_type, ShmType::EventQueue);
    assert!(Path::new(&responses[0].shm_path).starts_with(h.dir.path()));
    assert!(responses[0].shm_path.ends_with("mdx.alpha.0"));
    assert!(RingBuffer::open_shm(&responses[0].shm_path).is_ok());

    assert_eq!((responses[1].shm_type, responses[1].exchange), (ShmType::BookCache, EXCHANGE_SHFE));
    assert_eq!(responses[1].shm_size, h.entry.cache.size() as u64);
    assert!(BookCacheView::attach(&responses[1].shm_path).is_ok());

    h.shutdown().await;
}

#[tokio::test]
async fn second_client_with_same_id_is_rejected_and_closed() {
    let h = Harness::start(1_000, 5).await;
    let mut first = h.client().await;
    first.connect(0, 1234, "alpha", flags::ALL).await;
    assert_eq!(connect_responses(&first.recv().await.unwrap())[0].status, ConnectStatus::Ok);

    let mut second = h.client().await;
    second.connect(0, 5678, "beta", flags::ALL).await;
    let messages = second.recv().await.unwrap();
    let responses = connect_responses(&messages);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, ConnectStatus::AlreadyConnected);
    assert!(second.recv().await.is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn unknown_symbol_is_bad_symbol() {
    let h = Harness::start(1_000, 5).await;
    let mut c = h.client().await;
    c.connect(0, 1234, "alpha", flags::ALL).await;
    c.recv().await.unwrap();

    c.subscribe("ZZZZ").await;
    let r = subscribe_response(c.recv().await.unwrap());
    assert_eq!((r.status, r.locate, r.symbol.as_str()), (SubscribeStatus::BadSymbol, 0xFFFF, "ZZZZ"));

    h.shutdown().await;
}

#[tokio::test]
async fn top_of_book_refresh_reaches_ring_and_cache() {
    let h = Harness::start(1_000, 5).await;
    let mut c = h.client().await;
    c.connect(0, 1234, "alpha", EVENT_FLAGS).await;
    let messages = c.recv().await.unwrap();
    let responses = connect_responses(&messages);
    let mut ring = RingBuffer::open_shm(&responses[0].shm_path).unwrap();
    let cache_path = responses[1].shm_path.clone();

    c.subscribe("cu2409").await;
    let r = subscribe_response(c.recv().await.unwrap());
    assert_eq!(r.status, SubscribeStatus::Ok);
    let locate = r.locate;

    h.ticks.send(("cu2409".into(), 100, 5)).unwrap();
    let events = poll_ring_until(&mut ring).await;
    assert_eq!(events.len(), 1);
    let Message::BookRefreshed(refreshed) = &events[0] else { panic!("expected book refreshed, got {events:?}") };
    assert_eq!((refreshed.locate, refreshed.symbol.as_str()), (locate, "cu2409"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(poll_frame(&mut ring).unwrap().is_none());

    let top = read_top_bid(Path::new(&cache_path), locate);
    assert_eq!((top.price, top.shares), (100, 5));

    h.shutdown().await;
}

#[tokio::test]
async fn silent_consumer_times_out_and_releases_reader_bits() {
    let h = Harness::start(100, 2).await;
    let mut c = h.client().await;
    c.connect(3, 1234, "alpha", flags::ALL).await;
    c.recv().await.unwrap();
    c.subscribe("cu2409").await;
    let r = subscribe_response(c.recv().await.unwrap());
    assert_eq!(r.status, SubscribeStatus::Ok);

    // A reader that died mid-read leaves its bit behind.
    let slot = h.entry.cache.product(r.locate, EXCHANGE_SHFE).unwrap();
    slot.lock(Side::Bid).begin_read(3, 1_000_000).unwrap().unwrap();
    assert_ne!(slot.lock(Side::Bid).readers(), 0);

    assert!(c.recv().await.is_none());

    let deadline = tokio::time::Instant::now() + WAIT;
    while slot.lock(Side::Bid).readers() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "reader bit still held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(slot.lock(Side::Ask).readers(), 0);

    h.shutdown().await;
}
