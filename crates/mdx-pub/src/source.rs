//! One upstream data source and the thread that owns its tickers.
//!
//! The control plane never touches tickers directly. It talks to a source
//! through a cloneable [`SourceHandle`] that posts [`SourceCommand`]s on a
//! crossbeam channel; the [`MarketDataSource`] drains that channel from its
//! own loop between feed polls, so every ticker and cache slot of the source
//! has exactly one writer.
//!
//! ```text
//! Publisher ──► SourceHandle ──(crossbeam)──► MarketDataSource::run
//!                                               ├─ poll_commands
//!                                               ├─ feed.poll(tickers)
//!                                               ├─ send_pending_refreshes
//!                                               └─ maybe_send_heartbeat
//! ```

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mdx_core::{
    book_cache::SharedBookCache,
    config::SourceConfig,
    cpu_affinity,
    error::{MdxError, Result},
    symbol_table::SymbolTable,
    time_util::now_ns,
};
use tracing::{debug, info, warn};

use crate::{
    consumer::{ConsumerProxy, same_consumer},
    feed::{FeedAdapter, TickerMap},
    registry::CacheEntry,
    ticker::{StreamContext, Ticker, TickerState},
};

/// Requests posted by the control plane to a market-data thread.
pub enum SourceCommand {
    Subscribe { consumer: Arc<ConsumerProxy>, symbol: String },
    Unsubscribe { consumer: Arc<ConsumerProxy>, symbol: String },
    /// The consumer is gone; drop it from every ticker.
    DropConsumer(Arc<ConsumerProxy>),
    /// Blank one ticker's book, or every ticker's with `None`.
    ClearBook(Option<String>),
}

type ConsumerList = Arc<Mutex<Vec<Arc<ConsumerProxy>>>>;

/// Control-plane side of a source.
#[derive(Clone)]
pub struct SourceHandle {
    exchange: u16,
    queue_index: u8,
    tx: Sender<SourceCommand>,
    ready: Arc<AtomicBool>,
    consumers: ConsumerList,
}

impl SourceHandle {
    pub fn exchange(&self) -> u16 {
        self.exchange
    }

    /// Index of this source's ring in every consumer's data channel.
    pub fn queue_index(&self) -> u8 {
        self.queue_index
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Start sending data heartbeats to `consumer`.
    pub fn register_consumer(&self, consumer: &Arc<ConsumerProxy>) {
        let mut list = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        if !list.iter().any(|c| same_consumer(c, consumer)) {
            list.push(Arc::clone(consumer));
        }
    }

    /// Forget `consumer` and have the market-data thread purge its
    /// subscriptions.
    pub fn unregister_consumer(&self, consumer: &Arc<ConsumerProxy>) {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner).retain(|c| !same_consumer(c, consumer));
        if self.tx.send(SourceCommand::DropConsumer(Arc::clone(consumer))).is_err() {
            debug!("[source] exchange {} stopped, drop of conn {} skipped", self.exchange, consumer.conn_id());
        }
    }

    /// `false` when the source cannot take the request yet; the caller keeps
    /// it queued and retries on a later tick.
    pub fn subscribe(&self, consumer: &Arc<ConsumerProxy>, symbol: &str) -> bool {
        self.post(SourceCommand::Subscribe { consumer: Arc::clone(consumer), symbol: symbol.to_string() })
    }

    pub fn unsubscribe(&self, consumer: &Arc<ConsumerProxy>, symbol: &str) -> bool {
        self.post(SourceCommand::Unsubscribe { consumer: Arc::clone(consumer), symbol: symbol.to_string() })
    }

    pub fn clear_book(&self, symbol: Option<&str>) -> bool {
        self.tx.send(SourceCommand::ClearBook(symbol.map(str::to_string))).is_ok()
    }

    fn post(&self, command: SourceCommand) -> bool {
        self.is_ready() && self.tx.send(command).is_ok()
    }
}

/// Market-data side of a source: owns the feed and the tickers.
pub struct MarketDataSource<F: FeedAdapter> {
    exchange: u16,
    cpu_affinity: Option<i32>,
    can_unsubscribe: bool,
    feed: F,
    tickers: TickerMap,
    cache: Arc<SharedBookCache>,
    symbols: Arc<SymbolTable>,
    write_timeout_cycles: u64,
    stream: StreamContext,
    rx: Receiver<SourceCommand>,
    ready: Arc<AtomicBool>,
    consumers: ConsumerList,
    heartbeat_interval_ns: u64,
    last_heartbeat_ns: u64,
}

impl<F: FeedAdapter> MarketDataSource<F> {
    pub fn new(
        config: &SourceConfig,
        queue_index: u8,
        feed: F,
        entry: &CacheEntry,
        heartbeat_interval_ms: u64,
    ) -> (Self, SourceHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ready = Arc::new(AtomicBool::new(feed.is_ready()));
        let consumers: ConsumerList = Arc::new(Mutex::new(Vec::new()));
        let handle = SourceHandle {
            exchange: config.exchange,
            queue_index,
            tx,
            ready: Arc::clone(&ready),
            consumers: Arc::clone(&consumers),
        };
        let source = Self {
            exchange: config.exchange,
            cpu_affinity: config.cpu_affinity,
            can_unsubscribe: config.effective_can_unsubscribe(),
            feed,
            tickers: TickerMap::new(),
            cache: Arc::clone(&entry.cache),
            symbols: Arc::clone(&entry.symbols),
            write_timeout_cycles: entry.write_timeout_cycles,
            stream: StreamContext::new(queue_index),
            rx,
            ready,
            consumers,
            heartbeat_interval_ns: heartbeat_interval_ms * 1_000_000,
            last_heartbeat_ns: now_ns(),
        };
        (source, handle)
    }

    pub fn exchange(&self) -> u16 {
        self.exchange
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut F {
        &mut self.feed
    }

    pub fn ticker(&self, symbol: &str) -> Option<&Ticker> {
        self.tickers.get(symbol)
    }

    /// Direct access for feeds driven from outside the loop.
    pub fn ticker_mut(&mut self, symbol: &str) -> Option<&mut Ticker> {
        self.tickers.get_mut(symbol)
    }

    pub fn ticker_count(&self) -> usize {
        self.tickers.len()
    }

    /// Execute every queued command. Returns how many ran.
    pub fn poll_commands(&mut self) -> usize {
        let mut n = 0;
        loop {
            match self.rx.try_recv() {
                Ok(command) => {
                    self.execute(command);
                    n += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return n,
            }
        }
    }

    fn execute(&mut self, command: SourceCommand) {
        match command {
            SourceCommand::Subscribe { consumer, symbol } => self.on_subscribe(&consumer, &symbol),
            SourceCommand::Unsubscribe { consumer, symbol } => self.on_unsubscribe(&consumer, &symbol),
            SourceCommand::DropConsumer(consumer) => self.on_drop_consumer(&consumer),
            SourceCommand::ClearBook(symbol) => self.on_clear_book(symbol.as_deref()),
        }
    }

    pub fn on_subscribe(&mut self, consumer: &Arc<ConsumerProxy>, symbol: &str) {
        if consumer.is_closed() {
            debug!("[source] conn {} closed before subscribing {symbol}", consumer.conn_id());
            return;
        }

        if let Some(ticker) = self.tickers.get(symbol) {
            match ticker.state() {
                TickerState::Active => {
                    ticker.add_subscriber(consumer, true);
                    consumer.send_ticker_subscribe_response(ticker);
                }
                TickerState::BadSymbol => {
                    consumer.send_ticker_subscribe_response(ticker);
                }
                TickerState::Empty | TickerState::Pending => ticker.add_subscriber(consumer, false),
            }
            return;
        }

        let mut ticker = Ticker::new(symbol, self.exchange, self.stream.clone(), self.write_timeout_cycles);
        ticker.add_subscriber(consumer, false);
        ticker.set_state(TickerState::Pending);

        if !self.feed.subscribe(symbol) {
            info!("[source] {}: {symbol} rejected upstream", self.feed.name());
            ticker.on_subscribe(TickerState::BadSymbol);
            return;
        }

        match self.bind(&mut ticker) {
            Ok(()) => {
                info!("[source] {}: {symbol} active at locate {}", self.feed.name(), ticker.locate());
                ticker.on_subscribe(TickerState::Active);
                self.tickers.insert(symbol.to_string(), ticker);
            }
            Err(e) => {
                warn!("[source] {}: {symbol} has no cache slot: {e}", self.feed.name());
                self.feed.unsubscribe(symbol);
                ticker.on_subscribe(TickerState::BadSymbol);
            }
        }
    }

    fn bind(&self, ticker: &mut Ticker) -> Result<()> {
        let symbol = ticker.symbol().to_string();
        let known = self.symbols.locate(&symbol, false)?.is_some();
        let locate = self
            .symbols
            .locate(&symbol, true)?
            .ok_or_else(|| MdxError::SymbolTable(format!("no locator for {symbol}")))?;
        let slot = match self.cache.product(locate, self.exchange) {
            Ok(slot) => slot,
            Err(e) => {
                // give back a record this call allocated
                if !known && let Err(re) = self.symbols.remove(&symbol) {
                    warn!("[source] {}: releasing {symbol}: {re}", self.feed.name());
                }
                return Err(e);
            }
        };
        let depth = slot.depth() as u32;
        ticker.set_locate(locate, slot);
        self.symbols.update_venue_depth(&symbol, self.exchange, depth, depth)?;
        Ok(())
    }

    /// Replies only when `consumer` was actually subscribed.
    pub fn on_unsubscribe(&mut self, consumer: &Arc<ConsumerProxy>, symbol: &str) {
        let Some(ticker) = self.tickers.get(symbol) else {
            debug!("[source] unsubscribe from unknown {symbol}");
            return;
        };
        if !ticker.remove_subscriber(consumer) {
            return;
        }
        consumer.send_unsubscribe_response(ticker);
        if !ticker.has_subscriber() && self.can_unsubscribe {
            self.retire(symbol);
        }
    }

    pub fn on_drop_consumer(&mut self, consumer: &Arc<ConsumerProxy>) {
        let mut idle = Vec::new();
        for (symbol, ticker) in &self.tickers {
            if ticker.remove_subscriber(consumer) && !ticker.has_subscriber() {
                idle.push(symbol.clone());
            }
        }
        debug!("[source] conn {} dropped from exchange {}", consumer.conn_id(), self.exchange);
        if self.can_unsubscribe {
            for symbol in idle {
                self.retire(&symbol);
            }
        }
    }

    fn retire(&mut self, symbol: &str) {
        self.feed.unsubscribe(symbol);
        self.tickers.remove(symbol);
        info!("[source] {}: {symbol} unsubscribed upstream", self.feed.name());
    }

    pub fn on_clear_book(&mut self, symbol: Option<&str>) {
        match symbol {
            Some(symbol) => match self.tickers.get_mut(symbol) {
                Some(ticker) => {
                    ticker.clear_bid();
                    ticker.clear_ask();
                    info!("[source] cleared {symbol}");
                }
                None => warn!("[source] clear of unknown {symbol}"),
            },
            None => {
                for ticker in self.tickers.values_mut() {
                    ticker.clear_bid();
                    ticker.clear_ask();
                }
                info!("[source] cleared {} book(s) on exchange {}", self.tickers.len(), self.exchange);
            }
        }
    }

    pub fn send_pending_refreshes(&self) {
        for ticker in self.tickers.values() {
            ticker.send_pending_refresh();
        }
    }

    /// Header-only frame on this source's queue of every registered consumer.
    pub fn send_heartbeats(&self) -> usize {
        let consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = self.stream.current();
        consumers
            .iter()
            .filter(|c| c.send_data_heartbeat(self.stream.queue_index(), sequence))
            .count()
    }

    pub fn maybe_send_heartbeat(&mut self, now_ns: u64) {
        if now_ns.saturating_sub(self.last_heartbeat_ns) >= self.heartbeat_interval_ns {
            self.last_heartbeat_ns = now_ns;
            self.send_heartbeats();
        }
    }

    /// One pass of the loop. Returns the amount of work done.
    pub fn poll_once(&mut self) -> usize {
        self.ready.store(self.feed.is_ready(), Ordering::Release);
        let mut work = self.poll_commands();
        work += self.feed.poll(&mut self.tickers);
        self.send_pending_refreshes();
        self.maybe_send_heartbeat(now_ns());
        work
    }

    /// Run until `stop` is set. Meant for a dedicated thread.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        cpu_affinity::maybe_bind(self.cpu_affinity);
        info!("[source] {} loop started (exchange {})", self.feed.name(), self.exchange);

        let mut idle: u32 = 0;
        while !stop.load(Ordering::Relaxed) {
            if self.poll_once() > 0 {
                idle = 0;
                continue;
            }
            idle = idle.saturating_add(1);
            if idle < 1_000 {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
        }

        self.ready.store(false, Ordering::Release);
        info!("[source] {} loop exited with {} ticker(s)", self.feed.name(), self.tickers.len());
    }
}
