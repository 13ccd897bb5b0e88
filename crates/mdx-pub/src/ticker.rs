//! Per-instrument order book owned by one market-data thread.
//!
//! A [`Ticker`] keeps the live bid and ask levels in process, validates every
//! mutation against the price ordering (bids strictly descending, asks
//! strictly ascending, one level per price) and mirrors the result into its
//! [`ProductSlot`] under the side's versioned lock. Subscribers are notified
//! after the shared write completes.
//!
//! Invalid requests are logged and rejected with `false`; the book is left as
//! it was.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use mdx_core::{
    book::BookLevel,
    book_cache::ProductSlot,
    symbol_table::LOCATOR_INVALID,
    types::{ChangedSide, DEFAULT_LOT_SIZE, DEFAULT_PRICE_SCALE, PRICE_BLANK, Side, Timestamps, TradeStatus},
};
use tracing::{debug, warn};

use crate::consumer::{ConsumerProxy, same_consumer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerState {
    /// Created, nothing requested upstream yet.
    Empty,
    /// Waiting for the feed to accept the subscription.
    Pending,
    Active,
    BadSymbol,
}

/// The data stream a ticker's events travel on: which consumer queue, and
/// the sequence shared by every ticker of the same source.
#[derive(Debug, Clone)]
pub struct StreamContext {
    queue_index: u8,
    sequence: Arc<AtomicU64>,
}

impl StreamContext {
    pub fn new(queue_index: u8) -> Self {
        Self { queue_index, sequence: Arc::new(AtomicU64::new(0)) }
    }

    pub fn queue_index(&self) -> u8 {
        self.queue_index
    }

    /// Advance and return the stream sequence.
    pub fn step(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Subscribers {
    consumers: Vec<Arc<ConsumerProxy>>,
    pending_refresh: Vec<Arc<ConsumerProxy>>,
}

pub struct Ticker {
    symbol: String,
    exchange: u16,
    locate: u16,
    state: TickerState,
    lot_size: u32,
    price_scale: u8,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    slot: Option<ProductSlot>,
    write_timeout_cycles: u64,
    subscribers: Mutex<Subscribers>,
    trade_status: TradeStatus,
    timestamps: Timestamps,
    changed_side: ChangedSide,
    event_sequence: u64,
    stream: StreamContext,
}

impl Ticker {
    pub fn new(symbol: &str, exchange: u16, stream: StreamContext, write_timeout_cycles: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange,
            locate: LOCATOR_INVALID,
            state: TickerState::Empty,
            lot_size: DEFAULT_LOT_SIZE,
            price_scale: DEFAULT_PRICE_SCALE,
            bids: Vec::new(),
            asks: Vec::new(),
            slot: None,
            write_timeout_cycles,
            subscribers: Mutex::new(Subscribers::default()),
            trade_status: TradeStatus::None,
            timestamps: Timestamps::default(),
            changed_side: ChangedSide::None,
            event_sequence: 0,
            stream,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn exchange(&self) -> u16 {
        self.exchange
    }

    pub fn locate(&self) -> u16 {
        self.locate
    }

    pub fn state(&self) -> TickerState {
        self.state
    }

    pub fn set_state(&mut self, state: TickerState) {
        self.state = state;
    }

    pub fn stream(&self) -> &StreamContext {
        &self.stream
    }

    pub fn trade_status(&self) -> TradeStatus {
        self.trade_status
    }

    pub fn timestamps(&self) -> Timestamps {
        self.timestamps
    }

    pub fn changed_side(&self) -> ChangedSide {
        self.changed_side
    }

    pub fn bids(&self) -> &[BookLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.asks
    }

    pub fn slot(&self) -> Option<&ProductSlot> {
        self.slot.as_ref()
    }

    /// Static instrument attributes stamped on every level.
    pub fn set_instrument(&mut self, lot_size: u32, price_scale: u8) {
        self.lot_size = lot_size;
        self.price_scale = price_scale;
    }

    /// Bind the ticker to its cache slot and blank both sides.
    pub fn set_locate(&mut self, locate: u16, slot: ProductSlot) {
        self.locate = locate;
        slot.init(&self.blank_level(), self.write_timeout_cycles);
        self.slot = Some(slot);
    }

    pub fn update_refresh_times(&mut self, src_receive: u64, src_transmit: u64, producer_receive: u64) {
        self.timestamps.src_receive = src_receive;
        self.timestamps.src_transmit = src_transmit;
        self.timestamps.producer_receive = producer_receive;
    }

    fn blank_level(&self) -> BookLevel {
        BookLevel::blank(self.exchange, self.lot_size, self.price_scale)
    }

    fn make_level(&mut self, price: i64, shares: u64, orders: u32, exch_time: u64) -> BookLevel {
        self.event_sequence += 1;
        let mut level = self.blank_level();
        level.price = price;
        level.shares = shares;
        level.orders = orders;
        level.timestamp = exch_time;
        level.update_ts = self.timestamps.producer_receive;
        level.sequence = self.event_sequence;
        level
    }

    fn book_mut(&mut self, side: Side) -> &mut Vec<BookLevel> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Book mutation
    // -----------------------------------------------------------------------

    /// Replace the best level (or create it on an empty side).
    pub fn update_best_price_level(
        &mut self,
        side: Side,
        price: i64,
        shares: u64,
        orders: u32,
        exch_time: u64,
    ) -> bool {
        if !self.check_price(side, price, "update_best") {
            return false;
        }
        if let Some(next) = self.book(side).get(1)
            && !side.is_better(price, next.price)
        {
            warn!("[ticker] {} update_best {side}: {price} not better than level 1 at {}", self.symbol, next.price);
            return false;
        }
        let level = self.make_level(price, shares, orders, exch_time);
        let book = self.book_mut(side);
        match book.first_mut() {
            Some(top) => *top = level,
            None => book.push(level),
        }
        true
    }

    pub fn update_best_bid_price_level(&mut self, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        self.update_best_price_level(Side::Bid, price, shares, orders, exch_time)
    }

    pub fn update_best_ask_price_level(&mut self, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        self.update_best_price_level(Side::Ask, price, shares, orders, exch_time)
    }

    /// Insert a new price at its sorted position.
    pub fn insert_price_level(&mut self, side: Side, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        if !self.check_price(side, price, "insert") {
            return false;
        }
        let book = self.book(side);
        let pos = book.iter().position(|l| !side.is_better(l.price, price)).unwrap_or(book.len());
        if book.get(pos).is_some_and(|l| l.price == price) {
            warn!("[ticker] {} insert {side}: duplicate price {price}", self.symbol);
            return false;
        }
        let level = self.make_level(price, shares, orders, exch_time);
        self.book_mut(side).insert(pos, level);
        true
    }

    pub fn insert_bid_price_level(&mut self, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        self.insert_price_level(Side::Bid, price, shares, orders, exch_time)
    }

    pub fn insert_ask_price_level(&mut self, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        self.insert_price_level(Side::Ask, price, shares, orders, exch_time)
    }

    /// Insert at an explicit index, shifting worse levels down.
    pub fn insert_price_level_at(
        &mut self,
        side: Side,
        index: usize,
        price: i64,
        shares: u64,
        orders: u32,
        exch_time: u64,
    ) -> bool {
        let len = self.book(side).len();
        if index > len {
            warn!("[ticker] {} insert_at {side}: index {index} beyond {len} levels", self.symbol);
            return false;
        }
        if !self.check_price(side, price, "insert_at") || !self.fits_between(side, index, index, price, "insert_at") {
            return false;
        }
        let level = self.make_level(price, shares, orders, exch_time);
        self.book_mut(side).insert(index, level);
        true
    }

    /// Update quantity at an existing price.
    pub fn modify_price_level(&mut self, side: Side, price: i64, shares: u64, orders: u32, exch_time: u64) -> bool {
        let Some(index) = self.book(side).iter().position(|l| l.price == price) else {
            warn!("[ticker] {} modify {side}: no level at {price}", self.symbol);
            return false;
        };
        let level = self.make_level(price, shares, orders, exch_time);
        self.book_mut(side)[index] = level;
        true
    }

    /// Overwrite the level at `index`; the new price must keep the ordering.
    pub fn modify_price_level_at(
        &mut self,
        side: Side,
        index: usize,
        price: i64,
        shares: u64,
        orders: u32,
        exch_time: u64,
    ) -> bool {
        let len = self.book(side).len();
        if index >= len {
            warn!("[ticker] {} modify_at {side}: index {index} beyond {len} levels", self.symbol);
            return false;
        }
        if !self.check_price(side, price, "modify_at") || !self.fits_between(side, index, index + 1, price, "modify_at")
        {
            return false;
        }
        let level = self.make_level(price, shares, orders, exch_time);
        self.book_mut(side)[index] = level;
        true
    }

    /// Set the level at `index`, appending when `index` is one past the end.
    pub fn fill_price_level(
        &mut self,
        side: Side,
        index: usize,
        price: i64,
        shares: u64,
        orders: u32,
        exch_time: u64,
    ) -> bool {
        let len = self.book(side).len();
        if index > len {
            warn!("[ticker] {} fill {side}: index {index} leaves a gap after {len} levels", self.symbol);
            return false;
        }
        if !self.check_price(side, price, "fill") || !self.fits_between(side, index, index + 1, price, "fill") {
            return false;
        }
        let level = self.make_level(price, shares, orders, exch_time);
        let book = self.book_mut(side);
        if index == len {
            book.push(level);
        } else {
            book[index] = level;
        }
        true
    }

    pub fn remove_price_level(&mut self, side: Side, price: i64) -> bool {
        let book = self.book_mut(side);
        match book.iter().position(|l| l.price == price) {
            Some(index) => {
                book.remove(index);
                true
            }
            None => {
                warn!("[ticker] {} remove {side}: no level at {price}", self.symbol);
                false
            }
        }
    }

    pub fn delete_price_level(&mut self, side: Side, index: usize) -> bool {
        if !self.check_index(side, index, "delete") {
            return false;
        }
        self.book_mut(side).remove(index);
        true
    }

    /// Drop `index` and every worse level.
    pub fn delete_from_price_level(&mut self, side: Side, index: usize) -> bool {
        if !self.check_index(side, index, "delete_from") {
            return false;
        }
        self.book_mut(side).truncate(index);
        true
    }

    /// Drop the best level through `index` inclusive.
    pub fn delete_through_price_level(&mut self, side: Side, index: usize) -> bool {
        if !self.check_index(side, index, "delete_through") {
            return false;
        }
        self.book_mut(side).drain(..=index);
        true
    }

    pub fn reset_price_levels(&mut self, side: Side) {
        self.book_mut(side).clear();
    }

    fn book(&self, side: Side) -> &[BookLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn check_price(&self, side: Side, price: i64, op: &str) -> bool {
        if price == PRICE_BLANK {
            warn!("[ticker] {} {op} {side}: blank price", self.symbol);
            return false;
        }
        true
    }

    fn check_index(&self, side: Side, index: usize, op: &str) -> bool {
        let len = self.book(side).len();
        if index >= len {
            warn!("[ticker] {} {op} {side}: index {index} beyond {len} levels", self.symbol);
            return false;
        }
        true
    }

    /// `price` must be strictly worse than `book[prev_of - 1]` and strictly
    /// better than `book[next]`.
    fn fits_between(&self, side: Side, prev_of: usize, next: usize, price: i64, op: &str) -> bool {
        let book = self.book(side);
        if prev_of > 0
            && let Some(prev) = book.get(prev_of - 1)
            && !side.is_better(prev.price, price)
        {
            warn!("[ticker] {} {op} {side}: {price} out of order after {}", self.symbol, prev.price);
            return false;
        }
        if let Some(after) = book.get(next)
            && !side.is_better(price, after.price)
        {
            warn!("[ticker] {} {op} {side}: {price} out of order before {}", self.symbol, after.price);
            return false;
        }
        true
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    fn write_top(&self, side: Side) {
        let Some(slot) = &self.slot else { return };
        let level = self.book(side).first().copied().unwrap_or_else(|| self.blank_level());
        slot.publish_top(side, &level, self.write_timeout_cycles);
    }

    fn write_side(&self, side: Side, len: usize) {
        let Some(slot) = &self.slot else { return };
        slot.publish_prefix(side, self.book(side), len, &self.blank_level(), self.write_timeout_cycles);
    }

    fn notify_refreshed(&self) {
        let mut subs = self.subscribers();
        for consumer in &subs.consumers {
            consumer.send_book_refreshed(self);
        }
        subs.pending_refresh.clear();
    }

    fn notify_changed(&self) {
        let mut subs = self.subscribers();
        self.flush_pending(&mut subs);
        for consumer in &subs.consumers {
            consumer.send_book_changed(self);
        }
    }

    fn flush_pending(&self, subs: &mut Subscribers) {
        if self.state == TickerState::BadSymbol || subs.pending_refresh.is_empty() {
            return;
        }
        for consumer in &subs.pending_refresh {
            consumer.send_book_refreshed(self);
        }
        subs.pending_refresh.clear();
    }

    /// Publish both tops and tell every subscriber to resynchronize.
    pub fn process_book_refresh_l1(&mut self) {
        self.write_top(Side::Bid);
        self.write_top(Side::Ask);
        self.notify_refreshed();
    }

    /// Publish both tops and report a change on `side`.
    pub fn process_book_quote_l1(&mut self, side: ChangedSide) {
        self.changed_side = side;
        self.write_top(Side::Bid);
        self.write_top(Side::Ask);
        self.notify_changed();
    }

    pub fn process_book_refresh_bid(&mut self) {
        self.write_side(Side::Bid, usize::MAX);
        self.notify_refreshed();
    }

    pub fn process_book_refresh_ask(&mut self) {
        self.write_side(Side::Ask, usize::MAX);
        self.notify_refreshed();
    }

    /// Publish full depth on both sides with a single refresh event.
    pub fn process_book_refresh(&mut self) {
        self.write_side(Side::Bid, usize::MAX);
        self.write_side(Side::Ask, usize::MAX);
        self.notify_refreshed();
    }

    /// Publish the changed side(s). `orig_*_len` are the level counts before
    /// this batch of mutations so deleted levels are blanked in the cache.
    pub fn process_book_update(&mut self, side: ChangedSide, orig_bid_len: usize, orig_ask_len: usize) {
        self.changed_side = side;
        if matches!(side, ChangedSide::Bid | ChangedSide::Both) {
            self.write_side(Side::Bid, self.bids.len().max(orig_bid_len));
        }
        if matches!(side, ChangedSide::Ask | ChangedSide::Both) {
            self.write_side(Side::Ask, self.asks.len().max(orig_ask_len));
        }
        let subs = self.subscribers();
        for consumer in &subs.consumers {
            consumer.send_book_changed(self);
        }
    }

    /// Record a trading status; subscribers hear only about transitions.
    pub fn process_book_trading_action(&mut self, status: TradeStatus) {
        let changed = status != self.trade_status;
        self.trade_status = status;
        let mut subs = self.subscribers();
        self.flush_pending(&mut subs);
        if changed {
            for consumer in &subs.consumers {
                consumer.send_trading_action(self);
            }
        }
    }

    /// Empty the bid side here and in the cache.
    pub fn clear_bid(&mut self) {
        self.bids.clear();
        self.write_side(Side::Bid, usize::MAX);
    }

    pub fn clear_ask(&mut self) {
        self.asks.clear();
        self.write_side(Side::Ask, usize::MAX);
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    /// Add a subscriber. With `refresh_pending` it also gets a book-refreshed
    /// event on the next [`send_pending_refresh`](Self::send_pending_refresh).
    pub fn add_subscriber(&self, consumer: &Arc<ConsumerProxy>, refresh_pending: bool) {
        let mut subs = self.subscribers();
        if !subs.consumers.iter().any(|c| same_consumer(c, consumer)) {
            subs.consumers.push(Arc::clone(consumer));
        }
        if refresh_pending && !subs.pending_refresh.iter().any(|c| same_consumer(c, consumer)) {
            subs.pending_refresh.push(Arc::clone(consumer));
        }
    }

    /// Remove a subscriber and clear its reader bit on both lock words.
    pub fn remove_subscriber(&self, consumer: &Arc<ConsumerProxy>) -> bool {
        let mut subs = self.subscribers();
        subs.pending_refresh.retain(|c| !same_consumer(c, consumer));
        let Some(pos) = subs.consumers.iter().position(|c| same_consumer(c, consumer)) else {
            return false;
        };
        subs.consumers.remove(pos);
        drop(subs);

        if let (Some(slot), Some(id)) = (&self.slot, consumer.client_id()) {
            match slot.release_reader(id) {
                Ok(true) => debug!("[ticker] {} released reader {id}", self.symbol),
                Ok(false) => {}
                Err(e) => warn!("[ticker] {} release reader {id}: {e}", self.symbol),
            }
        }
        true
    }

    pub fn is_subscriber(&self, consumer: &Arc<ConsumerProxy>) -> bool {
        self.subscribers().consumers.iter().any(|c| same_consumer(c, consumer))
    }

    pub fn has_subscriber(&self) -> bool {
        !self.subscribers().consumers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().consumers.len()
    }

    pub fn send_pending_refresh(&self) {
        let mut subs = self.subscribers();
        self.flush_pending(&mut subs);
    }

    pub fn cancel_pending_refresh(&self) {
        self.subscribers().pending_refresh.clear();
    }

    /// Settle the subscription state and answer every waiting subscriber.
    pub fn on_subscribe(&mut self, state: TickerState) {
        self.state = state;
        let subs = self.subscribers();
        for consumer in &subs.consumers {
            consumer.send_ticker_subscribe_response(self);
        }
    }
}
