//! Shared book cache: per-product bid/ask level arrays in shared memory.
//!
//! The producer creates the region ([`SharedBookCache::create`]), hands out a
//! [`ProductSlot`] per live instrument and writes levels through it under the
//! side's [`VersionedLock`]. Consumers attach with [`BookCacheView::attach`],
//! rebuild the layout from the metadata entries and snapshot sides without
//! ever blocking the writer.
//!
//! Slot index is the instrument's locator; capacity is fixed at creation.

use std::{
    path::{Path, PathBuf},
    ptr,
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    book::{
        BookLayout, BookLevel, BookMetadata, ExchangeDepth, LEVEL_SIZE, METADATA_SIZE, SLOT_PENDING, SLOT_READY,
        VenueLayout,
    },
    error::{MdxError, Result},
    lock::{DEFAULT_TIMEOUT_CYCLES, VersionedLock, WriteOutcome},
    shm::ShmSegment,
    types::{DEFAULT_LOT_SIZE, DEFAULT_PRICE_SCALE, EXCHANGE_NONE, Side},
};

/// Upper bound on metadata entries scanned when attaching.
const MAX_VENUES: usize = 64;

// ---------------------------------------------------------------------------
// Address arithmetic shared by producer and consumer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct SideAddr {
    levels: *mut BookLevel,
    lock: *mut u64,
}

impl SideAddr {
    #[inline]
    fn marker(&self) -> *mut u64 {
        // SAFETY: the marker is the second word of the lock slot.
        unsafe { self.lock.add(1) }
    }
}

/// # Safety
///
/// `address` must be the first byte after the metadata of a mapping laid out
/// by `layout`, and `locate` must be below its capacity.
unsafe fn side_addr(address: *mut u8, layout: &BookLayout, locate: u16, venue: &VenueLayout, side: Side) -> SideAddr {
    let product = locate as usize * layout.bytes_per_product();
    let (levels, lock) = match side {
        Side::Bid => (venue.offset_bid, layout.bid_lock_offset()),
        Side::Ask => (venue.offset_ask, layout.ask_lock_offset()),
    };
    // SAFETY: offsets come from the layout that sized the mapping.
    unsafe {
        SideAddr {
            levels: address.add(product + levels) as *mut BookLevel,
            lock: address.add(product + lock) as *mut u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// The producer-owned book cache region.
pub struct SharedBookCache {
    name: String,
    segment: ShmSegment,
    layout: BookLayout,
}

impl SharedBookCache {
    /// Create the region at `path` and blank every slot.
    ///
    /// Fails with [`MdxError::BackingStore`] when the file cannot be created,
    /// sized or mapped; the producer treats that as fatal.
    pub fn create(path: impl AsRef<Path>, exchanges: &[ExchangeDepth], capacity: u16) -> Result<Self> {
        let path = path.as_ref();
        let layout = BookLayout::new(exchanges, capacity as usize)?;
        let segment = ShmSegment::create(path, layout.total_size())?;
        segment.lock_pages();

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let cache = Self { name, segment, layout };
        cache.initialize();
        info!(
            "[book_cache] {} created: {} venue(s), {} slots, {} bytes/product, {} bytes",
            cache.name,
            cache.layout.venues().len(),
            capacity,
            cache.layout.bytes_per_product(),
            cache.size()
        );
        Ok(cache)
    }

    fn initialize(&self) {
        let meta = self.layout.metadata();
        // SAFETY: the mapping is at least metadata_size() bytes and 8-aligned.
        unsafe {
            ptr::copy_nonoverlapping(meta.as_ptr(), self.segment.as_ptr() as *mut BookMetadata, meta.len());
        }

        let address = self.address();
        let bytes_per_side = self.layout.bytes_per_product() / 2;
        let blank = BookLevel::blank(EXCHANGE_NONE, DEFAULT_LOT_SIZE, DEFAULT_PRICE_SCALE);
        for locate in 0..self.layout.capacity() {
            let product = locate * self.layout.bytes_per_product();
            for side_start in [product, product + bytes_per_side] {
                // SAFETY: every write stays inside this product block.
                unsafe {
                    let mut level = address.add(side_start) as *mut BookLevel;
                    for venue in self.layout.venues() {
                        for _ in 0..venue.depth {
                            let mut stamped = blank;
                            stamped.exchange = venue.exchange;
                            level.write(stamped);
                            level = level.add(1);
                        }
                    }
                    level.write(blank);
                    let lock = level.add(1) as *mut u64;
                    lock.write(0);
                    lock.add(1).write(SLOT_PENDING);
                }
            }
        }
    }

    /// First byte after the metadata block.
    pub fn address(&self) -> *mut u8 {
        // SAFETY: the mapping is larger than the metadata block.
        unsafe { self.segment.as_ptr().add(self.layout.metadata_size()) }
    }

    pub fn size(&self) -> usize {
        self.segment.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn layout(&self) -> &BookLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn has_exchange(&self, exchange: u16) -> bool {
        self.layout.venue(exchange).is_some()
    }

    /// Write handle for one instrument on one venue.
    pub fn product(self: &Arc<Self>, locate: u16, exchange: u16) -> Result<ProductSlot> {
        let venue = *self
            .layout
            .venue(exchange)
            .ok_or_else(|| MdxError::Config(format!("{}: exchange {exchange} not provisioned", self.name)))?;
        if locate as usize >= self.layout.capacity() {
            return Err(MdxError::Capacity(format!("{}: locate {locate} beyond {} slots", self.name, self.capacity())));
        }
        // SAFETY: locate checked against capacity; venue from our layout.
        let (bid, ask) = unsafe {
            (
                side_addr(self.address(), &self.layout, locate, &venue, Side::Bid),
                side_addr(self.address(), &self.layout, locate, &venue, Side::Ask),
            )
        };
        Ok(ProductSlot { cache: Arc::clone(self), locate, venue, bid, ask })
    }
}

/// Producer write handle to one instrument's bid and ask blocks.
///
/// Holds the cache alive; only the market-data thread owning the instrument
/// writes through it.
pub struct ProductSlot {
    cache: Arc<SharedBookCache>,
    locate: u16,
    venue: VenueLayout,
    bid: SideAddr,
    ask: SideAddr,
}

// SAFETY: the pointers target the mapping kept alive by `cache`. Writes are
// serialized by the owning thread and published through the lock words.
unsafe impl Send for ProductSlot {}

impl ProductSlot {
    fn side(&self, side: Side) -> &SideAddr {
        match side {
            Side::Bid => &self.bid,
            Side::Ask => &self.ask,
        }
    }

    pub fn locate(&self) -> u16 {
        self.locate
    }

    pub fn exchange(&self) -> u16 {
        self.venue.exchange
    }

    /// Levels visible to consumers on each side.
    pub fn depth(&self) -> usize {
        self.venue.depth as usize
    }

    pub fn cache(&self) -> &Arc<SharedBookCache> {
        &self.cache
    }

    pub fn lock(&self, side: Side) -> VersionedLock<'_> {
        // SAFETY: the lock slot is 8-aligned inside the live mapping.
        unsafe { VersionedLock::from_ptr(self.side(side).lock) }
    }

    pub fn is_ready(&self, side: Side) -> bool {
        // SAFETY: marker word inside the live mapping.
        unsafe { ptr::read_volatile(self.side(side).marker()) == SLOT_READY }
    }

    /// Blank both sides with the instrument's attributes and mark them live.
    pub fn init(&self, blank: &BookLevel, timeout_cycles: u64) {
        for side in [Side::Bid, Side::Ask] {
            self.publish(side, &[], blank, timeout_cycles);
            // SAFETY: marker word inside the live mapping.
            unsafe { ptr::write_volatile(self.side(side).marker(), SLOT_READY) };
        }
    }

    /// Copy `levels` into the side, padding the remaining depth with `blank`.
    pub fn publish(&self, side: Side, levels: &[BookLevel], blank: &BookLevel, timeout_cycles: u64) -> WriteOutcome {
        self.publish_prefix(side, levels, self.depth(), blank, timeout_cycles)
    }

    /// Like [`publish`](Self::publish) but only touches the first `len` levels;
    /// anything past `levels.len()` inside that range is blanked.
    pub fn publish_prefix(
        &self,
        side: Side,
        levels: &[BookLevel],
        len: usize,
        blank: &BookLevel,
        timeout_cycles: u64,
    ) -> WriteOutcome {
        let addr = *self.side(side);
        let lock = self.lock(side);
        let guard = lock.write(timeout_cycles);
        for i in 0..len.min(self.depth()) {
            let level = levels.get(i).unwrap_or(blank);
            // SAFETY: i < depth, inside this venue's block.
            unsafe { ptr::write_volatile(addr.levels.add(i), *level) };
        }
        let outcome = guard.outcome();
        drop(guard);
        self.report(side, outcome)
    }

    /// Overwrite only the top level of a side.
    pub fn publish_top(&self, side: Side, level: &BookLevel, timeout_cycles: u64) -> WriteOutcome {
        let addr = *self.side(side);
        let lock = self.lock(side);
        let guard = lock.write(timeout_cycles);
        // SAFETY: depth is at least one for every provisioned venue.
        unsafe { ptr::write_volatile(addr.levels, *level) };
        let outcome = guard.outcome();
        drop(guard);
        self.report(side, outcome)
    }

    fn report(&self, side: Side, outcome: WriteOutcome) -> WriteOutcome {
        if let WriteOutcome::Forced { dropped_readers } = outcome {
            warn!(
                "[book_cache] {} locate={} {side}: write timed out, dropped readers {dropped_readers:#05x}",
                self.cache.name, self.locate
            );
        }
        outcome
    }

    /// Read back one level as currently stored.
    pub fn read(&self, side: Side, index: usize) -> Option<BookLevel> {
        if index >= self.depth() {
            return None;
        }
        // SAFETY: index < depth.
        Some(unsafe { ptr::read_volatile(self.side(side).levels.add(index)) })
    }

    /// Clear a departed consumer's bit on both lock words.
    pub fn release_reader(&self, reader_id: u8) -> Result<bool> {
        let bid = self.lock(Side::Bid).release_reader(reader_id)?;
        let ask = self.lock(Side::Ask).release_reader(reader_id)?;
        Ok(bid || ask)
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Outcome of a snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapStatus {
    /// `out` holds a consistent copy taken at this version.
    Ok(u64),
    /// The producer has not initialized this slot.
    NotReady,
    /// Every attempt raced a write.
    TimedOut,
}

/// Retry budget for [`BookCacheView::snapshot`].
#[derive(Debug, Clone, Copy)]
pub struct SnapPolicy {
    pub optimistic_attempts: u32,
    pub locked_attempts: u32,
    pub reader_timeout_cycles: u64,
}

impl Default for SnapPolicy {
    fn default() -> Self {
        Self { optimistic_attempts: 8, locked_attempts: 4, reader_timeout_cycles: DEFAULT_TIMEOUT_CYCLES }
    }
}

/// A consumer's attachment to a book cache created by another process.
pub struct BookCacheView {
    segment: ShmSegment,
    layout: BookLayout,
}

impl BookCacheView {
    pub fn attach(path: impl AsRef<Path>) -> Result<Self> {
        let segment = ShmSegment::open(path)?;
        let max_entries = (segment.len() / METADATA_SIZE).min(MAX_VENUES + 1);
        let mut entries = Vec::new();
        for i in 0..max_entries {
            // SAFETY: i * METADATA_SIZE is inside the mapping.
            let entry = unsafe { ptr::read((segment.as_ptr() as *const BookMetadata).add(i)) };
            let populated = entry.is_populated();
            entries.push(entry);
            if !populated {
                break;
            }
        }
        let layout = BookLayout::from_metadata(&entries, segment.len())?;
        Ok(Self { segment, layout })
    }

    pub fn layout(&self) -> &BookLayout {
        &self.layout
    }

    pub fn path(&self) -> PathBuf {
        self.segment.path().to_path_buf()
    }

    /// Copy one side of an instrument's book into `out`.
    ///
    /// Tries lock-free copies first and falls back to registering `reader_id`
    /// on the side's lock word.
    pub fn snapshot(
        &self,
        locate: u16,
        exchange: u16,
        side: Side,
        reader_id: u8,
        policy: SnapPolicy,
        out: &mut Vec<BookLevel>,
    ) -> Result<SnapStatus> {
        let venue = *self
            .layout
            .venue(exchange)
            .ok_or_else(|| MdxError::Config(format!("exchange {exchange} not in cache")))?;
        if locate as usize >= self.layout.capacity() {
            return Err(MdxError::Capacity(format!("locate {locate} beyond {} slots", self.layout.capacity())));
        }
        // SAFETY: locate checked, venue from the layout read out of this mapping.
        let addr = unsafe {
            side_addr(self.segment.as_ptr().add(self.layout.metadata_size()), &self.layout, locate, &venue, side)
        };
        // SAFETY: marker word inside the mapping.
        if unsafe { ptr::read_volatile(addr.marker()) } != SLOT_READY {
            return Ok(SnapStatus::NotReady);
        }
        // SAFETY: 8-aligned lock word inside the mapping.
        let lock = unsafe { VersionedLock::from_ptr(addr.lock) };
        let depth = venue.depth as usize;

        for _ in 0..policy.locked_attempts.max(1) {
            for _ in 0..policy.optimistic_attempts {
                let Some(version) = lock.read_begin_optimistic() else {
                    std::hint::spin_loop();
                    continue;
                };
                copy_levels(addr.levels, depth, out);
                if lock.read_validate(version) {
                    return Ok(SnapStatus::Ok(version));
                }
            }

            let Some(version) = lock.begin_read(reader_id, policy.reader_timeout_cycles)? else {
                return Ok(SnapStatus::TimedOut);
            };
            copy_levels(addr.levels, depth, out);
            if lock.end_read(reader_id)? == version {
                return Ok(SnapStatus::Ok(version));
            }
        }
        Ok(SnapStatus::TimedOut)
    }
}

fn copy_levels(levels: *const BookLevel, depth: usize, out: &mut Vec<BookLevel>) {
    out.clear();
    for i in 0..depth {
        // SAFETY: i < venue depth, inside the mapping.
        out.push(unsafe { ptr::read_volatile(levels.add(i)) });
    }
}

const _: () = assert!(LEVEL_SIZE % 8 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    fn venues() -> [ExchangeDepth; 2] {
        [ExchangeDepth { exchange: 1, depth: 5 }, ExchangeDepth { exchange: 2, depth: 3 }]
    }

    fn level(price: i64, shares: u64) -> BookLevel {
        let mut l = BookLevel::blank(1, 100, 4);
        l.price = price;
        l.shares = shares;
        l.orders = 1;
        l
    }

    #[test]
    fn create_blanks_every_slot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SharedBookCache::create(dir.path().join("book"), &venues(), 16).unwrap());
        assert_eq!(cache.name(), "book");
        assert_eq!(cache.size(), cache.layout().total_size());

        let slot = cache.product(15, 2).unwrap();
        assert!(!slot.is_ready(Side::Bid));
        let l = slot.read(Side::Ask, 2).unwrap();
        assert!(l.is_blank());
        assert_eq!(l.exchange, 2);
        assert!(slot.read(Side::Ask, 3).is_none());
        assert_eq!(slot.lock(Side::Bid).raw(), 0);
    }

    #[test]
    fn product_rejects_unknown_venue_and_locate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SharedBookCache::create(dir.path().join("book"), &venues(), 4).unwrap());
        assert!(cache.product(4, 1).is_err());
        assert!(cache.product(0, 9).is_err());
    }

    #[test]
    fn publish_pads_with_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SharedBookCache::create(dir.path().join("book"), &venues(), 4).unwrap());
        let slot = cache.product(1, 1).unwrap();
        let blank = BookLevel::blank(1, 100, 4);
        slot.init(&blank, 1_000);
        assert!(slot.is_ready(Side::Bid) && slot.is_ready(Side::Ask));

        let outcome = slot.publish(Side::Bid, &[level(101, 5), level(100, 7)], &blank, 1_000);
        assert_eq!(outcome, WriteOutcome::Clean);
        assert_eq!(slot.read(Side::Bid, 0).unwrap().price, 101);
        assert_eq!(slot.read(Side::Bid, 1).unwrap().shares, 7);
        assert!(slot.read(Side::Bid, 2).unwrap().is_blank());
        assert_eq!(slot.lock(Side::Bid).version(), 4);

        slot.publish_top(Side::Bid, &level(102, 1), 1_000);
        assert_eq!(slot.read(Side::Bid, 0).unwrap().price, 102);
        assert_eq!(slot.read(Side::Bid, 1).unwrap().price, 100);
    }

    #[test]
    fn publish_prefix_leaves_tail_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SharedBookCache::create(dir.path().join("book"), &venues(), 4).unwrap());
        let slot = cache.product(0, 1).unwrap();
        let blank = BookLevel::blank(1, 100, 4);
        slot.publish(Side::Ask, &[level(10, 1), level(11, 1), level(12, 1), level(13, 1)], &blank, 1_000);

        slot.publish_prefix(Side::Ask, &[level(10, 2)], 2, &blank, 1_000);
        assert_eq!(slot.read(Side::Ask, 0).unwrap().shares, 2);
        assert!(slot.read(Side::Ask, 1).unwrap().is_blank());
        assert_eq!(slot.read(Side::Ask, 2).unwrap().price, 12);
    }

    #[test]
    fn view_snapshots_what_the_producer_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book");
        let cache = Arc::new(SharedBookCache::create(&path, &venues(), 8).unwrap());
        let slot = cache.product(3, 2).unwrap();

        let view = BookCacheView::attach(&path).unwrap();
        assert_eq!(view.layout(), cache.layout());

        let mut out = Vec::new();
        let status = view.snapshot(3, 2, Side::Ask, 0, SnapPolicy::default(), &mut out).unwrap();
        assert_eq!(status, SnapStatus::NotReady);

        let blank = BookLevel::blank(2, 100, 4);
        slot.init(&blank, 1_000);
        slot.publish(Side::Ask, &[level(200, 3)], &blank, 1_000);
        let status = view.snapshot(3, 2, Side::Ask, 0, SnapPolicy::default(), &mut out).unwrap();
        assert!(matches!(status, SnapStatus::Ok(_)));
        assert_eq!(out.len(), 3);
        assert_eq!((out[0].price, out[0].shares), (200, 3));
        assert!(out[1].is_blank());
        assert_eq!(slot.lock(Side::Ask).readers(), 0);
    }

    #[test]
    fn snapshot_times_out_while_writer_is_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book");
        let cache = Arc::new(SharedBookCache::create(&path, &venues(), 2).unwrap());
        let slot = cache.product(0, 1).unwrap();
        slot.init(&BookLevel::blank(1, 100, 4), 1_000);

        let view = BookCacheView::attach(&path).unwrap();
        slot.lock(Side::Bid).begin_write(0);
        let policy = SnapPolicy { optimistic_attempts: 2, locked_attempts: 1, reader_timeout_cycles: 10_000 };
        let mut out = Vec::new();
        assert_eq!(view.snapshot(0, 1, Side::Bid, 4, policy, &mut out).unwrap(), SnapStatus::TimedOut);
        slot.lock(Side::Bid).end_write();
    }

    #[test]
    fn release_reader_clears_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SharedBookCache::create(dir.path().join("book"), &venues(), 2).unwrap());
        let slot = cache.product(1, 1).unwrap();
        slot.lock(Side::Bid).begin_read(9, 1_000).unwrap();
        slot.lock(Side::Ask).begin_read(9, 1_000).unwrap();
        assert!(slot.release_reader(9).unwrap());
        assert_eq!(slot.lock(Side::Bid).readers() | slot.lock(Side::Ask).readers(), 0);
    }

    #[test]
    fn drop_unlinks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book");
        drop(SharedBookCache::create(&path, &venues(), 2).unwrap());
        assert!(!path.exists());
    }
}
