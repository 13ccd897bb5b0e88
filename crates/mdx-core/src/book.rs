//! Book level records and the byte layout of the shared book cache.
//!
//! # Memory layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ BookMetadata[venue 0] .. BookMetadata[venue N-1], blank entry │
//! ├───────────────────────────────────────────────────────────────┤  <- address()
//! │ product 0                                                     │
//! │   bid: venue0 levels | venue1 levels | .. | separator | lock  │
//! │   ask: venue0 levels | venue1 levels | .. | separator | lock  │
//! ├───────────────────────────────────────────────────────────────┤
//! │ product 1 ..                                                  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each side spans `total_depth + 2` level-sized slots. The last slot holds the
//! side's lock word in its first 8 bytes and a readiness marker in the next 8;
//! the marker is [`SLOT_PENDING`] until the producer has stamped the slot for a
//! live instrument, and consumers skip pending slots.

use crate::{
    error::{MdxError, Result},
    types::{DEFAULT_LOT_SIZE, DEFAULT_PRICE_SCALE, EXCHANGE_NONE, PRICE_BLANK},
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One price level as stored in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookLevel {
    pub price: i64,
    pub shares: u64,
    pub sequence: u64,
    pub update_ts: u64,
    pub timestamp: u64,
    pub orders: u32,
    pub lot_size: u32,
    pub exchange: u16,
    pub price_scale: u8,
    _pad: [u8; 5],
}

pub const LEVEL_SIZE: usize = std::mem::size_of::<BookLevel>();

const _: () = assert!(LEVEL_SIZE == 56);
const _: () = assert!(std::mem::align_of::<BookLevel>() == 8);

impl Default for BookLevel {
    fn default() -> Self {
        Self::blank(EXCHANGE_NONE, DEFAULT_LOT_SIZE, DEFAULT_PRICE_SCALE)
    }
}

impl BookLevel {
    /// An empty level stamped with the venue's static attributes.
    pub const fn blank(exchange: u16, lot_size: u32, price_scale: u8) -> Self {
        Self {
            price: PRICE_BLANK,
            shares: 0,
            sequence: 0,
            update_ts: 0,
            timestamp: 0,
            orders: 0,
            lot_size,
            exchange,
            price_scale,
            _pad: [0; 5],
        }
    }

    #[inline]
    pub fn is_blank(&self) -> bool {
        self.price == PRICE_BLANK
    }
}

/// Watermark identifying a populated metadata entry.
pub const METADATA_WATERMARK: [u8; 8] = *b"b00kMeTA";

/// Per-venue descriptor at the head of the cache.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookMetadata {
    pub watermark: [u8; 8],
    /// Byte offset of this venue's bid levels within a product block.
    pub offset_bid: u32,
    /// Byte offset of this venue's ask levels within a product block.
    pub offset_ask: u32,
    pub exchange: u16,
    pub depth: u8,
    _pad: [u8; 5],
}

pub const METADATA_SIZE: usize = std::mem::size_of::<BookMetadata>();

const _: () = assert!(METADATA_SIZE == 24);

impl BookMetadata {
    pub const BLANK: Self =
        Self { watermark: [0; 8], offset_bid: 0, offset_ask: 0, exchange: EXCHANGE_NONE, depth: 0, _pad: [0; 5] };

    fn for_venue(venue: &VenueLayout) -> Self {
        Self {
            watermark: METADATA_WATERMARK,
            offset_bid: venue.offset_bid as u32,
            offset_ask: venue.offset_ask as u32,
            exchange: venue.exchange,
            depth: venue.depth,
            _pad: [0; 5],
        }
    }

    pub fn is_populated(&self) -> bool {
        self.watermark == METADATA_WATERMARK && self.exchange != EXCHANGE_NONE
    }
}

/// Readiness marker value for a slot nobody has initialized yet.
pub const SLOT_PENDING: u64 = 0xdead_beef_dead_beef;

/// Readiness marker value for a live slot.
pub const SLOT_READY: u64 = 0;

// ---------------------------------------------------------------------------
// Layout arithmetic
// ---------------------------------------------------------------------------

/// Slots per side: the levels, one separator and one lock slot.
#[inline]
pub const fn levels_per_side(total_depth: usize) -> usize {
    total_depth + 2
}

#[inline]
pub const fn bytes_per_side(total_depth: usize) -> usize {
    levels_per_side(total_depth) * LEVEL_SIZE
}

#[inline]
pub const fn bytes_per_product(total_depth: usize) -> usize {
    2 * bytes_per_side(total_depth)
}

/// Offset of the bid lock word within a product block.
#[inline]
pub const fn bid_lock_offset(total_depth: usize) -> usize {
    (total_depth + 1) * LEVEL_SIZE
}

/// Offset of the ask lock word within a product block.
#[inline]
pub const fn ask_lock_offset(total_depth: usize) -> usize {
    bytes_per_side(total_depth) + bid_lock_offset(total_depth)
}

/// Requested depth for one venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeDepth {
    pub exchange: u16,
    pub depth: u8,
}

/// Where one venue's levels sit inside a product block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueLayout {
    pub exchange: u16,
    pub depth: u8,
    pub offset_bid: usize,
    pub offset_ask: usize,
}

/// Complete layout of a book cache region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookLayout {
    venues: Vec<VenueLayout>,
    total_depth: usize,
    capacity: usize,
}

impl BookLayout {
    pub fn new(exchanges: &[ExchangeDepth], capacity: usize) -> Result<Self> {
        if exchanges.is_empty() {
            return Err(MdxError::Config("book cache needs at least one exchange".into()));
        }
        let total_depth: usize = exchanges.iter().map(|e| e.depth as usize).sum();
        let side = bytes_per_side(total_depth);

        let mut venues = Vec::with_capacity(exchanges.len());
        let mut offset = 0usize;
        for e in exchanges {
            if e.exchange == EXCHANGE_NONE || e.depth == 0 {
                return Err(MdxError::Config(format!("invalid venue {} with depth {}", e.exchange, e.depth)));
            }
            if venues.iter().any(|v: &VenueLayout| v.exchange == e.exchange) {
                return Err(MdxError::Config(format!("duplicate venue {}", e.exchange)));
            }
            venues.push(VenueLayout {
                exchange: e.exchange,
                depth: e.depth,
                offset_bid: offset,
                offset_ask: side + offset,
            });
            offset += e.depth as usize * LEVEL_SIZE;
        }
        Ok(Self { venues, total_depth, capacity })
    }

    /// Rebuild a layout from the metadata entries of an existing region.
    pub fn from_metadata(entries: &[BookMetadata], region_len: usize) -> Result<Self> {
        let venues: Vec<ExchangeDepth> = entries
            .iter()
            .take_while(|m| m.is_populated())
            .map(|m| ExchangeDepth { exchange: m.exchange, depth: m.depth })
            .collect();
        let mut layout = Self::new(&venues, 0)?;

        for (venue, meta) in layout.venues.iter().zip(entries) {
            if venue.offset_bid != meta.offset_bid as usize || venue.offset_ask != meta.offset_ask as usize {
                return Err(MdxError::BackingStore(format!(
                    "metadata offsets for venue {} are inconsistent",
                    venue.exchange
                )));
            }
        }
        let payload = region_len
            .checked_sub(layout.metadata_size())
            .ok_or_else(|| MdxError::BackingStore("region smaller than its metadata".into()))?;
        layout.capacity = payload / layout.bytes_per_product();
        Ok(layout)
    }

    pub fn venues(&self) -> &[VenueLayout] {
        &self.venues
    }

    pub fn venue(&self, exchange: u16) -> Option<&VenueLayout> {
        self.venues.iter().find(|v| v.exchange == exchange)
    }

    pub fn total_depth(&self) -> usize {
        self.total_depth
    }

    /// Number of product slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Metadata entries including the blank terminator.
    pub fn metadata_size(&self) -> usize {
        (self.venues.len() + 1) * METADATA_SIZE
    }

    pub fn metadata(&self) -> Vec<BookMetadata> {
        let mut out: Vec<BookMetadata> = self.venues.iter().map(BookMetadata::for_venue).collect();
        out.push(BookMetadata::BLANK);
        out
    }

    pub fn bytes_per_product(&self) -> usize {
        bytes_per_product(self.total_depth)
    }

    pub fn bid_lock_offset(&self) -> usize {
        bid_lock_offset(self.total_depth)
    }

    pub fn ask_lock_offset(&self) -> usize {
        ask_lock_offset(self.total_depth)
    }

    /// Offset of a product block from the first byte after the metadata.
    pub fn product_offset(&self, locate: u16) -> Option<usize> {
        ((locate as usize) < self.capacity).then(|| locate as usize * self.bytes_per_product())
    }

    /// Total bytes of the region.
    pub fn total_size(&self) -> usize {
        self.metadata_size() + self.capacity * self.bytes_per_product()
    }
}
