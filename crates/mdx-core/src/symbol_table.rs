//! Persistent symbol → locator registry.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ TableHeader { count, cap }   │
//! ├──────────────────────────────┤
//! │ SymbolRecord[0]              │  symbol, locator, in_use, new_symbol,
//! │ SymbolRecord[1]              │  16 × { exchange, max bid/ask depth }
//! │ ...                          │
//! │ SymbolRecord[cap-1]          │
//! └──────────────────────────────┘
//! ```
//!
//! Records are never erased: removal clears `in_use` and returns the record to
//! a FIFO pool, keeping its old locator so a later reuse can hand the same code
//! back out when nothing else claimed it. The in-process indices are rebuilt on
//! every open by scanning all records.

use std::{
    collections::VecDeque,
    fmt::Write as _,
    fs::OpenOptions,
    path::{Path, PathBuf},
    ptr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ahash::AHashMap;
use memmap2::{Mmap, MmapMut};
use tracing::{debug, info, warn};

use crate::{
    error::{MdxError, Result},
    types::{SYMBOL_LEN, symbol_from_bytes, symbol_to_bytes},
};

/// Locator of a record that never had one assigned.
pub const LOCATOR_INVALID: u16 = 0xFFFF;

/// Highest locator the generator may hand out.
pub const LOCATOR_MAX: u16 = 0xFFFE;

/// Per-exchange depth entries in each record.
pub const MAX_VENUE_DEPTHS: usize = 16;

pub const DEFAULT_CAPACITY: u32 = 8192;

// ---------------------------------------------------------------------------
// On-disk structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TableHeader {
    count: u32,
    capacity: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VenueDepthRecord {
    max_bid_depth: u32,
    max_ask_depth: u32,
    exchange: u16,
    _pad: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawRecord {
    symbol: [u8; SYMBOL_LEN],
    locator: u16,
    in_use: u8,
    new_symbol: u8,
    venues: [VenueDepthRecord; MAX_VENUE_DEPTHS],
}

impl RawRecord {
    const BLANK: Self = Self {
        symbol: [0; SYMBOL_LEN],
        locator: LOCATOR_INVALID,
        in_use: 0,
        new_symbol: 0,
        venues: [VenueDepthRecord { max_bid_depth: 0, max_ask_depth: 0, exchange: 0, _pad: 0 }; MAX_VENUE_DEPTHS],
    };
}

const HEADER_SIZE: usize = std::mem::size_of::<TableHeader>();
const RECORD_SIZE: usize = std::mem::size_of::<RawRecord>();

const _: () = assert!(HEADER_SIZE == 8);
const _: () = assert!(RECORD_SIZE == 228);

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Visibility depth recorded for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueDepth {
    pub exchange: u16,
    pub max_bid_depth: u32,
    pub max_ask_depth: u32,
}

/// Owned copy of one symbol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub symbol: String,
    pub locator: u16,
    pub in_use: bool,
    pub new_symbol: bool,
    pub venues: Vec<VenueDepth>,
}

impl From<&RawRecord> for SymbolRecord {
    fn from(raw: &RawRecord) -> Self {
        Self {
            symbol: symbol_from_bytes(&raw.symbol).to_string(),
            locator: raw.locator,
            in_use: raw.in_use != 0,
            new_symbol: raw.new_symbol != 0,
            venues: raw
                .venues
                .iter()
                .filter(|v| v.exchange != 0)
                .map(|v| VenueDepth {
                    exchange: v.exchange,
                    max_bid_depth: v.max_bid_depth,
                    max_ask_depth: v.max_ask_depth,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// SymbolTable
// ---------------------------------------------------------------------------

enum Mapping {
    ReadOnly { _mmap: Mmap },
    ReadWrite(MmapMut),
}

#[derive(Default)]
struct Index {
    by_symbol: AHashMap<String, usize>,
    by_locator: AHashMap<u16, Vec<usize>>,
    free: VecDeque<usize>,
    generator: u16,
}

/// Memory-mapped symbol registry.
pub struct SymbolTable {
    path: PathBuf,
    mode: OpenMode,
    mapping: Mapping,
    base: *mut u8,
    capacity: usize,
    index: Mutex<Index>,
}

// SAFETY: `base` points into `mapping`, owned by the table. Record writes only
// happen while holding the index mutex, and only in read-write mode.
unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

impl SymbolTable {
    /// Open with [`DEFAULT_CAPACITY`] records when creating.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with_capacity(path, mode, DEFAULT_CAPACITY)
    }

    /// Open the table file. Read-write mode creates the file if needed and sizes
    /// it for `capacity` records, growing an existing file but never shrinking
    /// it; read-only mode takes the capacity stored in the header.
    pub fn open_with_capacity(path: impl AsRef<Path>, mode: OpenMode, capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (mapping, base, capacity) = match mode {
            OpenMode::ReadWrite => {
                if capacity == 0 {
                    return Err(MdxError::SymbolTable("capacity must be positive".into()));
                }
                let file = OpenOptions::new().create(true).truncate(false).read(true).write(true).open(&path)?;
                let len = file.metadata()?.len() as usize;
                let stored = u32::try_from(len.saturating_sub(HEADER_SIZE) / RECORD_SIZE).unwrap_or(u32::MAX);
                if stored > capacity {
                    info!("[symbols] {} keeps {stored} records (requested {capacity})", path.display());
                }
                let capacity = capacity.max(stored);
                let size = HEADER_SIZE + capacity as usize * RECORD_SIZE;
                if len < size {
                    file.set_len(size as u64)?;
                }
                // SAFETY: the producer is the only writer of this file.
                let mut mmap = unsafe { MmapMut::map_mut(&file)? };
                let base = mmap.as_mut_ptr();
                // SAFETY: the mapping holds at least a header.
                unsafe { (*(base as *mut TableHeader)).capacity = capacity };
                (Mapping::ReadWrite(mmap), base, capacity as usize)
            }
            OpenMode::ReadOnly => {
                let file = OpenOptions::new().read(true).open(&path)?;
                // SAFETY: read-only view; the producer never shrinks a live table.
                let mmap = unsafe { Mmap::map(&file)? };
                if mmap.len() < HEADER_SIZE {
                    return Err(MdxError::SymbolTable(format!("{}: truncated header", path.display())));
                }
                let base = mmap.as_ptr() as *mut u8;
                // SAFETY: length checked above.
                let header = unsafe { ptr::read(base as *const TableHeader) };
                let capacity = header.capacity as usize;
                if mmap.len() < HEADER_SIZE + capacity * RECORD_SIZE {
                    return Err(MdxError::SymbolTable(format!(
                        "{}: {} bytes cannot hold {capacity} records",
                        path.display(),
                        mmap.len()
                    )));
                }
                (Mapping::ReadOnly { _mmap: mmap }, base, capacity)
            }
        };

        let table = Self { path, mode, mapping, base, capacity, index: Mutex::new(Index::default()) };
        table.rebuild()?;
        info!(
            "[symbols] {} opened {:?}: {} in use of {}",
            table.path.display(),
            table.mode,
            table.count(),
            table.capacity
        );
        Ok(table)
    }

    fn rebuild(&self) -> Result<()> {
        let mut index = self.lock();
        let writable = self.mode == OpenMode::ReadWrite;
        let mut in_use = 0u32;

        for i in 0..self.capacity {
            let mut rec = self.read(i);
            if rec.in_use != 0 {
                let symbol = symbol_from_bytes(&rec.symbol).to_string();
                if rec.locator == LOCATOR_INVALID || index.by_symbol.contains_key(&symbol) {
                    return Err(MdxError::SymbolTable(format!("record {i} ({symbol}) is corrupt or duplicated")));
                }
                index.by_symbol.insert(symbol, i);
                index.by_locator.entry(rec.locator).or_default().push(i);
                in_use += 1;
                if writable && rec.new_symbol != 0 {
                    rec.new_symbol = 0;
                    self.write(i, &rec);
                }
            } else {
                if writable && rec.locator == 0 {
                    rec = RawRecord::BLANK;
                    self.write(i, &rec);
                }
                index.free.push_back(i);
            }
            if rec.locator != LOCATOR_INVALID {
                index.generator = index.generator.max(rec.locator);
            }
        }

        if writable {
            self.set_count(in_use);
            self.flush(0, HEADER_SIZE + self.capacity * RECORD_SIZE);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    #[inline]
    fn record_offset(i: usize) -> usize {
        HEADER_SIZE + i * RECORD_SIZE
    }

    fn read(&self, i: usize) -> RawRecord {
        debug_assert!(i < self.capacity);
        // SAFETY: i < capacity, the mapping was sized for capacity records.
        unsafe { ptr::read_unaligned(self.base.add(Self::record_offset(i)) as *const RawRecord) }
    }

    fn write(&self, i: usize, rec: &RawRecord) {
        debug_assert!(self.mode == OpenMode::ReadWrite && i < self.capacity);
        // SAFETY: read-write mapping, i < capacity, caller holds the index lock.
        unsafe { ptr::write_unaligned(self.base.add(Self::record_offset(i)) as *mut RawRecord, *rec) }
    }

    fn header(&self) -> TableHeader {
        // SAFETY: the mapping always holds a header.
        unsafe { ptr::read(self.base as *const TableHeader) }
    }

    fn set_count(&self, count: u32) {
        // SAFETY: read-write mapping, caller holds the index lock.
        unsafe { (*(self.base as *mut TableHeader)).count = count };
    }

    fn flush(&self, offset: usize, len: usize) {
        if let Mapping::ReadWrite(mmap) = &self.mapping
            && let Err(e) = mmap.flush_async_range(offset, len)
        {
            warn!("[symbols] async flush of {} failed: {e}", self.path.display());
        }
    }

    fn flush_record(&self, i: usize) {
        self.flush(0, HEADER_SIZE);
        self.flush(Self::record_offset(i), RECORD_SIZE);
    }

    fn require_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(MdxError::ReadOnly(self.path.display().to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// In-use records as recorded in the file header.
    pub fn count(&self) -> u32 {
        self.header().count
    }

    /// Locator of `symbol`, assigning one when `create` is set and the symbol
    /// is unknown.
    pub fn locate(&self, symbol: &str, create: bool) -> Result<Option<u16>> {
        if symbol.is_empty() || symbol.len() > SYMBOL_LEN {
            return Err(MdxError::SymbolTable(format!("invalid symbol {symbol:?}")));
        }
        let mut index = self.lock();
        if let Some(&i) = index.by_symbol.get(symbol) {
            return Ok(Some(self.read(i).locator));
        }
        if !create {
            return Ok(None);
        }
        self.require_writable()?;
        self.add_symbol(&mut index, symbol, None).map(Some)
    }

    /// Every in-use record sharing `locator` (a symbol and its aliases).
    pub fn locate_by_locator(&self, locator: u16) -> Vec<SymbolRecord> {
        let index = self.lock();
        index
            .by_locator
            .get(&locator)
            .map(|slots| slots.iter().map(|&i| SymbolRecord::from(&self.read(i))).collect())
            .unwrap_or_default()
    }

    /// Owned copy of a symbol's record.
    pub fn record(&self, symbol: &str) -> Option<SymbolRecord> {
        let index = self.lock();
        index.by_symbol.get(symbol).map(|&i| SymbolRecord::from(&self.read(i)))
    }

    /// One `locator,symbol,new` line per in-use record, ordered by locator.
    pub fn dump(&self) -> String {
        let index = self.lock();
        let mut records: Vec<SymbolRecord> =
            index.by_symbol.values().map(|&i| SymbolRecord::from(&self.read(i))).collect();
        records.sort_by(|a, b| a.locator.cmp(&b.locator).then_with(|| a.symbol.cmp(&b.symbol)));
        let mut out = String::new();
        for r in records {
            let _ = writeln!(out, "{},{},{}", r.locator, r.symbol, u8::from(r.new_symbol));
        }
        out
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    fn add_symbol(&self, index: &mut Index, symbol: &str, locator: Option<u16>) -> Result<u16> {
        let Some(slot) = index.free.pop_front() else {
            return Err(MdxError::Capacity(format!("{}: all {} records in use", self.path.display(), self.capacity)));
        };
        let mut rec = self.read(slot);

        let locator = match locator {
            Some(l) => l,
            None if rec.locator != LOCATOR_INVALID && !index.by_locator.contains_key(&rec.locator) => rec.locator,
            None => {
                if index.generator >= LOCATOR_MAX {
                    index.free.push_front(slot);
                    return Err(MdxError::Capacity("locator space exhausted".into()));
                }
                index.generator += 1;
                index.generator
            }
        };

        rec.symbol = symbol_to_bytes(symbol);
        rec.locator = locator;
        rec.in_use = 1;
        rec.new_symbol = 1;
        rec.venues = RawRecord::BLANK.venues;
        self.write(slot, &rec);
        self.set_count(self.header().count + 1);
        self.flush_record(slot);

        index.by_symbol.insert(symbol.to_string(), slot);
        index.by_locator.entry(locator).or_default().push(slot);
        debug!("[symbols] added {symbol} locator={locator} record={slot}");
        Ok(locator)
    }

    /// Register `target` as an alias sharing `source`'s locator.
    pub fn alias(&self, source: &str, target: &str) -> Result<u16> {
        self.require_writable()?;
        if target.is_empty() || target.len() > SYMBOL_LEN {
            return Err(MdxError::SymbolTable(format!("invalid symbol {target:?}")));
        }
        let mut index = self.lock();
        let Some(&src) = index.by_symbol.get(source) else {
            return Err(MdxError::SymbolTable(format!("alias source {source} is not registered")));
        };
        let locator = self.read(src).locator;
        if let Some(&existing) = index.by_symbol.get(target) {
            let current = self.read(existing).locator;
            if current == locator {
                return Ok(locator);
            }
            return Err(MdxError::SymbolTable(format!("{target} already holds locator {current}")));
        }
        self.add_symbol(&mut index, target, Some(locator))
    }

    /// Mark `symbol` not-in-use and return its record to the pool.
    pub fn remove(&self, symbol: &str) -> Result<bool> {
        self.require_writable()?;
        let mut index = self.lock();
        let Some(slot) = index.by_symbol.remove(symbol) else {
            return Ok(false);
        };
        let mut rec = self.read(slot);
        if let Some(slots) = index.by_locator.get_mut(&rec.locator) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                index.by_locator.remove(&rec.locator);
            }
        }
        rec.in_use = 0;
        rec.new_symbol = 0;
        self.write(slot, &rec);
        self.set_count(self.header().count.saturating_sub(1));
        self.flush_record(slot);
        index.free.push_back(slot);
        debug!("[symbols] removed {symbol} locator={}", rec.locator);
        Ok(true)
    }

    /// Raise the recorded visibility depth of `symbol` on `exchange`.
    ///
    /// Depths only grow. Returns `false` when the symbol is unknown or all
    /// venue entries are taken by other exchanges.
    pub fn update_venue_depth(&self, symbol: &str, exchange: u16, bid_depth: u32, ask_depth: u32) -> Result<bool> {
        self.require_writable()?;
        let index = self.lock();
        let Some(&slot) = index.by_symbol.get(symbol) else {
            return Ok(false);
        };
        let mut rec = self.read(slot);
        let entry = match rec.venues.iter().position(|v| v.exchange == exchange) {
            Some(i) => i,
            None => match rec.venues.iter().position(|v| v.exchange == 0) {
                Some(i) => i,
                None => return Ok(false),
            },
        };
        let v = &mut rec.venues[entry];
        v.exchange = exchange;
        v.max_bid_depth = v.max_bid_depth.max(bid_depth);
        v.max_ask_depth = v.max_ask_depth.max(ask_depth);
        self.write(slot, &rec);
        self.flush_record(slot);
        Ok(true)
    }
}
