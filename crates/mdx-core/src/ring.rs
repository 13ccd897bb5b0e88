//! Single-writer single-reader byte ring over heap or shared memory.
//!
//! # Memory layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ RingHeader: magic, version, capacity         │  cache line 0
//! │             write_pos (AtomicU64)            │  cache line 1
//! │             read_pos  (AtomicU64)            │  cache line 2
//! ├──────────────────────────────────────────────┤
//! │ data[capacity]   (capacity is a power of 2)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Positions grow monotonically and are masked into the data area. The writer
//! publishes with a release store of `write_pos`; the reader frees space with a
//! release store of `read_pos`. Neither side ever blocks: a reservation that
//! does not fit returns `None`.
//!
//! Reservations are always contiguous to the caller. When one straddles the end
//! of the data area it is served from a private staging buffer and copied into
//! the two pieces on commit.

use std::{
    alloc::{self, Layout},
    path::Path,
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    error::{MdxError, Result},
    shm::ShmSegment,
};

pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"MDXRING1");
pub const RING_VERSION: u32 = 1;

#[repr(C, align(64))]
struct RingHeader {
    magic: u64,
    version: u32,
    _reserved: u32,
    capacity: u64,
    _pad0: [u8; 40],
    write_pos: AtomicU64,
    _pad1: [u8; 56],
    read_pos: AtomicU64,
    _pad2: [u8; 56],
}

pub const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

const _: () = assert!(RING_HEADER_SIZE == 192);

/// Bytes of backing memory needed for a ring of `capacity` data bytes.
pub const fn ring_size(capacity: usize) -> usize {
    RING_HEADER_SIZE + capacity
}

// ---------------------------------------------------------------------------
// Backing memory
// ---------------------------------------------------------------------------

/// Memory a ring can be laid over.
pub trait RingMemory {
    /// Base address, at least 64-byte aligned.
    fn base(&self) -> *mut u8;
    fn size(&self) -> usize;
}

impl RingMemory for ShmSegment {
    fn base(&self) -> *mut u8 {
        self.as_ptr()
    }

    fn size(&self) -> usize {
        self.len()
    }
}

/// Zeroed, 64-byte aligned heap allocation for in-process rings.
pub struct HeapMemory {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: the allocation is owned exclusively; concurrent access goes through
// the ring's atomics.
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), 64)
            .map_err(|e| MdxError::BackingStore(format!("heap ring layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MdxError::BackingStore(format!("heap ring allocation of {size} bytes failed")));
        }
        Ok(Self { ptr, layout })
    }
}

impl RingMemory for HeapMemory {
    fn base(&self) -> *mut u8 {
        self.ptr
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Reserved {
    len: usize,
    staged: bool,
}

/// One endpoint of a ring. The producer only calls the write half, the
/// consumer only the read half.
pub struct RingBuffer<M: RingMemory> {
    mem: M,
    header: *const RingHeader,
    data: *mut u8,
    capacity: usize,
    mask: u64,
    reserved: Option<Reserved>,
    staging: Vec<u8>,
    scratch: Vec<u8>,
}

// SAFETY: the pointers target `mem`, which moves with the ring.
unsafe impl<M: RingMemory + Send> Send for RingBuffer<M> {}

impl<M: RingMemory> RingBuffer<M> {
    /// Lay a fresh ring of `capacity` data bytes over `mem`.
    pub fn create(mem: M, capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(MdxError::Config(format!("ring capacity {capacity} is not a power of two")));
        }
        if mem.size() < ring_size(capacity) {
            return Err(MdxError::BackingStore(format!(
                "ring of {capacity} bytes needs {} bytes, memory has {}",
                ring_size(capacity),
                mem.size()
            )));
        }
        let header = mem.base() as *mut RingHeader;
        // SAFETY: memory is large enough and 64-aligned; nobody else has
        // attached yet.
        unsafe {
            ptr::addr_of_mut!((*header).magic).write(RING_MAGIC);
            ptr::addr_of_mut!((*header).version).write(RING_VERSION);
            ptr::addr_of_mut!((*header).capacity).write(capacity as u64);
            (*header).write_pos.store(0, Ordering::Relaxed);
            (*header).read_pos.store(0, Ordering::Release);
        }
        Ok(Self::from_parts(mem, capacity))
    }

    /// Attach to a ring another endpoint created.
    pub fn attach(mem: M) -> Result<Self> {
        if mem.size() < RING_HEADER_SIZE {
            return Err(MdxError::BackingStore("memory too small for a ring header".into()));
        }
        let header = mem.base() as *const RingHeader;
        // SAFETY: size checked; fields are plain integers.
        let (magic, version, capacity) =
            unsafe { ((*header).magic, (*header).version, (*header).capacity as usize) };
        if magic != RING_MAGIC || version != RING_VERSION {
            return Err(MdxError::BackingStore(format!("not a ring (magic {magic:#x}, version {version})")));
        }
        if !capacity.is_power_of_two() || mem.size() < ring_size(capacity) {
            return Err(MdxError::BackingStore(format!("ring capacity {capacity} does not fit its memory")));
        }
        Ok(Self::from_parts(mem, capacity))
    }

    fn from_parts(mem: M, capacity: usize) -> Self {
        let header = mem.base() as *const RingHeader;
        // SAFETY: data follows the header inside `mem`.
        let data = unsafe { mem.base().add(RING_HEADER_SIZE) };
        Self {
            mem,
            header,
            data,
            capacity,
            mask: capacity as u64 - 1,
            reserved: None,
            staging: Vec::new(),
            scratch: Vec::new(),
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: header lives in `mem` for the life of self.
        unsafe { &*self.header }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    /// Bytes committed by the writer and not yet consumed.
    pub fn readable(&self) -> usize {
        let h = self.header();
        (h.write_pos.load(Ordering::Acquire) - h.read_pos.load(Ordering::Acquire)) as usize
    }

    /// Bytes the writer could reserve right now.
    pub fn writable(&self) -> usize {
        self.capacity - self.readable()
    }

    // -----------------------------------------------------------------------
    // Writer
    // -----------------------------------------------------------------------

    /// Reserve `n` contiguous writable bytes, or `None` when they do not fit.
    pub fn reserve_write(&mut self, n: usize) -> Option<&mut [u8]> {
        if n == 0 || n > self.capacity {
            return None;
        }
        let h = self.header();
        let w = h.write_pos.load(Ordering::Relaxed);
        let r = h.read_pos.load(Ordering::Acquire);
        if self.capacity - ((w - r) as usize) < n {
            return None;
        }
        let offset = (w & self.mask) as usize;
        if offset + n <= self.capacity {
            self.reserved = Some(Reserved { len: n, staged: false });
            // SAFETY: [offset, offset+n) is inside the data area and free.
            Some(unsafe { std::slice::from_raw_parts_mut(self.data.add(offset), n) })
        } else {
            self.reserved = Some(Reserved { len: n, staged: true });
            self.staging.resize(n, 0);
            Some(&mut self.staging[..n])
        }
    }

    /// Publish the first `n` bytes of the last reservation.
    pub fn commit_write(&mut self, n: usize) {
        let Some(reserved) = self.reserved.take() else {
            debug_assert!(false, "commit_write without reservation");
            return;
        };
        let n = n.min(reserved.len);
        let h = self.header();
        let w = h.write_pos.load(Ordering::Relaxed);
        if reserved.staged {
            let offset = (w & self.mask) as usize;
            let first = n.min(self.capacity - offset);
            // SAFETY: both pieces are inside the data area and were free when
            // reserved; the reader cannot touch them before the store below.
            unsafe {
                ptr::copy_nonoverlapping(self.staging.as_ptr(), self.data.add(offset), first);
                ptr::copy_nonoverlapping(self.staging.as_ptr().add(first), self.data, n - first);
            }
        }
        h.write_pos.store(w + n as u64, Ordering::Release);
    }

    /// Reserve, copy and commit `bytes` in one step.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        match self.reserve_write(bytes.len()) {
            Some(buf) => {
                buf.copy_from_slice(bytes);
                self.commit_write(bytes.len());
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Reader
    // -----------------------------------------------------------------------

    /// Peek at the next `n` committed bytes, or `None` if fewer are available.
    pub fn reserve_read(&mut self, n: usize) -> Option<&[u8]> {
        if n == 0 || n > self.capacity {
            return None;
        }
        let h = self.header();
        let r = h.read_pos.load(Ordering::Relaxed);
        let w = h.write_pos.load(Ordering::Acquire);
        if ((w - r) as usize) < n {
            return None;
        }
        let offset = (r & self.mask) as usize;
        if offset + n <= self.capacity {
            // SAFETY: committed bytes inside the data area.
            Some(unsafe { std::slice::from_raw_parts(self.data.add(offset), n) })
        } else {
            let first = self.capacity - offset;
            self.scratch.resize(n, 0);
            // SAFETY: both pieces are committed and inside the data area.
            unsafe {
                ptr::copy_nonoverlapping(self.data.add(offset), self.scratch.as_mut_ptr(), first);
                ptr::copy_nonoverlapping(self.data, self.scratch.as_mut_ptr().add(first), n - first);
            }
            Some(&self.scratch[..n])
        }
    }

    /// Release `n` bytes back to the writer.
    pub fn commit_read(&mut self, n: usize) {
        let h = self.header();
        let r = h.read_pos.load(Ordering::Relaxed);
        let w = h.write_pos.load(Ordering::Acquire);
        let n = (n as u64).min(w - r);
        h.read_pos.store(r + n, Ordering::Release);
    }
}

impl RingBuffer<HeapMemory> {
    /// In-process ring.
    pub fn heap(capacity: usize) -> Result<Self> {
        Self::create(HeapMemory::new(ring_size(capacity))?, capacity)
    }
}

impl RingBuffer<ShmSegment> {
    /// Create a shared-memory ring file owned by this process.
    pub fn create_shm(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        Self::create(ShmSegment::create(path, ring_size(capacity))?, capacity)
    }

    /// Attach to a ring file created by another process.
    pub fn open_shm(path: impl AsRef<Path>) -> Result<Self> {
        Self::attach(ShmSegment::open(path)?)
    }
}
