//! Versioned reader/writer lock packed into one 64-bit word.
//!
//! ```text
//!  63                                   12 11              0
//! ┌──────────────────────────────────────┬─────────────────┐
//! │ version (52 bits)                    │ reader bitmap   │
//! └──────────────────────────────────────┴─────────────────┘
//! ```
//!
//! The version is even while the protected records are stable. A writer moves
//! it to odd only after it has seen the reader bitmap empty and the version
//! even, and back to even when it publishes. Writers therefore exclude each
//! other, which matters when several venues of one cache share a product.
//!
//! A reader sets its own bit while the version is even, copies, clears the
//! bit and compares versions; a mismatch means the copy raced a (forced)
//! write and must be discarded.
//!
//! The writer never waits on readers forever: after `timeout_cycles` it drops
//! every reader bit and proceeds, reporting the dropped bitmap in
//! [`WriteOutcome::Forced`]. A reader that died holding its bit therefore costs
//! one timeout on the next write, and its bit stays set until that write or an
//! explicit [`VersionedLock::release_reader`] on unsubscribe.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::{
    error::{MdxError, Result},
    time_util::cycles,
};

/// Number of low bits reserved for the reader bitmap.
pub const READER_BITS: u32 = 12;

/// Distinct reader identities supported by one lock word.
pub const MAX_READERS: u8 = READER_BITS as u8;

const READER_MASK: u64 = (1 << READER_BITS) - 1;
const VERSION_MASK: u64 = !READER_MASK;
const VERSION_ONE: u64 = 1 << READER_BITS;

/// Default bound for writer and reader spins, in [`cycles`] units.
pub const DEFAULT_TIMEOUT_CYCLES: u64 = 3_000_000;

#[inline]
pub fn version_of(word: u64) -> u64 {
    word >> READER_BITS
}

#[inline]
pub fn readers_of(word: u64) -> u16 {
    (word & READER_MASK) as u16
}

/// How a write section was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bitmap was empty; no reader was disturbed.
    Clean,
    /// The timeout expired; these reader bits were cleared by force.
    Forced { dropped_readers: u16 },
}

/// A view over a lock word that lives in shared (or heap) memory.
#[derive(Debug, Clone, Copy)]
pub struct VersionedLock<'a> {
    word: &'a AtomicU64,
}

impl<'a> VersionedLock<'a> {
    pub fn new(word: &'a AtomicU64) -> Self {
        Self { word }
    }

    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, valid for reads and writes for `'a`, and
    /// only ever accessed atomically while the view exists.
    pub unsafe fn from_ptr(ptr: *mut u64) -> Self {
        // SAFETY: forwarded to the caller.
        Self { word: unsafe { AtomicU64::from_ptr(ptr) } }
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    #[inline]
    pub fn version(&self) -> u64 {
        version_of(self.raw())
    }

    #[inline]
    pub fn readers(&self) -> u16 {
        readers_of(self.raw())
    }

    /// Reset the word to version 0 with no readers. Only valid before any
    /// reader can observe it.
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Writer side
    // -----------------------------------------------------------------------

    /// One attempt to enter the write section. Succeeds only if no reader bit
    /// is set and no other writer holds the word.
    #[inline]
    pub fn try_begin_write(&self) -> bool {
        let current = self.word.load(Ordering::Relaxed);
        let expected = current & VERSION_MASK;
        if current != expected || version_of(current) & 1 != 0 {
            return false;
        }
        let target = expected.wrapping_add(VERSION_ONE);
        if self.word.compare_exchange(expected, target, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            fence(Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Enter the write section, waiting at most `timeout_cycles` for readers to
    /// leave. Must be paired with [`end_write`](Self::end_write).
    pub fn begin_write(&self, timeout_cycles: u64) -> WriteOutcome {
        let start = cycles();
        loop {
            if self.try_begin_write() {
                return WriteOutcome::Clean;
            }
            if cycles().wrapping_sub(start) > timeout_cycles {
                return self.force_begin_write();
            }
            std::hint::spin_loop();
        }
    }

    /// Drops reader bits but still waits out another writer: two venues of
    /// one cache share a product's lock words.
    fn force_begin_write(&self) -> WriteOutcome {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if version_of(current) & 1 != 0 {
                std::hint::spin_loop();
                current = self.word.load(Ordering::Relaxed);
                continue;
            }
            let target = (current & VERSION_MASK).wrapping_add(VERSION_ONE);
            match self.word.compare_exchange_weak(current, target, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(prev) => {
                    fence(Ordering::Release);
                    let dropped = readers_of(prev);
                    if dropped == 0 {
                        return WriteOutcome::Clean;
                    }
                    return WriteOutcome::Forced { dropped_readers: dropped };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Leave the write section, publishing the update.
    #[inline]
    pub fn end_write(&self) {
        let current = self.word.load(Ordering::Relaxed);
        self.word.store(current.wrapping_add(VERSION_ONE), Ordering::Release);
    }

    /// RAII form of `begin_write`/`end_write`.
    pub fn write(&self, timeout_cycles: u64) -> WriteGuard<'a> {
        let outcome = self.begin_write(timeout_cycles);
        WriteGuard { lock: *self, outcome }
    }

    // -----------------------------------------------------------------------
    // Reader side
    // -----------------------------------------------------------------------

    fn reader_bit(reader_id: u8) -> Result<u64> {
        if reader_id >= MAX_READERS {
            return Err(MdxError::Lock(format!("reader id {reader_id} exceeds bitmap width {MAX_READERS}")));
        }
        Ok(1u64 << reader_id)
    }

    /// One attempt to register as a reader. `Ok(None)` when a write is in
    /// progress or the CAS lost a race.
    pub fn try_begin_read(&self, reader_id: u8) -> Result<Option<u64>> {
        let bit = Self::reader_bit(reader_id)?;
        let current = self.word.load(Ordering::Relaxed);
        let version = version_of(current);
        if version & 1 != 0 {
            return Ok(None);
        }
        match self.word.compare_exchange(current, current | bit, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Ok(Some(version)),
            Err(_) => Ok(None),
        }
    }

    /// Register as a reader, spinning while a write is in progress. Returns the
    /// stable version observed, or `None` once `timeout_cycles` elapse.
    pub fn begin_read(&self, reader_id: u8, timeout_cycles: u64) -> Result<Option<u64>> {
        let start = cycles();
        loop {
            if let Some(version) = self.try_begin_read(reader_id)? {
                return Ok(Some(version));
            }
            if cycles().wrapping_sub(start) > timeout_cycles {
                return Ok(None);
            }
            std::hint::spin_loop();
        }
    }

    /// Clear the reader bit and return the current version. The copy taken
    /// since `begin_read` is valid only if this equals the version it returned.
    pub fn end_read(&self, reader_id: u8) -> Result<u64> {
        let bit = Self::reader_bit(reader_id)?;
        let prev = self.word.fetch_and(!bit, Ordering::AcqRel);
        Ok(version_of(prev))
    }

    /// Clear a reader bit left behind by a departed consumer. Returns whether
    /// the bit was set.
    pub fn release_reader(&self, reader_id: u8) -> Result<bool> {
        let bit = Self::reader_bit(reader_id)?;
        let prev = self.word.fetch_and(!bit, Ordering::AcqRel);
        Ok(prev & bit != 0)
    }

    // -----------------------------------------------------------------------
    // Optimistic read
    // -----------------------------------------------------------------------

    /// Stable version for a lock-free copy, or `None` if a write is running.
    #[inline]
    pub fn read_begin_optimistic(&self) -> Option<u64> {
        let version = version_of(self.word.load(Ordering::Acquire));
        (version & 1 == 0).then_some(version)
    }

    /// `true` if no write started since `read_begin_optimistic` returned `version`.
    #[inline]
    pub fn read_validate(&self, version: u64) -> bool {
        fence(Ordering::Acquire);
        version_of(self.word.load(Ordering::Relaxed)) == version
    }
}

/// Ends the write section when dropped.
#[must_use = "dropping the guard immediately publishes an empty write"]
pub struct WriteGuard<'a> {
    lock: VersionedLock<'a>,
    outcome: WriteOutcome,
}

impl WriteGuard<'_> {
    pub fn outcome(&self) -> WriteOutcome {
        self.outcome
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.end_write();
    }
}
