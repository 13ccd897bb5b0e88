//! File-backed shared memory segments.
//!
//! Segments are plain files mapped with `memmap2`, normally under `/dev/shm`
//! so that the pages never touch a disk. The producer creates (and on drop
//! unlinks) every segment it owns; consumers attach to an existing path handed
//! to them over the control channel and never unlink.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use memmap2::MmapMut;
use tracing::{debug, error};

use crate::error::{MdxError, Result};

/// Default directory for segment files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Join a segment name onto a directory.
pub fn shm_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(name)
}

/// A read-write mapping of a shared memory file.
pub struct ShmSegment {
    path: PathBuf,
    mmap: MmapMut,
    base: *mut u8,
    owner: bool,
}

// SAFETY: `base` points into `mmap`, which lives as long as the segment.
// Concurrent access to the mapped bytes is coordinated by the structures laid
// over it (lock words, ring cursors), never by the segment itself.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a zero-filled segment of `size` bytes, replacing any stale file.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if size == 0 {
            return Err(MdxError::BackingStore(format!("{}: zero-sized segment", path.display())));
        }
        let _ = std::fs::remove_file(&path);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| MdxError::BackingStore(format!("{}: open failed: {e}", path.display())))?;
        file.set_len(size as u64)
            .map_err(|e| MdxError::BackingStore(format!("{}: resize to {size} failed: {e}", path.display())))?;

        // SAFETY: the file was just created by us; other processes only map it
        // after learning the path from us.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| MdxError::BackingStore(format!("{}: mmap failed: {e}", path.display())))?;
        let base = mmap.as_mut_ptr();
        debug!("[shm] created {} ({size} bytes)", path.display());
        Ok(Self { path, mmap, base, owner: true })
    }

    /// Map an existing segment read-write without taking ownership.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| MdxError::BackingStore(format!("{}: open failed: {e}", path.display())))?;

        // SAFETY: the producer keeps the file at a fixed size for its lifetime.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| MdxError::BackingStore(format!("{}: mmap failed: {e}", path.display())))?;
        let base = mmap.as_mut_ptr();
        Ok(Self { path, mmap, base, owner: false })
    }

    /// Pin the pages in RAM. Failure is logged and otherwise ignored.
    pub fn lock_pages(&self) -> bool {
        match mlock(self.base, self.len()) {
            Ok(()) => true,
            Err(e) => {
                error!("[shm] mlock {} failed: {e}", self.path.display());
                false
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Schedule write-back of a byte range without waiting for it.
    pub fn flush_async_range(&self, offset: usize, len: usize) -> Result<()> {
        self.mmap.flush_async_range(offset, len)?;
        Ok(())
    }
}

#[cfg(unix)]
fn mlock(base: *mut u8, len: usize) -> std::io::Result<()> {
    // SAFETY: callers pass exactly a live mapping.
    if unsafe { libc::mlock(base as *const libc::c_void, len) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn mlock(_base: *mut u8, _len: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "mlock not available"))
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.owner
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            debug!("[shm] unlink {} failed: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = shm_path(dir.path(), "seg");
        {
            let seg = ShmSegment::create(&path, 4096).unwrap();
            assert_eq!(seg.len(), 4096);
            assert!(path.exists());
            // SAFETY: within the mapping.
            unsafe { seg.as_ptr().write(7) };

            let reader = ShmSegment::open(&path).unwrap();
            assert!(!reader.is_owner());
            // SAFETY: within the mapping.
            assert_eq!(unsafe { reader.as_ptr().read() }, 7);
        }
        assert!(!path.exists());
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmSegment::open(dir.path().join("nope")).is_err());
        assert!(ShmSegment::create(dir.path().join("zero"), 0).is_err());
    }
}
