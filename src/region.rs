// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The mapped region: header, index cells, per-bucket locks, and the value
// area, all carved out of one `ShmHandle`. Offsets into the index and bucket
// lock arrays are compile-time constants driven by `KEYS_SLOTS`; the value
// area is whatever is left over.
//
// First-attacher initialisation follows the same double-checked idiom the
// teacher uses for lazily-constructed shared objects (see `circ.rs`'s
// `constructed: AtomicBool`): the creator stamps every other header field
// first, then publishes `magic` last with `Release` ordering. Every other
// attacher spins on an `Acquire` load of `magic` until it sees the published
// value, instead of trusting `is_creator()` timing alone.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, MAGIC, SCHEMA_VERSION};
use crate::error::{CacheError, Result};
use crate::rw_lock::RwLock;
use crate::shm::{ShmHandle, ShmOpenMode};

/// How long a newly-attached (non-creating) handle will spin waiting for the
/// creator to finish publishing the header before giving up.
const INIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed region header. Embeds the three top-level locks directly so they
/// live in shared memory with everything else — no separate allocation.
#[repr(C)]
pub struct Header {
    magic: AtomicU64,
    version: AtomicU64,
    total_size: AtomicU64,
    oldest_chunk: AtomicI64,
    hits: AtomicU64,
    misses: AtomicU64,
    pub(crate) alloc_lock: RwLock,
    pub(crate) stats_lock: RwLock,
    pub(crate) oldest_lock: RwLock,
}

impl Header {
    pub fn oldest_chunk(&self) -> i64 {
        self.oldest_chunk.load(Ordering::Acquire)
    }

    pub fn set_oldest_chunk(&self, offset: i64) {
        self.oldest_chunk.store(offset, Ordering::Release);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn fetch_add_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn fetch_add_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const INDEX_CELL_SIZE: usize = std::mem::size_of::<AtomicI64>();
const BUCKET_LOCK_SIZE: usize = std::mem::size_of::<RwLock>();

/// `ChunkMeta` (in `chunk_store.rs`) needs 8-byte alignment for its `u64`
/// fields. The bucket-lock array's stride is 4 bytes, so its total size
/// isn't guaranteed to land on an 8-byte boundary for an arbitrary
/// `KEYS_SLOTS` — round the value area's start up explicitly rather than
/// relying on `KEYS_SLOTS` happening to be even.
const VALUE_AREA_ALIGN: usize = 8;

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// The mapped region, carved into header / index / bucket-lock / value areas.
pub struct Region {
    shm: ShmHandle,
    keys_slots: usize,
}

impl Region {
    /// Open or create the named region per `config`, running first-attacher
    /// initialisation (or waiting for it) as needed.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let keys_slots = crate::config::KEYS_SLOTS;
        let size = config.resolve_size()?;
        let min_size = Self::layout_overhead(keys_slots)
            + crate::chunk_store::CHUNK_META_SIZE
            + crate::config::MIN_VALUE_ALLOC_SIZE;
        if size < min_size {
            return Err(CacheError::Config(format!(
                "resolved region size {} is too small to hold the header, index, \
                 bucket locks and one minimum-size chunk ({} bytes required)",
                size, min_size
            )));
        }

        let shm = match config.mode {
            crate::config::OpenMode::Create => {
                ShmHandle::acquire(&config.name, size, ShmOpenMode::Create)?
            }
            crate::config::OpenMode::Attach => {
                ShmHandle::acquire(&config.name, size, ShmOpenMode::Open)?
            }
            crate::config::OpenMode::CreateOrAttach => {
                Self::create_or_attach_resizing(&config.name, size)?
            }
        };
        let region = Self { shm, keys_slots };

        if region.shm.is_creator() {
            region.init_fresh()?;
        } else {
            region.await_initialised()?;
        }

        Ok(region)
    }

    /// Create-or-attach, but destroy and recreate a too-small existing
    /// region instead of silently attaching to it. Attaching to an existing
    /// region smaller than `size` would leave every offset computed from
    /// `size` (bucket locks, value area) pointing past the real mapping.
    fn create_or_attach_resizing(name: &str, size: usize) -> Result<ShmHandle> {
        match ShmHandle::acquire(name, size, ShmOpenMode::Open) {
            Ok(existing) => {
                if existing.user_size() < size {
                    drop(existing);
                    ShmHandle::unlink_by_name(name);
                    Ok(ShmHandle::acquire(name, size, ShmOpenMode::CreateOrOpen)?)
                } else {
                    Ok(existing)
                }
            }
            Err(_) => Ok(ShmHandle::acquire(name, size, ShmOpenMode::CreateOrOpen)?),
        }
    }

    /// Bytes consumed by the header, index cells and bucket lock array —
    /// everything that precedes the value area.
    fn layout_overhead(keys_slots: usize) -> usize {
        align_up(
            HEADER_SIZE + keys_slots * INDEX_CELL_SIZE + keys_slots * BUCKET_LOCK_SIZE,
            VALUE_AREA_ALIGN,
        )
    }

    fn init_fresh(&self) -> Result<()> {
        let header = self.header();
        header.total_size.store(self.total_size() as u64, Ordering::Relaxed);
        header.oldest_chunk.store(self.value_area_offset() as i64, Ordering::Relaxed);
        header.hits.store(0, Ordering::Relaxed);
        header.misses.store(0, Ordering::Relaxed);
        header.version.store(SCHEMA_VERSION, Ordering::Relaxed);

        for i in 0..self.keys_slots {
            self.index_cell(i).store(0, Ordering::Relaxed);
        }

        crate::chunk_store::init_value_area(self)?;

        // Publish last: this is the signal every other attacher waits on.
        header.magic.store(MAGIC, Ordering::Release);
        Ok(())
    }

    fn await_initialised(&self) -> Result<()> {
        let header = self.header();
        if header.magic.load(Ordering::Acquire) == MAGIC {
            return self.check_version();
        }
        let deadline = Instant::now() + INIT_WAIT_TIMEOUT;
        let mut k = 0u32;
        loop {
            if header.magic.load(Ordering::Acquire) == MAGIC {
                return self.check_version();
            }
            if Instant::now() >= deadline {
                return Err(CacheError::Lock(
                    "timed out waiting for another process to finish creating the region".into(),
                ));
            }
            crate::spin_lock::adaptive_yield_pub(&mut k);
        }
    }

    fn check_version(&self) -> Result<()> {
        let version = self.header().version.load(Ordering::Acquire);
        if version != SCHEMA_VERSION {
            return Err(CacheError::Config(format!(
                "region was built with schema version {version}, this binary expects \
                 {SCHEMA_VERSION}; remove the segment and let it be recreated"
            )));
        }
        Ok(())
    }

    /// Re-run fresh initialisation in place. Caller must hold the alloc
    /// write lock; this does not touch `magic`/`version` since the region
    /// is already known-good, just stale.
    pub fn reinit(&self) -> Result<()> {
        let header = self.header();
        for i in 0..self.keys_slots {
            self.index_cell(i).store(0, Ordering::Relaxed);
        }
        crate::chunk_store::init_value_area(self)?;
        header.oldest_chunk.store(self.value_area_offset() as i64, Ordering::Release);
        Ok(())
    }

    /// Unlink the backing segment. Caller must hold the alloc write lock
    /// and must not use this `Region` afterwards.
    pub fn destroy(&self) {
        self.shm.unlink();
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.shm.as_ptr() as *const Header) }
    }

    pub fn keys_slots(&self) -> usize {
        self.keys_slots
    }

    pub fn total_size(&self) -> usize {
        self.shm.user_size()
    }

    pub fn index_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn bucket_locks_offset(&self) -> usize {
        self.index_offset() + self.keys_slots * INDEX_CELL_SIZE
    }

    pub fn value_area_offset(&self) -> usize {
        align_up(
            self.bucket_locks_offset() + self.keys_slots * BUCKET_LOCK_SIZE,
            VALUE_AREA_ALIGN,
        )
    }

    pub fn value_area_len(&self) -> usize {
        self.total_size() - self.value_area_offset()
    }

    /// Index cell `i`. Holds the absolute region offset of the chunk hashed
    /// to this slot, or `0` for empty — `0` is never a valid chunk offset
    /// since the value area starts well past the header and index.
    pub fn index_cell(&self, i: usize) -> &AtomicI64 {
        debug_assert!(i < self.keys_slots);
        let ptr = unsafe {
            self.shm
                .as_ptr()
                .add(self.index_offset() + i * INDEX_CELL_SIZE) as *const AtomicI64
        };
        unsafe { &*ptr }
    }

    /// Bucket lock `i`, guarding the index cell at the same index plus every
    /// chunk currently hashed there.
    pub fn bucket_lock(&self, i: usize) -> &RwLock {
        debug_assert!(i < self.keys_slots);
        let ptr = unsafe {
            self.shm
                .as_ptr()
                .add(self.bucket_locks_offset() + i * BUCKET_LOCK_SIZE) as *const RwLock
        };
        unsafe { &*ptr }
    }

    /// Raw pointer to an absolute offset within the mapped region.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.total_size());
        unsafe { self.shm.as_mut_ptr().add(offset) }
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.total_size());
        unsafe { std::slice::from_raw_parts(self.ptr_at(offset), len) }
    }

    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        debug_assert!(offset + buf.len() <= self.total_size());
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr_at(offset), buf.len()) }
    }

    pub fn zero_bytes(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.total_size());
        unsafe { std::ptr::write_bytes(self.ptr_at(offset), 0, len) }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, OpenMode};

    #[test]
    fn create_or_attach_grows_a_too_small_existing_region() {
        let name = "shmcache_test_region_resize";
        ShmHandle::unlink_by_name(name);

        let small = CacheConfig::new(name)
            .with_size(crate::config::MIN_REGION_SIZE)
            .with_mode(OpenMode::CreateOrAttach);
        let region = Region::open(&small).expect("create small region");
        let small_size = region.total_size();
        drop(region);

        let bigger_target = crate::config::DEFAULT_CACHE_SIZE * 2;
        let bigger = CacheConfig::new(name)
            .with_size(bigger_target)
            .with_mode(OpenMode::CreateOrAttach);
        let region = Region::open(&bigger).expect("reopen at a larger size");
        assert!(region.total_size() > small_size);
        assert!(region.total_size() >= bigger_target);
        region.destroy();
    }

    #[test]
    fn create_or_attach_keeps_an_already_large_enough_region() {
        let name = "shmcache_test_region_noresize";
        ShmHandle::unlink_by_name(name);

        let cfg = CacheConfig::new(name)
            .with_size(crate::config::DEFAULT_CACHE_SIZE)
            .with_mode(OpenMode::CreateOrAttach);
        let region = Region::open(&cfg).expect("create region");
        region.header().fetch_add_hits(1);
        drop(region);

        let smaller_request = CacheConfig::new(name)
            .with_size(crate::config::MIN_REGION_SIZE)
            .with_mode(OpenMode::CreateOrAttach);
        let region = Region::open(&smaller_request).expect("reattach");
        assert_eq!(region.header().hits(), 1);
        region.destroy();
    }
}
