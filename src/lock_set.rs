// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// RAII guards over the region's locks, generalising the teacher's
// `ScopedAccess` (which pairs one `ShmHandle` with one `IpcMutex`) to the
// region's three top-level locks plus its `KEYS_SLOTS`-wide bucket lock
// array.
//
// Acquisition order: `alloc` first (read for every per-item operation —
// `get`/`set`/`add`/`replace`/`delete`/`increment`/`decrement` — write only
// for `flush`, `destroy` and region resize), then the target key's bucket
// lock. `oldest` is taken, in write mode, only by the allocator's own
// swallow/evict/coalesce sweep (`chunk_store::allocate`/`free`) — it is what
// actually serialises structural changes to the chunk stream, so that two
// `set`s on disjoint keys that both fit in place never have to wait on each
// other even though both hold only `alloc` read. A sweep that needs to evict
// a chunk in a bucket other than its own target never *blocks* for that
// bucket's write lock (`BucketWriteGuard::try_acquire`, not `acquire`) —
// blocking there while already holding `oldest` could deadlock against some
// other thread that holds that same bucket and is waiting on `oldest` in
// turn. A failed `try_acquire` aborts the whole allocation attempt so the
// caller can drop every lock and retry.

use crate::region::Region;
use crate::rw_lock::RwLock;

/// Exclusive hold on the region's alloc lock. Held only by `flush` and
/// `destroy` — every per-item operation takes `AllocReadGuard` instead, per
/// spec.md §5.
pub struct AllocWriteGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> AllocWriteGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().alloc_lock;
        lock.lock();
        Self { lock }
    }
}

impl Drop for AllocWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Shared hold on the region's alloc lock, for read-only operations that
/// must still exclude a concurrent `flush`/`destroy`.
pub struct AllocReadGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> AllocReadGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().alloc_lock;
        lock.lock_shared();
        Self { lock }
    }
}

impl Drop for AllocReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// Exclusive hold on one bucket lock, identified by its index.
pub struct BucketWriteGuard<'a> {
    lock: &'a RwLock,
    pub index: usize,
}

impl<'a> BucketWriteGuard<'a> {
    pub fn acquire(region: &'a Region, index: usize) -> Self {
        let lock = region.bucket_lock(index);
        lock.lock();
        Self { lock, index }
    }

    /// Non-blocking variant: returns `None` immediately if the lock is
    /// already held, rather than waiting for it. Used when holding a second
    /// lock already (`oldest`) makes blocking on this one deadlock-prone.
    pub fn try_acquire(region: &'a Region, index: usize) -> Option<Self> {
        let lock = region.bucket_lock(index);
        if lock.try_lock() {
            Some(Self { lock, index })
        } else {
            None
        }
    }
}

impl Drop for BucketWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Shared hold on one bucket lock.
pub struct BucketReadGuard<'a> {
    lock: &'a RwLock,
    pub index: usize,
}

impl<'a> BucketReadGuard<'a> {
    pub fn acquire(region: &'a Region, index: usize) -> Self {
        let lock = region.bucket_lock(index);
        lock.lock_shared();
        Self { lock, index }
    }
}

impl Drop for BucketReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// Shared hold on the oldest-chunk lock, for readers that want a consistent
/// view of `oldest_chunk` without excluding other readers.
pub struct OldestReadGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> OldestReadGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().oldest_lock;
        lock.lock_shared();
        Self { lock }
    }
}

impl Drop for OldestReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// Exclusive hold on the oldest-chunk lock. Held by `chunk_store::allocate`
/// and `chunk_store::free` for the full duration of any walk that can
/// coalesce, split or evict — i.e. any change to chunk boundaries or to the
/// `oldest_chunk` cursor itself. Acquired under only `alloc` **read** plus
/// the caller's own bucket lock, never under `alloc` write (flush/destroy
/// take `alloc` write instead and so never need this one).
pub struct OldestWriteGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> OldestWriteGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().oldest_lock;
        lock.lock();
        Self { lock }
    }
}

impl Drop for OldestWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive hold on the stats lock, guarding the hit/miss counter pair
/// during a buffered flush from a process-local accumulator.
pub struct StatsWriteGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> StatsWriteGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().stats_lock;
        lock.lock();
        Self { lock }
    }
}

impl Drop for StatsWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Shared hold on the stats lock, for `stats()` snapshots.
pub struct StatsReadGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> StatsReadGuard<'a> {
    pub fn acquire(region: &'a Region) -> Self {
        let lock = &region.header().stats_lock;
        lock.lock_shared();
        Self { lock }
    }
}

impl Drop for StatsReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, OpenMode};

    fn open_region(name: &str) -> Region {
        crate::shm::ShmHandle::unlink_by_name(name);
        let cfg = CacheConfig::new(name)
            .with_size(crate::config::MIN_REGION_SIZE)
            .with_mode(OpenMode::CreateOrAttach);
        Region::open(&cfg).expect("open region")
    }

    #[test]
    fn alloc_guards_release_on_drop() {
        let name = "shmcache_test_lockset_alloc";
        let region = open_region(name);
        {
            let _g = AllocWriteGuard::acquire(&region);
        }
        {
            let _g = AllocReadGuard::acquire(&region);
        }
        region.destroy();
    }

    #[test]
    fn bucket_guards_are_independent_per_index() {
        let name = "shmcache_test_lockset_bucket";
        let region = open_region(name);
        let _a = BucketWriteGuard::acquire(&region, 0);
        let _b = BucketWriteGuard::acquire(&region, 1);
        region.destroy();
    }

    #[test]
    fn try_acquire_fails_while_already_held() {
        let name = "shmcache_test_lockset_try_bucket";
        let region = open_region(name);
        let _held = BucketWriteGuard::acquire(&region, 3);
        assert!(BucketWriteGuard::try_acquire(&region, 3).is_none());
        assert!(BucketWriteGuard::try_acquire(&region, 4).is_some());
        region.destroy();
    }

    #[test]
    fn oldest_write_guard_releases_on_drop() {
        let name = "shmcache_test_lockset_oldest";
        let region = open_region(name);
        {
            let _g = OldestWriteGuard::acquire(&region);
        }
        let _g2 = OldestWriteGuard::acquire(&region);
        region.destroy();
    }
}
