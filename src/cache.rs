// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public facade. Orchestrates the lock ordering every other module assumes:
// alloc lock first (read for every per-item operation — `get`/`set`/`add`/
// `replace`/`delete`/`increment`/`decrement` — write only for `flush` and
// `destroy`), then the target key's bucket lock. Chunk-stream structural
// changes (`chunk_store::allocate`/`free`) serialise on `oldest_lock`
// themselves, taken under only `alloc` read plus this bucket lock — that is
// what lets two `set`s on disjoint keys run fully concurrently. When the
// allocator's swallow sweep needs to evict a chunk from a different bucket,
// it takes that bucket's write lock non-blockingly; on contention the whole
// attempt backs out and `store`/`bump` retry from scratch. `stats_lock` is
// acquired independently and never nested under a bucket lock.

use tracing::{debug, trace, warn};

use crate::chunk_store::{self, AllocOutcome, FLAG_NUMERIC};
use crate::config::{CacheConfig, MAX_CHUNK_SIZE, MAX_KEY_LENGTH};
use crate::error::{CacheError, Result};
use crate::index;
use crate::lock_set::{AllocReadGuard, AllocWriteGuard, BucketReadGuard, BucketWriteGuard};
use crate::region::Region;
use crate::stats::{self, CacheStats, LocalCounters};

/// How long to back off before retrying an allocation attempt that backed
/// out of a cross-bucket eviction it couldn't get the lock for.
const CONTENTION_BACKOFF: std::time::Duration = std::time::Duration::from_micros(50);

/// A handle onto one shared-memory cache region.
///
/// Cheap to clone the region's name and reopen from another process;
/// within one process, share a single `ShmCache` (it is `Send + Sync`)
/// rather than opening the same region twice.
pub struct ShmCache {
    region: Region,
    counters: LocalCounters,
}

fn truncate_key(key: &[u8]) -> &[u8] {
    let len = key.len().min(MAX_KEY_LENGTH);
    &key[..len]
}

impl ShmCache {
    /// Open or create the region described by `config`.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let region = Region::open(config)?;
        debug!(name = %config.name, size = region.total_size(), "opened shm cache region");
        Ok(Self {
            region,
            counters: LocalCounters::new(),
        })
    }

    /// Fetch the value stored for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let key = truncate_key(key);
        let _alloc = AllocReadGuard::acquire(&self.region);
        let bucket = index::bucket_of(key);
        let _b = BucketReadGuard::acquire(&self.region, bucket);
        match index::find(&self.region, key) {
            Some(offset) => {
                self.counters.record_hit(&self.region);
                Some(chunk_store::payload(&self.region, offset).to_vec())
            }
            None => {
                self.counters.record_miss(&self.region);
                None
            }
        }
    }

    /// Whether `key` is currently present. Does not affect hit/miss counters.
    pub fn exists(&self, key: &[u8]) -> bool {
        let key = truncate_key(key);
        let _alloc = AllocReadGuard::acquire(&self.region);
        let bucket = index::bucket_of(key);
        let _b = BucketReadGuard::acquire(&self.region, bucket);
        index::find(&self.region, key).is_some()
    }

    /// Unconditionally store `key -> value`, replacing any existing entry.
    ///
    /// A `value` over `MAX_CHUNK_SIZE` is rejected with `CacheError::TooLarge`,
    /// but any prior entry for `key` is still removed — the region never
    /// holds a stale value for a key whose most recent write was rejected.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(key, value, false, false).map(|_| ())
    }

    /// Store `key -> value` only if `key` is not already present. Returns
    /// `Ok(false)` without error if it was already present — checked under
    /// the same bucket lock the write itself takes, not a separate unlocked
    /// probe beforehand.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store(key, value, true, false)
    }

    /// Store `key -> value` only if `key` is already present. Returns
    /// `Ok(false)` without error if it was absent, checked under the same
    /// lock as the write.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store(key, value, false, true)
    }

    /// Shared implementation for `set`/`add`/`replace`. Returns whether the
    /// write actually happened — `false` means `require_absent`/
    /// `require_present` vetoed it under the lock.
    ///
    /// Takes `alloc` read, not write: per spec.md §5 only `flush`, `destroy`
    /// and region resize need the exclusive lock. Disjoint-bucket writes run
    /// concurrently; the only thing serialising structural changes to the
    /// chunk stream is `oldest_lock`, taken inside `chunk_store::allocate`
    /// itself. If that sweep needs to evict a chunk from a bucket other than
    /// this one and can't get its write lock without blocking, the whole
    /// attempt backs out and is retried here.
    fn store(&self, key: &[u8], value: &[u8], require_absent: bool, require_present: bool) -> Result<bool> {
        let key = truncate_key(key);

        if value.len() > MAX_CHUNK_SIZE {
            warn!(
                key = %String::from_utf8_lossy(key),
                size = value.len(),
                max = MAX_CHUNK_SIZE,
                "rejecting oversized value, removing any existing entry"
            );
            let _alloc = AllocReadGuard::acquire(&self.region);
            let bucket = index::bucket_of(key);
            let _b = BucketWriteGuard::acquire(&self.region, bucket);
            if let Some(offset) = index::remove(&self.region, key) {
                chunk_store::free(&self.region, offset);
            }
            return Err(CacheError::TooLarge {
                size: value.len(),
                max: MAX_CHUNK_SIZE,
            });
        }

        loop {
            let _alloc = AllocReadGuard::acquire(&self.region);
            let bucket = index::bucket_of(key);
            let _b = BucketWriteGuard::acquire(&self.region, bucket);

            let existing = index::find(&self.region, key);
            if require_absent && existing.is_some() {
                return Ok(false);
            }
            if require_present && existing.is_none() {
                return Ok(false);
            }

            if let Some(offset) = existing {
                if value.len() <= chunk_store::valallocsize(&self.region, offset) {
                    chunk_store::overwrite_in_place(&self.region, offset, value, 0);
                    trace!(key = %String::from_utf8_lossy(key), "overwrote value in place");
                    return Ok(true);
                }
                index::remove(&self.region, key);
                chunk_store::free(&self.region, offset);
            }

            let mut evicted = Vec::new();
            let outcome = {
                let mut remove_cb = self.remove_cb_for(bucket, &mut evicted);
                chunk_store::allocate(&self.region, key, value, 0, &mut remove_cb)?
            };

            match outcome {
                AllocOutcome::Done(new_offset) => {
                    if !evicted.is_empty() {
                        trace!(count = evicted.len(), "evicted oldest entries to make room");
                    }
                    index::insert(&self.region, key, new_offset);
                    return Ok(true);
                }
                AllocOutcome::Contended => {
                    drop(_b);
                    drop(_alloc);
                    std::thread::sleep(CONTENTION_BACKOFF);
                }
            }
        }
    }

    /// Build the eviction callback `chunk_store::allocate` drives during its
    /// swallow sweep: removes the victim from the index under its own
    /// bucket's lock, which is `bucket` itself if the victim hashes there,
    /// or a non-blocking `try_acquire` otherwise (see lock_set.rs's module
    /// doc for why this one must never block).
    fn remove_cb_for<'a>(
        &'a self,
        bucket: usize,
        evicted: &'a mut Vec<Vec<u8>>,
    ) -> impl FnMut(&[u8]) -> bool + 'a {
        move |victim_key: &[u8]| {
            let victim_bucket = index::bucket_of(victim_key);
            if victim_bucket == bucket {
                index::remove(&self.region, victim_key);
                evicted.push(victim_key.to_vec());
                true
            } else {
                match BucketWriteGuard::try_acquire(&self.region, victim_bucket) {
                    Some(_vb) => {
                        index::remove(&self.region, victim_key);
                        evicted.push(victim_key.to_vec());
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Remove `key`, if present. Always succeeds — this implementation's
    /// locks are infallible, so the only failure spec.md §4.5 carves out
    /// (OS error or lock failure) can't happen here; an absent key is just
    /// as much a success as a removed one.
    pub fn delete(&self, key: &[u8]) -> bool {
        let key = truncate_key(key);
        let _alloc = AllocReadGuard::acquire(&self.region);
        let bucket = index::bucket_of(key);
        let _b = BucketWriteGuard::acquire(&self.region, bucket);
        if let Some(offset) = index::remove(&self.region, key) {
            chunk_store::free(&self.region, offset);
        }
        true
    }

    /// Add `delta` to the integer value stored at `key`, saturating at
    /// `u64`'s bounds. Fails with `CacheError::NotNumeric` if the existing
    /// value does not parse as an unsigned integer; the value is left
    /// untouched in that case. A missing key starts from `initial` before
    /// `delta` is applied.
    pub fn increment(&self, key: &[u8], delta: u64, initial: u64) -> Result<u64> {
        self.bump(key, delta, initial, true)
    }

    /// As `increment`, but subtracts and saturates at zero.
    pub fn decrement(&self, key: &[u8], delta: u64, initial: u64) -> Result<u64> {
        self.bump(key, delta, initial, false)
    }

    fn bump(&self, key: &[u8], delta: u64, initial: u64, increment: bool) -> Result<u64> {
        let key = truncate_key(key);
        loop {
            let _alloc = AllocReadGuard::acquire(&self.region);
            let bucket = index::bucket_of(key);
            let _b = BucketWriteGuard::acquire(&self.region, bucket);

            let existing = index::find(&self.region, key);
            let current = match existing {
                Some(offset) => {
                    let payload = chunk_store::payload(&self.region, offset);
                    let text = std::str::from_utf8(payload).map_err(|_| CacheError::NotNumeric)?;
                    text.trim().parse::<u64>().map_err(|_| CacheError::NotNumeric)?
                }
                None => initial,
            };

            let updated = if increment {
                current.saturating_add(delta)
            } else {
                current.saturating_sub(delta)
            };
            let rendered = updated.to_string();
            let rendered = rendered.as_bytes();

            if let Some(offset) = existing {
                if rendered.len() <= chunk_store::valallocsize(&self.region, offset) {
                    chunk_store::overwrite_in_place(&self.region, offset, rendered, FLAG_NUMERIC);
                    return Ok(updated);
                }
                index::remove(&self.region, key);
                chunk_store::free(&self.region, offset);
            }

            let mut evicted = Vec::new();
            let outcome = {
                let mut remove_cb = self.remove_cb_for(bucket, &mut evicted);
                chunk_store::allocate(&self.region, key, rendered, FLAG_NUMERIC, &mut remove_cb)?
            };

            match outcome {
                AllocOutcome::Done(new_offset) => {
                    if !evicted.is_empty() {
                        trace!(count = evicted.len(), "evicted oldest entries to make room");
                    }
                    index::insert(&self.region, key, new_offset);
                    return Ok(updated);
                }
                AllocOutcome::Contended => {
                    drop(_b);
                    drop(_alloc);
                    std::thread::sleep(CONTENTION_BACKOFF);
                }
            }
        }
    }

    /// Reset the region to an empty cache: clears the index and lays down
    /// one free chunk spanning the whole value area. Does not unlink the
    /// underlying shared-memory segment.
    pub fn flush(&self) -> Result<()> {
        let _alloc = AllocWriteGuard::acquire(&self.region);
        self.region.reinit()?;
        self.region.header().reset_counters();
        debug!("flushed region to empty state");
        Ok(())
    }

    /// Point-in-time snapshot of hit/miss counters and sizing. Flushes this
    /// handle's process-local counters first so they're reflected.
    pub fn stats(&self) -> CacheStats {
        self.counters.flush(&self.region);
        stats::snapshot(&self.region)
    }

    /// Unlink the backing shared-memory segment. Other processes that still
    /// hold it mapped keep working until they drop their last handle; new
    /// opens under the same name create a fresh region.
    pub fn destroy(self) {
        let _alloc = AllocWriteGuard::acquire(&self.region);
        self.region.destroy();
    }
}

impl Drop for ShmCache {
    fn drop(&mut self) {
        self.counters.flush(&self.region);
    }
}

unsafe impl Send for ShmCache {}
unsafe impl Sync for ShmCache {}
