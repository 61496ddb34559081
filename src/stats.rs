// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Point-in-time snapshot of the region: header counters plus a walk of the
// index and chunk stream, and a process-local accumulator that batches
// hit/miss increments and only touches the shared `stats_lock` on flush —
// the same buffer-then-flush shape the teacher's `ScopedAccess` callers use
// for batched shm writes, applied here to avoid taking a shared lock on
// every single `get`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::chunk_store;
use crate::lock_set::{AllocReadGuard, StatsReadGuard, StatsWriteGuard};
use crate::region::Region;

/// A snapshot of cache-wide counters and occupancy at the moment `stats()`
/// was called. Occupancy fields are produced by walking the index and the
/// chunk stream under `alloc` read — best-effort, a point-in-time view that
/// a concurrent writer can move out from under by the time the caller reads
/// it back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub items: usize,
    pub max_items: usize,
    pub available_hash_table_slots: usize,
    pub used_hash_table_slots: usize,
    pub hash_table_load_factor: f64,
    pub hash_table_memory_size: usize,
    pub total_size: usize,
    pub value_area_size: usize,
    pub available_value_mem_size: usize,
    pub used_value_mem_size: usize,
    pub avg_item_value_size: f64,
    pub oldest_chunk_offset: usize,
    pub item_metadata_size: usize,
    pub min_item_value_size: usize,
    pub max_item_value_size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Produce a `CacheStats` snapshot: header counters under `stats_lock`,
/// occupancy by walking the chunk stream once under `alloc` read (per
/// spec.md §4.5/§6).
pub fn snapshot(region: &Region) -> CacheStats {
    let _alloc = AllocReadGuard::acquire(region);

    let mut items = 0usize;
    let mut used_value_mem_size = 0usize;
    let mut available_value_mem_size = 0usize;
    let mut min_item_value_size = usize::MAX;
    let mut max_item_value_size = 0usize;

    for offset in chunk_store::iter_offsets(region) {
        if chunk_store::is_free(region, offset) {
            available_value_mem_size += chunk_store::valallocsize(region, offset);
        } else {
            items += 1;
            let size = chunk_store::valsize(region, offset);
            used_value_mem_size += size;
            min_item_value_size = min_item_value_size.min(size);
            max_item_value_size = max_item_value_size.max(size);
        }
    }
    if items == 0 {
        min_item_value_size = 0;
    }

    let keys_slots = region.keys_slots();
    let avg_item_value_size = if items == 0 {
        0.0
    } else {
        used_value_mem_size as f64 / items as f64
    };

    let (hits, misses) = {
        let _g = StatsReadGuard::acquire(region);
        let header = region.header();
        (header.hits(), header.misses())
    };

    CacheStats {
        hits,
        misses,
        items,
        max_items: keys_slots,
        available_hash_table_slots: keys_slots.saturating_sub(items),
        used_hash_table_slots: items,
        hash_table_load_factor: items as f64 / keys_slots as f64,
        hash_table_memory_size: region.value_area_offset() - region.index_offset(),
        total_size: region.total_size(),
        value_area_size: region.value_area_len(),
        available_value_mem_size,
        used_value_mem_size,
        avg_item_value_size,
        oldest_chunk_offset: region.header().oldest_chunk() as usize,
        item_metadata_size: chunk_store::CHUNK_META_SIZE,
        min_item_value_size,
        max_item_value_size,
    }
}

/// Process-local hit/miss counters. Every `ShmCache` owns one; increments
/// are plain non-atomic adds (single-threaded per `ShmCache` value, cheap),
/// flushed into the shared header under `stats_lock` on `Drop` and whenever
/// the buffered count crosses `FLUSH_THRESHOLD`.
const FLUSH_THRESHOLD: u64 = 1000;

pub struct LocalCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCounters {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self, region: &Region) {
        if self.hits.fetch_add(1, Ordering::Relaxed) + 1 >= FLUSH_THRESHOLD {
            self.flush(region);
        }
    }

    pub fn record_miss(&self, region: &Region) {
        if self.misses.fetch_add(1, Ordering::Relaxed) + 1 >= FLUSH_THRESHOLD {
            self.flush(region);
        }
    }

    pub fn flush(&self, region: &Region) {
        let hits = self.hits.swap(0, Ordering::Relaxed);
        let misses = self.misses.swap(0, Ordering::Relaxed);
        if hits == 0 && misses == 0 {
            return;
        }
        let _g = StatsWriteGuard::acquire(region);
        let header = region.header();
        header.fetch_add_hits(hits);
        header.fetch_add_misses(misses);
    }
}

impl Default for LocalCounters {
    fn default() -> Self {
        Self::new()
    }
}
