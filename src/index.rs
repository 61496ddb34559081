// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Open-addressed hash index over `Region::index_cell`. Each cell holds the
// absolute region offset of the chunk hashed there, or `0` for empty.
// Collisions resolve by linear probing; deletion rehashes every following
// occupied cell of the probe run back into place instead of leaving a
// tombstone, so a later `find` never has to distinguish "deleted" from
// "never occupied".
//
// Hashing reuses the teacher's `fnv1a_64`, already exercised by
// `shm_name.rs` for a different purpose (shm segment naming) — no reason to
// pull in a second hash function for the same role.

use crate::config::KEYS_SLOTS;
use crate::region::Region;
use crate::shm_name::fnv1a_64;

/// Hash of `key`, used both for bucket selection and probe start.
pub fn hash(key: &[u8]) -> u64 {
    fnv1a_64(key)
}

/// Natural bucket for `key`, before any probing.
pub fn bucket_of(key: &[u8]) -> usize {
    (hash(key) % KEYS_SLOTS as u64) as usize
}

fn probe(start: usize, step: usize) -> usize {
    (start + step) % KEYS_SLOTS
}

/// Find the chunk offset stored for `key`, probing forward from its bucket
/// until an empty cell or a match is found.
///
/// Caller holds at least a read lock on `key`'s bucket. Because probing can
/// walk into neighbouring buckets, a `find` racing a concurrent insert into
/// a bucket later in the same probe run can miss it — the crate documents
/// this as an accepted race (see DESIGN.md), mirroring memcache-style caches
/// that treat lookups as best-effort under concurrent writers.
pub fn find(region: &Region, key: &[u8]) -> Option<usize> {
    let start = bucket_of(key);
    for step in 0..KEYS_SLOTS {
        let i = probe(start, step);
        let cell = region.index_cell(i).load(std::sync::atomic::Ordering::Acquire);
        if cell == 0 {
            return None;
        }
        let offset = cell as usize;
        if crate::chunk_store::key(region, offset).as_deref() == Some(key) {
            return Some(offset);
        }
    }
    None
}

/// Insert `key -> offset` into the first empty cell found while probing
/// forward from `key`'s bucket.
///
/// Caller holds the write lock on `key`'s bucket and has already ensured no
/// existing entry for `key` remains (callers always `remove` before
/// `insert` when replacing a value).
pub fn insert(region: &Region, key: &[u8], offset: usize) -> bool {
    let start = bucket_of(key);
    for step in 0..KEYS_SLOTS {
        let i = probe(start, step);
        let cell = region.index_cell(i);
        if cell.load(std::sync::atomic::Ordering::Acquire) == 0 {
            cell.store(offset as i64, std::sync::atomic::Ordering::Release);
            return true;
        }
    }
    false
}

/// Remove `key`'s entry, if present, rehashing the rest of its probe run
/// forward so no gap breaks a later `find`. Returns the removed chunk's
/// offset, if any.
///
/// Caller holds the write lock on `key`'s bucket.
pub fn remove(region: &Region, key: &[u8]) -> Option<usize> {
    let start = bucket_of(key);
    let mut found_slot = None;
    for step in 0..KEYS_SLOTS {
        let i = probe(start, step);
        let cell = region.index_cell(i).load(std::sync::atomic::Ordering::Acquire);
        if cell == 0 {
            return None;
        }
        let offset = cell as usize;
        if crate::chunk_store::key(region, offset).as_deref() == Some(key) {
            found_slot = Some((i, offset));
            break;
        }
    }
    let (mut hole, removed_offset) = found_slot?;
    region
        .index_cell(hole)
        .store(0, std::sync::atomic::Ordering::Release);

    // Rehash-forward: shift every subsequent occupied cell in this probe
    // chain back to its own ideal position if the hole now sits before it.
    let mut scan = (hole + 1) % KEYS_SLOTS;
    loop {
        let cell = region.index_cell(scan).load(std::sync::atomic::Ordering::Acquire);
        if cell == 0 {
            break;
        }
        let moved_offset = cell as usize;
        if let Some(moved_key) = crate::chunk_store::key(region, moved_offset) {
            let ideal = bucket_of(&moved_key);
            if !in_probe_range(ideal, hole, scan) {
                region
                    .index_cell(hole)
                    .store(cell, std::sync::atomic::Ordering::Release);
                region
                    .index_cell(scan)
                    .store(0, std::sync::atomic::Ordering::Release);
                hole = scan;
            }
        }
        scan = (scan + 1) % KEYS_SLOTS;
        if scan == hole {
            break;
        }
    }

    Some(removed_offset)
}

/// Whether `ideal`'s probe sequence would reach `scan` no later than it
/// reaches `hole` — i.e. moving the entry at `scan` into `hole` keeps it
/// reachable by future lookups. Standard open-addressing deletion check,
/// accounting for wraparound.
fn in_probe_range(ideal: usize, hole: usize, scan: usize) -> bool {
    if hole <= scan {
        ideal > hole && ideal <= scan
    } else {
        ideal > hole || ideal <= scan
    }
}
