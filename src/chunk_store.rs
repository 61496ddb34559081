// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// FIFO ring-buffer value allocator. Every chunk is a fixed-layout header
// (`ChunkMeta`) immediately followed by up to `valallocsize` payload bytes.
// Free chunks are just chunks with `valsize == 0`; there is no separate
// free list — "free" is a property read off the chunk itself, the same way
// `ChunkInfo`'s `next[]` free list in the teacher's chunk_storage.rs reads
// slot state directly out of shared memory rather than keeping a shadow
// structure on the side.
//
// Allocation always happens at `oldest_chunk` going forward: swallow chunks
// (evicting occupied ones as we go) until there's enough room, then split
// off any leftover tail back into a new free chunk. This gives the FIFO
// eviction order the spec calls for without a separate LRU structure.

use crate::config::{MAX_KEY_LENGTH, MIN_VALUE_ALLOC_SIZE};
use crate::error::{CacheError, Result};
use crate::lock_set::OldestWriteGuard;
use crate::region::Region;

/// On-disk chunk header. `repr(C)` so the layout is stable across builds of
/// this same schema version.
#[repr(C)]
struct ChunkMeta {
    key: [u8; MAX_KEY_LENGTH],
    key_len: u64,
    valallocsize: u64,
    valsize: u64,
    flags: u8,
    _pad: [u8; 7],
}

pub const CHUNK_META_SIZE: usize = std::mem::size_of::<ChunkMeta>();

/// `ChunkMeta`'s `u64` fields need 8-byte alignment. Every chunk's
/// `valallocsize` (and therefore its total footprint, since `CHUNK_META_SIZE`
/// is itself a multiple of 8) is kept a multiple of this so the next chunk
/// in the stream always starts aligned too.
const CHUNK_ALIGN: usize = 8;

fn align_up(n: usize) -> usize {
    (n + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1)
}

fn align_down(n: usize) -> usize {
    n & !(CHUNK_ALIGN - 1)
}

/// Flag bit set on a chunk storing an integer-formatted value, so
/// increment/decrement can validate without reparsing ambiguous payloads.
pub const FLAG_NUMERIC: u8 = 0x01;

fn meta_ptr(region: &Region, offset: usize) -> *mut ChunkMeta {
    region.ptr_at(offset) as *mut ChunkMeta
}

fn meta<'a>(region: &'a Region, offset: usize) -> &'a ChunkMeta {
    unsafe { &*meta_ptr(region, offset) }
}

pub fn is_free(region: &Region, offset: usize) -> bool {
    meta(region, offset).valsize == 0
}

pub fn valallocsize(region: &Region, offset: usize) -> usize {
    meta(region, offset).valallocsize as usize
}

pub fn valsize(region: &Region, offset: usize) -> usize {
    meta(region, offset).valsize as usize
}

pub fn flags(region: &Region, offset: usize) -> u8 {
    meta(region, offset).flags
}

pub fn total_size(region: &Region, offset: usize) -> usize {
    CHUNK_META_SIZE + valallocsize(region, offset)
}

/// Key stored at `offset`, or `None` if the chunk is free.
pub fn key(region: &Region, offset: usize) -> Option<Vec<u8>> {
    let m = meta(region, offset);
    if m.valsize == 0 {
        return None;
    }
    let len = (m.key_len as usize).min(MAX_KEY_LENGTH);
    Some(m.key[..len].to_vec())
}

pub fn payload(region: &Region, offset: usize) -> &[u8] {
    let len = valsize(region, offset);
    region.read_bytes(offset + CHUNK_META_SIZE, len)
}

/// Next chunk's offset, or `None` if `offset` is the last chunk in the
/// value area (the ring wraps back to `value_area_offset()` from there).
pub fn next_offset(region: &Region, offset: usize) -> Option<usize> {
    let next = offset + total_size(region, offset);
    let end = region.value_area_offset() + region.value_area_len();
    if next < end {
        Some(next)
    } else {
        None
    }
}

fn wrapping_next(region: &Region, offset: usize) -> usize {
    next_offset(region, offset).unwrap_or_else(|| region.value_area_offset())
}

/// Stamp `offset` as a free chunk of `valallocsize` bytes, clearing key and
/// payload metadata. Does not touch the index — callers evicting an
/// occupied chunk must remove its index entry first.
fn make_free(region: &Region, offset: usize, valallocsize: usize) {
    let m = unsafe { &mut *meta_ptr(region, offset) };
    m.key = [0u8; MAX_KEY_LENGTH];
    m.key_len = 0;
    m.valallocsize = valallocsize as u64;
    m.valsize = 0;
    m.flags = 0;
}

/// Stamp `offset` as an occupied chunk holding `value` under `key_bytes`,
/// within a chunk whose capacity is already `>= value.len()`.
fn write_occupied(region: &Region, offset: usize, key_bytes: &[u8], value: &[u8], flags: u8) {
    debug_assert!(key_bytes.len() <= MAX_KEY_LENGTH);
    let m = unsafe { &mut *meta_ptr(region, offset) };
    let mut key_buf = [0u8; MAX_KEY_LENGTH];
    key_buf[..key_bytes.len()].copy_from_slice(key_bytes);
    m.key = key_buf;
    m.key_len = key_bytes.len() as u64;
    m.valsize = value.len() as u64;
    m.flags = flags;
    region.write_bytes(offset + CHUNK_META_SIZE, value);
}

/// Lay down a single free chunk spanning the entire value area and point
/// `oldest_chunk` at it. Used for first-time init and `flush`.
pub fn init_value_area(region: &Region) -> Result<()> {
    let start = region.value_area_offset();
    let len = region.value_area_len();
    if len < CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE {
        return Err(CacheError::Config(
            "value area too small to hold a single minimum-size chunk".into(),
        ));
    }
    region.zero_bytes(start, len);
    make_free(region, start, align_down(len - CHUNK_META_SIZE));
    Ok(())
}

/// If `offset`'s allocation has more room than `needed` (already aligned)
/// plus another full minimum-size chunk, carve a new free chunk out of the
/// tail.
///
/// Caller holds the alloc write lock. `needed` must already be a multiple
/// of `CHUNK_ALIGN`.
fn split_if_room(region: &Region, offset: usize, needed: usize) {
    debug_assert_eq!(needed % CHUNK_ALIGN, 0);
    let cap = valallocsize(region, offset);
    if cap < needed {
        return;
    }
    let leftover = cap - needed;
    if leftover < CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE {
        return;
    }
    let tail_offset = offset + CHUNK_META_SIZE + needed;
    let tail_valalloc = align_down(leftover - CHUNK_META_SIZE);
    unsafe { &mut *meta_ptr(region, offset) }.valallocsize = needed as u64;
    make_free(region, tail_offset, tail_valalloc);
}

/// Merge `offset` forward with however many immediately-following chunks
/// are free, producing one larger free chunk. Stops at the first occupied
/// chunk or at the end of the value area (the ring does not wrap during a
/// coalesce — the allocator's forward walk handles wraparound separately).
fn coalesce_forward(region: &Region, offset: usize) {
    let mut grown = valallocsize(region, offset);
    let mut cursor = offset;
    while let Some(next) = next_offset(region, cursor) {
        if !is_free(region, next) {
            break;
        }
        grown += total_size(region, next);
        cursor = next;
    }
    if cursor != offset {
        make_free(region, offset, grown);
    }
}

/// Evict the chunk at `offset`: clear its index entry (via `remove_cb`) and
/// fold it into a free run. `remove_cb` is given the victim key, must remove
/// it from the index under that key's own bucket lock, and returns whether
/// it managed to do so — `false` means it could not get that bucket's lock
/// without blocking and the whole allocation attempt must be abandoned (see
/// `allocate`'s retry loop). Returns the same bool.
fn evict(region: &Region, offset: usize, remove_cb: &mut dyn FnMut(&[u8]) -> bool) -> bool {
    if let Some(victim_key) = key(region, offset) {
        if !remove_cb(&victim_key) {
            return false;
        }
    }
    make_free(region, offset, valallocsize(region, offset));
    true
}

/// Outcome of one `allocate` attempt.
pub enum AllocOutcome {
    /// The chunk at this offset is now stamped occupied with the requested
    /// key/value/flags.
    Done(usize),
    /// The sweep needed a victim's bucket lock, couldn't get it without
    /// blocking, and backed out. The chunks it already evicted/coalesced
    /// before backing out are left free — safe to just retry.
    Contended,
}

/// Find or make room for a chunk able to hold `value.len()` bytes under
/// `key_bytes`, starting the forward scan at the current `oldest_chunk`,
/// evicting occupied chunks as needed. Returns the offset of the chunk now
/// reserved (header stamped as occupied with `key`/`value`/`flags`), or
/// `AllocOutcome::Contended` if the caller should retry.
///
/// Caller holds `alloc` read and the target key's own bucket write lock;
/// this function takes the `oldest` write lock itself for its whole sweep —
/// that, not a global write lock, is what serialises concurrent structural
/// changes to the chunk stream, per spec.md §5's "alloc read for all
/// per-item operations" rule.
pub fn allocate(
    region: &Region,
    key_bytes: &[u8],
    value: &[u8],
    flags: u8,
    remove_cb: &mut dyn FnMut(&[u8]) -> bool,
) -> Result<AllocOutcome> {
    let _oldest = OldestWriteGuard::acquire(region);
    let needed = align_up(value.len());
    let header = region.header();
    let start = header.oldest_chunk() as usize;
    let mut offset = start;
    let mut swallowed = 0usize;
    let value_area_total = region.value_area_len();

    loop {
        if is_free(region, offset) {
            coalesce_forward(region, offset);
        } else if !evict(region, offset, remove_cb) {
            return Ok(AllocOutcome::Contended);
        } else {
            coalesce_forward(region, offset);
        }

        if valallocsize(region, offset) >= needed {
            split_if_room(region, offset, needed);
            write_occupied(region, offset, key_bytes, value, flags);
            let new_oldest = wrapping_next(region, offset);
            header.set_oldest_chunk(new_oldest as i64);
            return Ok(AllocOutcome::Done(offset));
        }

        swallowed += total_size(region, offset);
        if swallowed > value_area_total {
            return Err(CacheError::TooLarge {
                size: needed,
                max: value_area_total.saturating_sub(CHUNK_META_SIZE),
            });
        }
        offset = wrapping_next(region, offset);
    }
}

/// Free the chunk at `offset` without touching the index (caller already
/// removed it there), coalescing forward with any newly-adjacent free run.
/// Takes the `oldest` write lock itself, since coalescing mutates
/// neighbouring chunks' metadata — the same structural-change boundary
/// `allocate` serialises on.
pub fn free(region: &Region, offset: usize) {
    let _oldest = OldestWriteGuard::acquire(region);
    make_free(region, offset, valallocsize(region, offset));
    coalesce_forward(region, offset);
}

/// Iterate every chunk in the value area in physical order, start to end —
/// not `oldest_chunk`-first like `allocate`'s scan, just a plain one-pass
/// walk for callers that need to visit every chunk once (`stats()`).
pub fn iter_offsets(region: &Region) -> impl Iterator<Item = usize> + '_ {
    let start = region.value_area_offset();
    let end = start + region.value_area_len();
    std::iter::successors(Some(start), move |&offset| {
        let next = offset + total_size(region, offset);
        if next < end {
            Some(next)
        } else {
            None
        }
    })
}

/// Overwrite the payload of an already-occupied chunk in place, when the
/// new value fits within the existing allocation. Caller has verified
/// `value.len() <= valallocsize(region, offset)`.
pub fn overwrite_in_place(region: &Region, offset: usize, value: &[u8], flags: u8) {
    let m = unsafe { &mut *meta_ptr(region, offset) };
    m.valsize = value.len() as u64;
    m.flags = flags;
    region.write_bytes(offset + CHUNK_META_SIZE, value);
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
    fn fresh_region_is_one_free_chunk() {
        let name = "shmcache_test_chunk_fresh";
        let region = open_region(name);
        let start = region.value_area_offset();
        assert!(is_free(&region, start));
        assert_eq!(
            valallocsize(&region, start),
            region.value_area_len() - CHUNK_META_SIZE
        );
        region.destroy();
    }

    fn expect_done(outcome: Result<AllocOutcome>) -> usize {
        match outcome.expect("alloc") {
            AllocOutcome::Done(offset) => offset,
            AllocOutcome::Contended => panic!("unexpected contention in single-threaded test"),
        }
    }

    #[test]
    fn allocate_then_free_roundtrips_payload() {
        let name = "shmcache_test_chunk_roundtrip";
        let region = open_region(name);
        let mut noop = |_: &[u8]| true;
        let offset = expect_done(allocate(&region, b"hello", b"world", 0, &mut noop));
        assert_eq!(payload(&region, offset), b"world");
        assert_eq!(key(&region, offset).unwrap(), b"hello");
        free(&region, offset);
        assert!(is_free(&region, offset));
        region.destroy();
    }

    #[test]
    fn split_leaves_a_free_tail_when_room_allows() {
        let name = "shmcache_test_chunk_split";
        let region = open_region(name);
        let mut noop = |_: &[u8]| true;
        let value = vec![7u8; 64];
        let offset = expect_done(allocate(&region, b"k", &value, 0, &mut noop));
        assert_eq!(valallocsize(&region, offset), 64);
        let next = next_offset(&region, offset).expect("split tail exists");
        assert!(is_free(&region, next));
        region.destroy();
    }

    #[test]
    fn allocate_evicts_oldest_when_full() {
        let name = "shmcache_test_chunk_evict";
        let region = open_region(name);
        let mut evicted = Vec::new();
        let mut cb = |k: &[u8]| {
            evicted.push(k.to_vec());
            true
        };

        let value_area = region.value_area_len();
        let big = vec![0u8; value_area - CHUNK_META_SIZE - MIN_VALUE_ALLOC_SIZE];
        let first = expect_done(allocate(&region, b"first", &big, 0, &mut cb));
        assert!(!is_free(&region, first));

        let second = expect_done(allocate(&region, b"second", b"tiny", 0, &mut cb));
        assert_eq!(payload(&region, second), b"tiny");
        assert_eq!(evicted, vec![b"first".to_vec()]);
        region.destroy();
    }
}
