// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tunable constants and the region-open configuration. Mirrors the role of
// `ShmOpenMode` in `shm.rs`: a single place where the "how do I want to
// open/size this region" decision is validated before any syscall happens.

use crate::error::{CacheError, Result};

/// Bytes of region mapped when no explicit size is requested.
pub const DEFAULT_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Floor on a non-zero `desired_size`. Below this, `Region::open` rejects
/// the request outright rather than silently rounding up.
pub const MIN_REGION_SIZE: usize = 16 * 1024 * 1024;

/// Maximum key length in bytes. Longer keys are truncated by callers before
/// reaching the index/allocator.
pub const MAX_KEY_LENGTH: usize = 250;

/// Floor on a chunk's payload capacity (`valallocsize`).
pub const MIN_VALUE_ALLOC_SIZE: usize = 128;

/// Largest payload a single `set` will accept.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Soft upper bound on simultaneously live keys, used only to size
/// `KEYS_SLOTS`; the allocator itself has no notion of an item count limit.
pub const MAX_ITEMS: usize = 20_000;

/// Index cell count. Chosen so the table is at most ~75% full at
/// `MAX_ITEMS` live keys.
pub const KEYS_SLOTS: usize = 30_000;

/// Reserved for future batch eviction; the write path never reads it back
/// after the allocator swallows one run of chunks. See DESIGN.md.
pub const FULL_CACHE_REMOVED_ITEMS: usize = 1;

/// Magic value stamped into a freshly initialised header.
pub const MAGIC: u64 = 0x5348_4d43_4143_4845; // "SHMCACHE" truncated to 8 bytes, big-endian read

/// Schema version of the on-region layout. Bumping this forces every
/// attacher to treat an old region as uninitialised (flush-equivalent).
pub const SCHEMA_VERSION: u64 = 1;

/// How a named region should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create exclusively — fail if the region already exists.
    Create,
    /// Attach to an existing region — fail if it does not exist.
    Attach,
    /// Create if missing, attach if it already exists (the common case).
    CreateOrAttach,
}

/// Configuration for opening or creating a cache region.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the underlying shared-memory segment.
    pub name: String,
    /// Requested total region size in bytes. `0` means "use
    /// `DEFAULT_CACHE_SIZE`".
    pub desired_size: usize,
    /// How to open the region.
    pub mode: OpenMode,
}

impl CacheConfig {
    /// A config for the common case: create-or-attach at the default size.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired_size: 0,
            mode: OpenMode::CreateOrAttach,
        }
    }

    /// Override the requested region size.
    pub fn with_size(mut self, desired_size: usize) -> Self {
        self.desired_size = desired_size;
        self
    }

    /// Override the open mode.
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resolve `desired_size` to a concrete, validated region size.
    ///
    /// Per spec.md §4.1: non-zero sizes below `MIN_REGION_SIZE` are a
    /// `ConfigError`; a zero size resolves to `DEFAULT_CACHE_SIZE`.
    pub fn resolve_size(&self) -> Result<usize> {
        if self.desired_size == 0 {
            return Ok(DEFAULT_CACHE_SIZE);
        }
        if self.desired_size < MIN_REGION_SIZE {
            return Err(CacheError::Config(format!(
                "desired_size {} is below the {} byte minimum",
                self.desired_size, MIN_REGION_SIZE
            )));
        }
        Ok(self.desired_size.max(DEFAULT_CACHE_SIZE))
    }
}
