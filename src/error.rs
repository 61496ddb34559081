// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error kinds for the shared-memory cache core. Every fallible public
// operation returns `Result<_, CacheError>`; the allocator and index never
// panic on bad input, they return one of these instead.

/// Errors surfaced by the cache core.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid `desired_size` passed to `Region::open`/`ShmCache::open`:
    /// not zero and smaller than `MIN_REGION_SIZE`.
    #[error("invalid region configuration: {0}")]
    Config(String),

    /// The OS failed to grant or release one of the named locks.
    #[error("lock acquisition failed: {0}")]
    Lock(String),

    /// A raw read/write against the mapped region failed.
    #[error("region io failed: {0}")]
    RegionIo(#[from] std::io::Error),

    /// `set`/`add`/`replace` was given a value larger than `MAX_CHUNK_SIZE`.
    /// Per spec, a warning is emitted and any prior entry for the key is
    /// still removed even though the new value is rejected.
    #[error("value of {size} bytes exceeds MAX_CHUNK_SIZE ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    /// `increment`/`decrement` targeted a key whose value does not parse
    /// as an integer. The existing value is left untouched.
    #[error("increment/decrement target is not a numeric value")]
    NotNumeric,

    /// An operation was attempted on a facade whose region has already been
    /// destroyed or detached. Fatal — construct a new facade.
    #[error("operation attempted after region was destroyed/detached")]
    UseAfterDestroy,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
