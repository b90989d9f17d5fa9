// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for `libdd-shm-map`.
//!
//! Missing keys are not errors: lookups return `Option` and removals return
//! `bool`. [`ShmMapError::Full`] is an ordinary, expected outcome that callers
//! may treat as fatal or as a signal to shed load; nothing in this crate
//! retries or grows storage when it is returned.

use thiserror::Error;

/// A layout that cannot be constructed. Only ever returned at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The map was asked to hold zero entries.
    #[error("requested entry count must be at least 1")]
    ZeroEntries,

    /// The average entry size was zero.
    #[error("average entry size must be at least 1 byte")]
    ZeroEntrySize,

    /// The segment count is zero or not a power of two.
    #[error("segment count must be a non-zero power of two, got {0}")]
    InvalidSegmentCount(u32),

    /// Alignment other than 1, 2, 4 or 8 bytes.
    #[error("unsupported alignment {0}, expected 1, 2, 4 or 8")]
    UnsupportedAlignment(u32),

    /// A segment would need more slots than a 32-bit chain link can address.
    #[error("a segment would need more than {max} slots", max = u32::MAX - 1)]
    TooManySlots,

    /// The region size does not fit in the address space.
    #[error("region size overflows the addressable range")]
    SizeOverflow,
}

/// Errors returned by map and segment operations.
#[derive(Debug, Error)]
pub enum ShmMapError {
    /// The layout could not be planned.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The segment has no free slot run for the new entry.
    #[error("segment {segment} is full")]
    Full {
        /// Index of the segment that refused the insert.
        segment: u32,
    },

    /// The entry is larger than any slot run the segment could ever provide.
    #[error("entry needs {needed} slots but at most {max} are available per entry")]
    EntryTooLarge {
        /// Slots the record would occupy.
        needed: u64,
        /// Largest run a single entry may use.
        max: u64,
    },

    /// A segment index past the configured segment count.
    #[error("segment index {index} out of range (segment count {count})")]
    SegmentOutOfRange {
        /// The index that was requested.
        index: u32,
        /// The map's segment count.
        count: u32,
    },

    /// The region header does not describe a map this build can attach to.
    #[error("region header mismatch on {field}: expected {expected}, found {found}")]
    HeaderMismatch {
        /// Name of the offending header field.
        field: &'static str,
        /// Value this build expected.
        expected: u64,
        /// Value found in the region.
        found: u64,
    },

    /// The region is not a usable map.
    #[error("corrupted region: {0}")]
    Corruption(String),

    /// An I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mapping or unmapping the region failed.
    #[error("memory mapping failed: {0}")]
    Mmap(#[from] nix::errno::Errno),
}

impl ShmMapError {
    /// Returns `true` for the [`ShmMapError::Full`] condition.
    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, ShmMapError::Full { .. })
    }
}
