// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capacity planning: turns the creation parameters into a concrete byte
//! layout for every segment.
//!
//! # Segment block
//!
//! ```text
//! +----------------+----------------+------------------+--------------------+
//! | Segment header | Hash directory | Free-list bitset |     Data slots     |
//! +----------------+----------------+------------------+--------------------+
//! ```
//!
//! Every sub-region starts on a 64-byte boundary relative to the block, and
//! blocks are a multiple of 64 bytes long, so atomics in the segment header
//! are naturally aligned as long as the region base is.
//!
//! # Slack
//!
//! Keys are spread over segments by hash, so under uniform hashing the load
//! of one segment is binomial with variance `e * (1 - 1/S)` where `e` is the
//! even share. A map is only as large as its fullest segment, so each segment
//! gets `z(S)` standard deviations of headroom, `z(S) = sqrt(2 ln S) + 3`,
//! plus a small constant for tiny shares. Small maps therefore get
//! proportionally more slack than large ones, and a single segment gets none.

use crate::config::{Alignment, MapConfig};
use crate::error::ConfigError;
use crate::header::REGION_HEADER_SIZE;
use crate::record::RECORD_HEADER_SIZE;

/// Size of the per-segment header (lock word and counters).
pub const SEGMENT_HEADER_SIZE: u64 = 64;

/// Largest slot index + 1 a chain link can encode.
pub const MAX_SLOTS_PER_SEGMENT: u64 = u32::MAX as u64 - 1;

/// Largest number of consecutive slots one entry may occupy.
pub const MAX_ENTRY_SLOTS: u64 = u16::MAX as u64;

/// Standard deviations of headroom beyond the expected maximum segment load.
const SKEW_HEADROOM_SIGMAS: f64 = 3.0;

/// Extra slots for segment counts above one, covering Poisson tails when the
/// even share is only a handful of entries.
const SMALL_SHARE_SLOTS: u64 = 2;

/// Directory buckets per expected entry, before rounding to a power of two.
const BUCKETS_PER_ENTRY: u64 = 2;

const SUB_REGION_ALIGN: u64 = 64;

/// Concrete layout of a map region. Identical in every attached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    pub requested_entries: u64,
    pub segment_count: u32,
    pub average_entry_size: u32,
    pub alignment: Alignment,
    /// Even share: `ceil(requested_entries / segment_count)`.
    pub entries_per_segment: u64,
    /// Data slots per segment, including slack.
    pub slots_per_segment: u64,
    /// Bytes per slot, a multiple of `alignment`.
    pub slot_size: u64,
    /// Directory buckets per segment, a power of two.
    pub directory_buckets: u64,
    /// Bytes of free-list bitset per segment, a multiple of 8.
    pub free_list_bytes: u64,
    /// Offsets of the sub-regions, relative to the segment block.
    pub directory_offset: u64,
    pub free_list_offset: u64,
    pub data_offset: u64,
    /// Bytes per segment block, a multiple of 64.
    pub segment_size: u64,
    /// Bytes of the whole region, global header included.
    pub total_size: u64,
}

impl LayoutPlan {
    /// Plans the layout for `config`.
    pub fn new(config: &MapConfig) -> Result<Self, ConfigError> {
        Self::from_parameters(
            config.requested_entries,
            config.segment_count,
            config.average_entry_size,
            config.alignment,
        )
    }

    pub fn from_parameters(
        requested_entries: u64,
        segment_count: u32,
        average_entry_size: u32,
        alignment: Alignment,
    ) -> Result<Self, ConfigError> {
        if requested_entries == 0 {
            return Err(ConfigError::ZeroEntries);
        }
        if !segment_count.is_power_of_two() {
            return Err(ConfigError::InvalidSegmentCount(segment_count));
        }
        if average_entry_size == 0 {
            return Err(ConfigError::ZeroEntrySize);
        }

        let entries_per_segment = requested_entries.div_ceil(segment_count as u64);
        let slots_per_segment = entries_per_segment
            .checked_add(skew_margin(entries_per_segment, segment_count))
            .filter(|&slots| slots <= MAX_SLOTS_PER_SEGMENT)
            .ok_or(ConfigError::TooManySlots)?;

        let slot_size = alignment
            .round_up(average_entry_size as u64 + RECORD_HEADER_SIZE as u64)
            .ok_or(ConfigError::SizeOverflow)?;

        let directory_buckets = entries_per_segment
            .checked_mul(BUCKETS_PER_ENTRY)
            .and_then(u64::checked_next_power_of_two)
            .ok_or(ConfigError::SizeOverflow)?
            .max(2);
        let free_list_bytes = slots_per_segment.div_ceil(64) * 8;

        let directory_offset = SEGMENT_HEADER_SIZE;
        let free_list_offset = directory_buckets
            .checked_mul(4)
            .and_then(|bytes| bytes.checked_add(directory_offset))
            .and_then(align_sub_region)
            .ok_or(ConfigError::SizeOverflow)?;
        let data_offset = free_list_offset
            .checked_add(free_list_bytes)
            .and_then(align_sub_region)
            .ok_or(ConfigError::SizeOverflow)?;
        let segment_size = slots_per_segment
            .checked_mul(slot_size)
            .and_then(|bytes| bytes.checked_add(data_offset))
            .and_then(align_sub_region)
            .ok_or(ConfigError::SizeOverflow)?;
        let total_size = segment_size
            .checked_mul(segment_count as u64)
            .and_then(|bytes| bytes.checked_add(REGION_HEADER_SIZE))
            .filter(|&bytes| bytes <= isize::MAX as u64)
            .ok_or(ConfigError::SizeOverflow)?;

        Ok(LayoutPlan {
            requested_entries,
            segment_count,
            average_entry_size,
            alignment,
            entries_per_segment,
            slots_per_segment,
            slot_size,
            directory_buckets,
            free_list_bytes,
            directory_offset,
            free_list_offset,
            data_offset,
            segment_size,
            total_size,
        })
    }

    /// Upper bound on the entries the map can ever hold at once.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.slots_per_segment * self.segment_count as u64
    }

    /// How many times the even share a single segment can hold.
    pub fn slack_factor(&self) -> f64 {
        self.slots_per_segment as f64 / self.entries_per_segment as f64
    }

    /// Most consecutive slots a single entry may occupy.
    #[inline]
    pub fn max_entry_slots(&self) -> u64 {
        self.slots_per_segment.min(MAX_ENTRY_SLOTS)
    }

    /// Byte offset of segment `index` from the start of the region.
    #[inline]
    pub fn segment_offset(&self, index: u32) -> usize {
        (REGION_HEADER_SIZE + index as u64 * self.segment_size) as usize
    }

    /// Byte offset of `slot` from the start of its segment block.
    #[inline]
    pub fn slot_offset(&self, slot: u32) -> usize {
        (self.data_offset + slot as u64 * self.slot_size) as usize
    }
}

fn skew_margin(entries_per_segment: u64, segment_count: u32) -> u64 {
    if segment_count == 1 {
        return 0;
    }
    let segments = segment_count as f64;
    let variance = entries_per_segment as f64 * (1.0 - 1.0 / segments);
    let sigmas = (2.0 * segments.ln()).sqrt() + SKEW_HEADROOM_SIGMAS;
    // `as` saturates, and the caller rejects anything past the slot limit.
    (sigmas * variance.sqrt()).ceil() as u64 + SMALL_SHARE_SLOTS
}

#[inline]
fn align_sub_region(offset: u64) -> Option<u64> {
    offset
        .checked_add(SUB_REGION_ALIGN - 1)
        .map(|v| v & !(SUB_REGION_ALIGN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(entries: u64, segments: u32) -> LayoutPlan {
        LayoutPlan::from_parameters(entries, segments, 32, Alignment::Four).unwrap()
    }

    #[test]
    fn single_segment_has_exact_capacity() {
        assert_eq!(plan(1, 1).slots_per_segment, 1);
        assert_eq!(plan(2, 1).slots_per_segment, 2);
        assert_eq!(plan(5000, 1).slots_per_segment, 5000);
    }

    #[test]
    fn sixteen_segments_thousand_entries() {
        let plan = plan(1000, 16);
        assert_eq!(plan.entries_per_segment, 63);
        assert_eq!(plan.slots_per_segment, 107);
        assert!(plan.slack_factor() > 1.3);
        assert_eq!(plan.directory_buckets, 128);
        assert_eq!(plan.slot_size, 56);
    }

    #[test]
    fn slack_shrinks_as_segments_fill() {
        let mut previous = f64::INFINITY;
        for entries in [16u64, 256, 4096, 65_536, 1 << 20, 1 << 24] {
            let factor = plan(entries, 16).slack_factor();
            assert!(factor < previous, "{entries}: {factor} >= {previous}");
            previous = factor;
        }
        assert!(previous < 1.01);
    }

    #[test]
    fn large_maps_tighten() {
        let plan = plan(64_000_000, 256);
        assert!(plan.slack_factor() < 1.3);
        assert!(plan.slack_factor() > 1.0);
    }

    #[test]
    fn capacity_covers_request() {
        for segments in [1u32, 2, 4, 8, 16, 64, 1024] {
            for entries in [1u64, 7, 100, 1000, 123_457] {
                let plan = plan(entries, segments);
                assert!(plan.capacity() >= entries);
                assert!(plan.slots_per_segment >= plan.entries_per_segment);
            }
        }
    }

    #[test]
    fn offsets_are_aligned() {
        for alignment in [Alignment::One, Alignment::Two, Alignment::Four, Alignment::Eight] {
            let plan = LayoutPlan::from_parameters(777, 8, 13, alignment).unwrap();
            assert_eq!(plan.slot_size % alignment.bytes() as u64, 0);
            assert_eq!(plan.directory_offset % 64, 0);
            assert_eq!(plan.free_list_offset % 64, 0);
            assert_eq!(plan.data_offset % 64, 0);
            assert_eq!(plan.segment_size % 64, 0);
            assert_eq!(plan.segment_offset(3) % 64, 0);
            assert!(plan.free_list_offset >= plan.directory_offset + plan.directory_buckets * 4);
            assert!(plan.data_offset >= plan.free_list_offset + plan.free_list_bytes);
            assert!(plan.free_list_bytes * 8 >= plan.slots_per_segment);
        }
    }

    #[test]
    fn total_size_accounts_for_every_segment() {
        let plan = plan(1000, 16);
        assert_eq!(
            plan.total_size,
            REGION_HEADER_SIZE + 16 * plan.segment_size
        );
        assert!(
            plan.segment_size
                >= plan.data_offset + plan.slots_per_segment * plan.slot_size
        );
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            LayoutPlan::from_parameters(0, 1, 32, Alignment::Four),
            Err(ConfigError::ZeroEntries)
        );
        assert_eq!(
            LayoutPlan::from_parameters(10, 3, 32, Alignment::Four),
            Err(ConfigError::InvalidSegmentCount(3))
        );
        assert_eq!(
            LayoutPlan::from_parameters(10, 1, 0, Alignment::Four),
            Err(ConfigError::ZeroEntrySize)
        );
    }

    #[test]
    fn rejects_oversized_layouts() {
        assert_eq!(
            LayoutPlan::from_parameters(u64::MAX, 1, 32, Alignment::Four),
            Err(ConfigError::TooManySlots)
        );
        assert_eq!(
            LayoutPlan::from_parameters(1 << 31, 1, u32::MAX, Alignment::Eight),
            Err(ConfigError::SizeOverflow)
        );
    }
}
