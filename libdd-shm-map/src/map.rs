// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The map handle: owns a mapped region and routes operations to segments.

use crate::config::MapConfig;
use crate::error::{ConfigError, ShmMapError};
use crate::hash::{hash_key, segment_index};
use crate::header::{RegionHeader, REGION_HEADER_SIZE};
use crate::layout::LayoutPlan;
use crate::region::MappedRegion;
use crate::segment::{LockedSegment, Segment, SegmentStats};
use crate::value_ref::ValueRef;
use core::ptr::NonNull;
use std::path::Path;
use tracing::debug;

/// A fixed-capacity key-value map living in a shared memory region.
///
/// Every process that maps the same region sees the same entries. Operations
/// take the segment index and key hash explicitly, as produced by
/// [`hash_key`] and [`segment_index`]; the `*_key` helpers do that routing
/// for you.
///
/// Dropping the map unmaps the region for this process only. A backing file
/// is never deleted.
pub struct ShmMap {
    region: MappedRegion,
    plan: LayoutPlan,
}

impl ShmMap {
    /// Plans the layout for `config`, maps a fresh zeroed region (the backing
    /// file is truncated if it exists) and initializes every segment.
    pub fn create(config: &MapConfig) -> Result<Self, ShmMapError> {
        config.validate()?;
        let plan = LayoutPlan::new(config)?;
        let len = usize::try_from(plan.total_size).map_err(|_| ConfigError::SizeOverflow)?;
        let region = match &config.backing_path {
            Some(path) => MappedRegion::create_file(path, len)?,
            None => MappedRegion::anonymous(len)?,
        };

        let map = ShmMap { region, plan };
        for index in 0..plan.segment_count {
            map.segment_at(index).clear();
        }
        map.header().publish(&plan);

        debug!(
            path = ?config.backing_path,
            segments = plan.segment_count,
            slots_per_segment = plan.slots_per_segment,
            slot_size = plan.slot_size,
            total_size = plan.total_size,
            "created shm map"
        );
        Ok(map)
    }

    /// Attaches to an existing map file. The header must describe a layout
    /// this build plans identically, and the file must be exactly that size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShmMapError> {
        let path = path.as_ref();
        let region = MappedRegion::open_file(path)?;
        if region.len() < REGION_HEADER_SIZE as usize {
            return Err(ShmMapError::Corruption(format!(
                "{} is shorter than the region header",
                path.display()
            )));
        }
        // SAFETY: the mapping is at least a header long and page aligned.
        let plan = unsafe { RegionHeader::new(region.as_ptr()) }.validate(region.len())?;

        debug!(
            path = %path.display(),
            segments = plan.segment_count,
            requested_entries = plan.requested_entries,
            "opened shm map"
        );
        Ok(ShmMap { region, plan })
    }

    /// Like [`ShmMap::open`], but also requires the stored creation
    /// parameters to equal `config`'s.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: &MapConfig,
    ) -> Result<Self, ShmMapError> {
        let map = Self::open(path)?;
        let plan = &map.plan;
        let checks = [
            ("requested_entries", config.requested_entries, plan.requested_entries),
            ("segment_count", config.segment_count as u64, plan.segment_count as u64),
            (
                "average_entry_size",
                config.average_entry_size as u64,
                plan.average_entry_size as u64,
            ),
            (
                "alignment",
                u32::from(config.alignment) as u64,
                u32::from(plan.alignment) as u64,
            ),
        ];
        for (field, expected, found) in checks {
            if expected != found {
                return Err(ShmMapError::HeaderMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(map)
    }

    /// Opens `config.backing_path` if the file exists, creating it
    /// otherwise. Without a backing path this is [`ShmMap::create`].
    ///
    /// Not safe against two processes creating the same file concurrently;
    /// coordinate creation externally.
    pub fn open_or_create(config: &MapConfig) -> Result<Self, ShmMapError> {
        match &config.backing_path {
            Some(path) if path.exists() => Self::open_with_config(path, config),
            _ => Self::create(config),
        }
    }

    fn header(&self) -> RegionHeader {
        // SAFETY: the region always starts with a header.
        unsafe { RegionHeader::new(self.region.as_ptr()) }
    }

    fn segment_at(&self, index: u32) -> Segment<'_> {
        debug_assert!(index < self.plan.segment_count);
        let offset = self.plan.segment_offset(index);
        // SAFETY: segment blocks lie within the mapping and are 64-byte
        // aligned because the header and every block size are.
        unsafe {
            let base = NonNull::new_unchecked(self.region.as_ptr().as_ptr().add(offset));
            Segment::new(base, index, offset, &self.plan)
        }
    }

    /// Segment `index`, or `SegmentOutOfRange`.
    pub fn segment(&self, index: u32) -> Result<Segment<'_>, ShmMapError> {
        if index >= self.plan.segment_count {
            return Err(ShmMapError::SegmentOutOfRange {
                index,
                count: self.plan.segment_count,
            });
        }
        Ok(self.segment_at(index))
    }

    /// The segment a key hash routes to.
    #[inline]
    pub fn segment_for(&self, hash: u64) -> Segment<'_> {
        self.segment_at(segment_index(hash, self.plan.segment_count))
    }

    /// Runs `f` while holding the lock of segment `index`.
    pub fn with_segment_lock<'a, R>(
        &'a self,
        index: u32,
        f: impl FnOnce(&LockedSegment<'_, 'a>) -> R,
    ) -> Result<R, ShmMapError> {
        Ok(self.segment(index)?.with_lock(f))
    }

    pub fn get_or_insert_and_acquire(
        &self,
        segment: u32,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<ValueRef<'_>, ShmMapError> {
        self.segment(segment)?
            .get_or_insert_and_acquire(hash, key, value)
    }

    pub fn get(
        &self,
        segment: u32,
        hash: u64,
        key: &[u8],
    ) -> Result<Option<ValueRef<'_>>, ShmMapError> {
        Ok(self.segment(segment)?.get(hash, key))
    }

    pub fn put(
        &self,
        segment: u32,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool, ShmMapError> {
        self.segment(segment)?.put(hash, key, value)
    }

    pub fn remove(&self, segment: u32, hash: u64, key: &[u8]) -> Result<bool, ShmMapError> {
        Ok(self.segment(segment)?.remove(hash, key))
    }

    pub fn segment_occupied_count(&self, segment: u32) -> Result<u64, ShmMapError> {
        Ok(self.segment(segment)?.occupied_count())
    }

    /// Sum of the per-segment entry counts. The counters are read without
    /// locking, so under concurrent mutation this is a momentary estimate.
    pub fn total_size(&self) -> u64 {
        (0..self.plan.segment_count)
            .map(|index| self.segment_at(index).occupied_count())
            .sum()
    }

    /// Entry count of every segment, in segment order.
    pub fn segment_sizes(&self) -> Vec<u64> {
        (0..self.plan.segment_count)
            .map(|index| self.segment_at(index).occupied_count())
            .collect()
    }

    // -- Keyed helpers --------------------------------------------------------

    pub fn acquire_key(&self, key: &[u8], value: &[u8]) -> Result<ValueRef<'_>, ShmMapError> {
        let hash = hash_key(key);
        self.segment_for(hash)
            .get_or_insert_and_acquire(hash, key, value)
    }

    pub fn get_key(&self, key: &[u8]) -> Option<ValueRef<'_>> {
        let hash = hash_key(key);
        self.segment_for(hash).get(hash, key)
    }

    /// Copies the value for `key` into `buf`. Returns whether it was found.
    pub fn get_key_into(&self, key: &[u8], buf: &mut Vec<u8>) -> bool {
        let hash = hash_key(key);
        self.segment_for(hash).get_into(hash, key, buf)
    }

    pub fn put_key(&self, key: &[u8], value: &[u8]) -> Result<bool, ShmMapError> {
        let hash = hash_key(key);
        self.segment_for(hash).put(hash, key, value)
    }

    pub fn remove_key(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        self.segment_for(hash).remove(hash, key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        self.segment_for(hash).contains(hash, key)
    }

    // -- Diagnostics ----------------------------------------------------------

    #[inline]
    pub fn layout(&self) -> &LayoutPlan {
        &self.plan
    }

    #[inline]
    pub fn segment_count(&self) -> u32 {
        self.plan.segment_count
    }

    /// Backing file, or `None` for an anonymous map.
    pub fn path(&self) -> Option<&Path> {
        self.region.path()
    }

    /// Segments whose lock is held by a process that no longer exists, as
    /// `(segment, pid)` pairs. Such segments stay locked forever.
    pub fn stale_locks(&self) -> Vec<(u32, u32)> {
        (0..self.plan.segment_count)
            .filter_map(|index| {
                self.segment_at(index)
                    .lock()
                    .stale_holder()
                    .map(|pid| (index, pid))
            })
            .collect()
    }

    /// Checks every segment's invariants under its lock.
    pub fn verify(&self) -> Result<Vec<SegmentStats>, ShmMapError> {
        (0..self.plan.segment_count)
            .map(|index| self.segment_at(index).stats())
            .collect()
    }

    /// Removes every entry. References previously handed out must not be
    /// used afterwards.
    pub fn clear(&self) {
        for index in 0..self.plan.segment_count {
            self.segment_at(index).clear();
        }
    }

    /// Writes a file-backed map to disk.
    pub fn flush(&self) -> Result<(), ShmMapError> {
        self.region.flush()?;
        debug!(path = ?self.region.path(), "flushed shm map");
        Ok(())
    }

    /// Unmaps the region for this process. Other attachments and the backing
    /// file are unaffected.
    pub fn close(self) -> Result<(), ShmMapError> {
        debug!(path = ?self.region.path(), "closing shm map");
        self.region.close()
    }
}
