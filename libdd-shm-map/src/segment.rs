// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A segment: an independently locked partition of the keyspace with its own
//! hash directory, free-slot bitset and data slots.
//!
//! # Header
//!
//! ```text
//! 0   lock          u32   (0 or holder pid)
//! 8   occupied      u64   entries present
//! 16  cursor        u64   allocation hint
//! 24  slots_in_use  u64   slots covered by entries
//! ```
//!
//! # Directory
//!
//! `directory_buckets` u32 cells holding `slot + 1` of the chain head, or 0
//! for an empty bucket. New entries become the head of their bucket's chain.
//!
//! # Thread / Process Safety
//!
//! Every operation other than the counter reads runs under the segment lock.
//! The counters are atomics so diagnostics can read them without locking.
//! Segments never grow: an insert that finds no free slot run fails with
//! [`ShmMapError::Full`].

use crate::error::ShmMapError;
use crate::free_list::FreeList;
use crate::hash::bucket_index;
use crate::layout::LayoutPlan;
use crate::lock::SegmentLock;
use crate::record::{record_len, Record};
use crate::value_ref::ValueRef;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

mod header {
    pub const LOCK_OFFSET: usize = 0;
    pub const OCCUPIED_OFFSET: usize = 8;
    pub const CURSOR_OFFSET: usize = 16;
    pub const SLOTS_IN_USE_OFFSET: usize = 24;
}

/// Index of a slot within its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    #[inline]
    pub const fn new(index: u32) -> Self {
        SlotIndex(index)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Outcome of [`LockedSegment::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// A new entry was written at this slot.
    New(SlotIndex),
    /// The key was already present; nothing was written.
    Existing(SlotIndex),
}

impl Inserted {
    #[inline]
    pub fn slot(self) -> SlotIndex {
        match self {
            Inserted::New(slot) | Inserted::Existing(slot) => slot,
        }
    }

    #[inline]
    pub fn is_new(self) -> bool {
        matches!(self, Inserted::New(_))
    }
}

/// Occupancy figures of one segment, gathered under its lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub occupied: u64,
    pub slots_in_use: u64,
    pub free_slots: u64,
    pub used_buckets: u64,
    pub longest_chain: u64,
}

/// Handle to one segment block of a mapped region.
pub struct Segment<'a> {
    index: u32,
    base: NonNull<u8>,
    region_offset: usize,
    plan: &'a LayoutPlan,
}

impl<'a> Segment<'a> {
    /// # Safety
    /// `base` must point to the start of segment `index` in a mapping laid
    /// out by `plan`, valid and 64-byte aligned for the lifetime `'a`.
    #[inline]
    pub(crate) unsafe fn new(
        base: NonNull<u8>,
        index: u32,
        region_offset: usize,
        plan: &'a LayoutPlan,
    ) -> Self {
        Segment {
            index,
            base,
            region_offset,
            plan,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn total_slots(&self) -> u64 {
        self.plan.slots_per_segment
    }

    // -- Header -------------------------------------------------------------

    #[inline]
    fn header_u64(&self, offset: usize) -> &AtomicU64 {
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    #[inline]
    fn lock_word(&self) -> &AtomicU32 {
        unsafe { &*(self.base.as_ptr().add(header::LOCK_OFFSET) as *const AtomicU32) }
    }

    #[inline]
    fn occupied(&self) -> &AtomicU64 {
        self.header_u64(header::OCCUPIED_OFFSET)
    }

    #[inline]
    fn cursor(&self) -> &AtomicU64 {
        self.header_u64(header::CURSOR_OFFSET)
    }

    #[inline]
    fn slots_in_use_counter(&self) -> &AtomicU64 {
        self.header_u64(header::SLOTS_IN_USE_OFFSET)
    }

    /// The segment's lock word.
    #[inline]
    pub fn lock(&self) -> SegmentLock<'_> {
        SegmentLock::new(self.lock_word())
    }

    /// Entries currently present. A momentary read, no lock taken.
    #[inline]
    pub fn occupied_count(&self) -> u64 {
        self.occupied().load(Ordering::Acquire)
    }

    /// Slots covered by entries. Differs from [`occupied_count`] only when
    /// some entries span several slots.
    ///
    /// [`occupied_count`]: Segment::occupied_count
    #[inline]
    pub fn slots_in_use(&self) -> u64 {
        self.slots_in_use_counter().load(Ordering::Acquire)
    }

    // -- Sub-regions ----------------------------------------------------------

    #[inline]
    fn bucket_cell(&self, bucket: u64) -> *mut u32 {
        unsafe {
            self.base
                .as_ptr()
                .add(self.plan.directory_offset as usize + bucket as usize * 4)
                as *mut u32
        }
    }

    #[inline]
    fn bucket_head(&self, bucket: u64) -> Option<u32> {
        unsafe { self.bucket_cell(bucket).read() }.checked_sub(1)
    }

    #[inline]
    fn set_bucket_head(&self, bucket: u64, head: Option<u32>) {
        unsafe { self.bucket_cell(bucket).write(head.map_or(0, |slot| slot + 1)) }
    }

    #[inline]
    fn free_list(&self) -> FreeList {
        unsafe {
            let words = self.base.as_ptr().add(self.plan.free_list_offset as usize) as *mut u64;
            FreeList::new(NonNull::new_unchecked(words), self.plan.slots_per_segment)
        }
    }

    #[inline]
    fn record(&self, slot: u32) -> Record {
        unsafe {
            Record::new(NonNull::new_unchecked(
                self.base.as_ptr().add(self.plan.slot_offset(slot)),
            ))
        }
    }

    // -- Locking --------------------------------------------------------------

    /// Runs `f` with exclusive access to this segment's directory, free-list
    /// and slots. The lock is released on every exit path, including panics.
    pub fn with_lock<R>(&self, f: impl FnOnce(&LockedSegment<'_, 'a>) -> R) -> R {
        let lock = self.lock();
        let _guard = lock.lock();
        f(&LockedSegment { segment: self })
    }

    /// Resets the segment to empty. Only used while creating a region, or by
    /// callers that know no one holds references into it.
    pub fn clear(&self) {
        self.with_lock(|locked| locked.clear())
    }

    // -- Operations -----------------------------------------------------------

    pub fn find(&self, hash: u64, key: &[u8]) -> Option<SlotIndex> {
        self.with_lock(|locked| locked.find(hash, key))
    }

    pub fn contains(&self, hash: u64, key: &[u8]) -> bool {
        self.find(hash, key).is_some()
    }

    pub fn insert(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<Inserted, ShmMapError> {
        self.with_lock(|locked| locked.insert(hash, key, value))
    }

    pub fn put(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<bool, ShmMapError> {
        self.with_lock(|locked| locked.put(hash, key, value))
    }

    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        self.with_lock(|locked| locked.remove(hash, key))
    }

    pub fn get(&self, hash: u64, key: &[u8]) -> Option<ValueRef<'a>> {
        self.with_lock(|locked| locked.get(hash, key))
    }

    /// Copies the value into `buf` while the lock is held.
    pub fn get_into(&self, hash: u64, key: &[u8], buf: &mut Vec<u8>) -> bool {
        self.with_lock(|locked| locked.get_into(hash, key, buf))
    }

    pub fn get_or_insert_and_acquire(
        &self,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<ValueRef<'a>, ShmMapError> {
        self.with_lock(|locked| locked.get_or_insert_and_acquire(hash, key, value))
    }

    pub fn acquire_reference(&self, slot: SlotIndex) -> Option<ValueRef<'a>> {
        self.with_lock(|locked| locked.acquire_reference(slot))
    }

    pub fn stats(&self) -> Result<SegmentStats, ShmMapError> {
        self.with_lock(|locked| locked.verify())
    }
}

/// A segment whose lock is held by the current thread. Only reachable
/// through [`Segment::with_lock`].
pub struct LockedSegment<'s, 'a> {
    segment: &'s Segment<'a>,
}

impl<'a> LockedSegment<'_, 'a> {
    #[inline]
    pub fn index(&self) -> u32 {
        self.segment.index
    }

    /// Walks the bucket chain for `key`. Returns the matching slot and its
    /// predecessor in the chain.
    fn find_with_prev(&self, hash: u64, key: &[u8]) -> Option<(u32, Option<u32>)> {
        let seg = self.segment;
        let mut prev = None;
        let mut cursor = seg.bucket_head(bucket_index(hash, seg.plan.directory_buckets));
        while let Some(slot) = cursor {
            let record = seg.record(slot);
            if record.matches(hash, key) {
                return Some((slot, prev));
            }
            prev = Some(slot);
            cursor = record.next();
        }
        None
    }

    pub fn find(&self, hash: u64, key: &[u8]) -> Option<SlotIndex> {
        self.find_with_prev(hash, key)
            .map(|(slot, _)| SlotIndex(slot))
    }

    fn chunks_for(&self, key: &[u8], value: &[u8]) -> Result<u64, ShmMapError> {
        let plan = self.segment.plan;
        let max = plan.max_entry_slots();
        if key.len() > u32::MAX as usize || value.len() > u32::MAX as usize {
            return Err(ShmMapError::EntryTooLarge { needed: u64::MAX, max });
        }
        let bytes = record_len(key.len(), value.len(), plan.alignment) as u64;
        let needed = bytes.div_ceil(plan.slot_size).max(1);
        if needed > max {
            return Err(ShmMapError::EntryTooLarge { needed, max });
        }
        Ok(needed)
    }

    /// Claims a slot run and writes a record into it, without linking it
    /// into any chain.
    fn allocate(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<u32, ShmMapError> {
        let seg = self.segment;
        let chunks = self.chunks_for(key, value)?;
        let free_list = seg.free_list();
        let hint = seg.cursor().load(Ordering::Relaxed);
        let Some(start) = free_list.find_run(hint, chunks) else {
            debug!(segment = seg.index, chunks, "segment full");
            return Err(ShmMapError::Full { segment: seg.index });
        };
        free_list.mark_used(start, chunks);
        let slot = start as u32;
        // SAFETY: the run was free and is now claimed under the lock, and
        // chunks_for sized it for the record.
        unsafe {
            seg.record(slot)
                .write(chunks as u16, None, hash, key, value, seg.plan.alignment)
        };
        seg.cursor()
            .store((start + chunks) % seg.plan.slots_per_segment, Ordering::Relaxed);
        seg.slots_in_use_counter()
            .fetch_add(chunks, Ordering::Release);
        Ok(slot)
    }

    fn link_head(&self, hash: u64, slot: u32) {
        let seg = self.segment;
        let bucket = bucket_index(hash, seg.plan.directory_buckets);
        seg.record(slot).set_next(seg.bucket_head(bucket));
        seg.set_bucket_head(bucket, Some(slot));
    }

    fn unlink(&self, hash: u64, prev: Option<u32>, next: Option<u32>) {
        let seg = self.segment;
        match prev {
            Some(prev) => seg.record(prev).set_next(next),
            None => seg.set_bucket_head(bucket_index(hash, seg.plan.directory_buckets), next),
        }
    }

    /// Inserts `key` unless it is already present, in which case the existing
    /// entry is returned untouched.
    pub fn insert(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<Inserted, ShmMapError> {
        if let Some(slot) = self.find(hash, key) {
            return Ok(Inserted::Existing(slot));
        }
        let slot = self.allocate(hash, key, value)?;
        self.link_head(hash, slot);
        self.segment.occupied().fetch_add(1, Ordering::Release);
        Ok(Inserted::New(SlotIndex(slot)))
    }

    /// Inserts or replaces. Returns `true` if a previous value was replaced.
    ///
    /// A value that fits the entry's current slot run is overwritten in
    /// place. Otherwise the entry moves to a new run; if no run is free the
    /// old value is kept and `Full` is returned.
    pub fn put(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<bool, ShmMapError> {
        let seg = self.segment;
        let plan = seg.plan;
        let Some((old, prev)) = self.find_with_prev(hash, key) else {
            self.insert(hash, key, value)?;
            return Ok(false);
        };

        let record = seg.record(old);
        let old_chunks = record.chunks();
        if record_len(key.len(), value.len(), plan.alignment) as u64 <= old_chunks * plan.slot_size
        {
            // SAFETY: fits the run, lock held.
            unsafe { record.overwrite_value(value, plan.alignment) };
            return Ok(true);
        }

        // Release the old run first so the new one may reuse it.
        let old_next = record.next();
        let free_list = seg.free_list();
        self.unlink(hash, prev, old_next);
        free_list.mark_free(old as u64, old_chunks);
        seg.slots_in_use_counter()
            .fetch_sub(old_chunks, Ordering::Release);

        match self.allocate(hash, key, value) {
            Ok(new) => {
                let new_chunks = seg.record(new).chunks();
                if !(new..new + new_chunks as u32).contains(&old) {
                    seg.record(old).clear();
                }
                self.link_head(hash, new);
                Ok(true)
            }
            Err(err) => {
                // Nothing was written; put the old entry back where it was.
                free_list.mark_used(old as u64, old_chunks);
                seg.slots_in_use_counter()
                    .fetch_add(old_chunks, Ordering::Release);
                match prev {
                    Some(prev) => seg.record(prev).set_next(Some(old)),
                    None => seg.set_bucket_head(
                        bucket_index(hash, plan.directory_buckets),
                        Some(old),
                    ),
                }
                Err(err)
            }
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub fn remove(&self, hash: u64, key: &[u8]) -> bool {
        let seg = self.segment;
        let Some((slot, prev)) = self.find_with_prev(hash, key) else {
            return false;
        };
        let record = seg.record(slot);
        let chunks = record.chunks();
        self.unlink(hash, prev, record.next());
        record.clear();
        seg.free_list().mark_free(slot as u64, chunks);
        seg.occupied().fetch_sub(1, Ordering::Release);
        seg.slots_in_use_counter()
            .fetch_sub(chunks, Ordering::Release);
        true
    }

    pub fn get(&self, hash: u64, key: &[u8]) -> Option<ValueRef<'a>> {
        self.find(hash, key).map(|slot| self.value_ref(slot.0))
    }

    pub fn get_into(&self, hash: u64, key: &[u8], buf: &mut Vec<u8>) -> bool {
        match self.get(hash, key) {
            Some(value) => {
                buf.clear();
                buf.resize(value.len(), 0);
                value.read_at(0, buf)
            }
            None => false,
        }
    }

    /// Returns the existing value for `key`, or inserts `value` and returns
    /// a reference to the new entry.
    pub fn get_or_insert_and_acquire(
        &self,
        hash: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<ValueRef<'a>, ShmMapError> {
        let slot = self.insert(hash, key, value)?.slot();
        Ok(self.value_ref(slot.0))
    }

    /// Reference to the value stored at `slot`, if an entry starts there.
    pub fn acquire_reference(&self, slot: SlotIndex) -> Option<ValueRef<'a>> {
        let seg = self.segment;
        if slot.0 as u64 >= seg.plan.slots_per_segment || seg.free_list().is_free(slot.0 as u64) {
            return None;
        }
        let record = seg.record(slot.0);
        // The first byte of a continuation slot is payload of the entry
        // before it and may read as present, so also require a chain link.
        if !record.is_present() {
            return None;
        }
        let bucket = bucket_index(record.key_hash(), seg.plan.directory_buckets);
        self.chain_contains(bucket, slot.0)
            .then(|| self.value_ref(slot.0))
    }

    fn chain_contains(&self, bucket: u64, slot: u32) -> bool {
        let seg = self.segment;
        let mut cursor = seg.bucket_head(bucket);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == slot {
                return true;
            }
            steps += 1;
            if steps > seg.plan.slots_per_segment {
                return false;
            }
            cursor = seg.record(current).next();
        }
        false
    }

    fn value_ref(&self, slot: u32) -> ValueRef<'a> {
        let seg = self.segment;
        let record = seg.record(slot);
        let ptr = record.value_ptr(seg.plan.alignment);
        let offset_in_segment = ptr.as_ptr() as usize - seg.base.as_ptr() as usize;
        // SAFETY: the record is present and lives in the mapping for 'a.
        unsafe {
            ValueRef::new(
                ptr,
                record.value_len(),
                seg.index,
                SlotIndex(slot),
                seg.region_offset + offset_in_segment,
            )
        }
    }

    pub fn clear(&self) {
        let seg = self.segment;
        for bucket in 0..seg.plan.directory_buckets {
            seg.set_bucket_head(bucket, None);
        }
        seg.free_list().reset();
        seg.cursor().store(0, Ordering::Relaxed);
        seg.slots_in_use_counter().store(0, Ordering::Release);
        seg.occupied().store(0, Ordering::Release);
    }

    /// Walks every chain and checks that directory, free-list and counters
    /// agree.
    pub fn verify(&self) -> Result<SegmentStats, ShmMapError> {
        let seg = self.segment;
        let plan = seg.plan;
        let slots = plan.slots_per_segment;
        let free_list = seg.free_list();
        let corrupt = |msg: String| ShmMapError::Corruption(format!("segment {}: {msg}", seg.index));

        let mut owned = vec![false; slots as usize];
        let mut stats = SegmentStats::default();
        for bucket in 0..plan.directory_buckets {
            let mut chain = 0u64;
            let mut cursor = seg.bucket_head(bucket);
            while let Some(slot) = cursor {
                if slot as u64 >= slots {
                    return Err(corrupt(format!("bucket {bucket} links to slot {slot}")));
                }
                let record = seg.record(slot);
                if !record.is_present() {
                    return Err(corrupt(format!("slot {slot} is chained but not present")));
                }
                if bucket_index(record.key_hash(), plan.directory_buckets) != bucket {
                    return Err(corrupt(format!("slot {slot} is in the wrong bucket")));
                }
                let chunks = record.chunks();
                if chunks == 0 || slot as u64 + chunks > slots {
                    return Err(corrupt(format!("slot {slot} has invalid run length {chunks}")));
                }
                for s in slot as u64..slot as u64 + chunks {
                    if owned[s as usize] {
                        return Err(corrupt(format!("slot {s} belongs to two entries")));
                    }
                    if free_list.is_free(s) {
                        return Err(corrupt(format!("slot {s} is chained but marked free")));
                    }
                    owned[s as usize] = true;
                }
                stats.occupied += 1;
                stats.slots_in_use += chunks;
                chain += 1;
                cursor = record.next();
            }
            if chain > 0 {
                stats.used_buckets += 1;
                stats.longest_chain = stats.longest_chain.max(chain);
            }
        }

        stats.free_slots = free_list.count_free();
        if let Some(orphan) = (0..slots).find(|&s| !owned[s as usize] && !free_list.is_free(s)) {
            return Err(corrupt(format!("slot {orphan} is marked used but unreachable")));
        }
        if stats.occupied != seg.occupied_count() {
            return Err(corrupt(format!(
                "occupied counter is {} but {} entries are reachable",
                seg.occupied_count(),
                stats.occupied
            )));
        }
        if stats.slots_in_use != seg.slots_in_use() {
            return Err(corrupt(format!(
                "slots-in-use counter is {} but {} slots are reachable",
                seg.slots_in_use(),
                stats.slots_in_use
            )));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Alignment;
    use crate::hash::hash_key;
    use std::collections::HashMap;

    /// Helper: a heap buffer laid out like one segment block. `Vec<u64>`
    /// keeps it 8-byte aligned, which covers every atomic in the header.
    struct TestSegment {
        _buf: Vec<u64>,
        base: NonNull<u8>,
        plan: LayoutPlan,
    }

    impl TestSegment {
        fn new(entries: u64, entry_size: u32, alignment: Alignment) -> Self {
            let plan = LayoutPlan::from_parameters(entries, 1, entry_size, alignment).unwrap();
            let mut buf = vec![0u64; plan.segment_size as usize / 8];
            let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
            let segment = TestSegment {
                _buf: buf,
                base,
                plan,
            };
            segment.segment().clear();
            segment
        }

        fn segment(&self) -> Segment<'_> {
            unsafe { Segment::new(self.base, 0, 0, &self.plan) }
        }
    }

    fn put(segment: &Segment<'_>, key: &str, value: &[u8]) -> Result<bool, ShmMapError> {
        segment.put(hash_key(key.as_bytes()), key.as_bytes(), value)
    }

    fn get(segment: &Segment<'_>, key: &str) -> Option<Vec<u8>> {
        segment
            .get(hash_key(key.as_bytes()), key.as_bytes())
            .map(|value| value.to_vec())
    }

    #[test]
    fn insert_find_remove() {
        let test = TestSegment::new(8, 32, Alignment::Eight);
        let segment = test.segment();
        let hash = hash_key(b"alpha");

        let inserted = segment.insert(hash, b"alpha", b"one").unwrap();
        assert!(inserted.is_new());
        assert_eq!(segment.find(hash, b"alpha"), Some(inserted.slot()));
        assert_eq!(segment.occupied_count(), 1);

        let again = segment.insert(hash, b"alpha", b"two").unwrap();
        assert_eq!(again, Inserted::Existing(inserted.slot()));
        assert_eq!(get(&segment, "alpha").unwrap(), b"one");

        assert!(segment.remove(hash, b"alpha"));
        assert!(!segment.remove(hash, b"alpha"));
        assert_eq!(segment.find(hash, b"alpha"), None);
        assert_eq!(segment.occupied_count(), 0);
        segment.stats().unwrap();
    }

    #[test]
    fn full_is_reported_and_cleared_by_remove() {
        let test = TestSegment::new(4, 32, Alignment::Four);
        let segment = test.segment();
        for i in 0..4 {
            put(&segment, &format!("key:{i}"), b"v").unwrap();
        }
        let err = put(&segment, "key:4", b"v").unwrap_err();
        assert!(matches!(err, ShmMapError::Full { segment: 0 }));
        // Still full on retry.
        assert!(put(&segment, "key:5", b"v").unwrap_err().is_full());

        assert!(segment.remove(hash_key(b"key:2"), b"key:2"));
        assert!(!put(&segment, "key:4", b"v").unwrap());
        assert!(put(&segment, "key:5", b"v").unwrap_err().is_full());
        assert_eq!(segment.stats().unwrap().free_slots, 0);
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let test = TestSegment::new(16, 16, Alignment::Four);
        let segment = test.segment();
        // Same bucket (high bits), different full hashes.
        let hashes = [0x0000_0001_0000_0000u64, 0x0000_0001_0000_0001, 0x0000_0001_0000_0002];
        for (i, &hash) in hashes.iter().enumerate() {
            segment.insert(hash, &[i as u8], &[i as u8]).unwrap();
        }
        let stats = segment.stats().unwrap();
        assert_eq!(stats.longest_chain, 3);
        assert_eq!(stats.used_buckets, 1);

        // Remove from the middle, the head and the tail of the chain.
        assert!(segment.remove(hashes[1], &[1]));
        segment.stats().unwrap();
        assert!(segment.remove(hashes[2], &[2]));
        segment.stats().unwrap();
        assert!(segment.find(hashes[0], &[0]).is_some());
        assert!(segment.remove(hashes[0], &[0]));
        let expected = SegmentStats {
            free_slots: test.plan.slots_per_segment,
            ..Default::default()
        };
        assert_eq!(segment.stats().unwrap(), expected);
    }

    #[test]
    fn same_hash_different_key() {
        let test = TestSegment::new(4, 16, Alignment::Four);
        let segment = test.segment();
        segment.insert(42, b"a", b"1").unwrap();
        segment.insert(42, b"b", b"2").unwrap();
        assert_eq!(segment.get(42, b"a").unwrap().to_vec(), b"1");
        assert_eq!(segment.get(42, b"b").unwrap().to_vec(), b"2");
        assert!(segment.get(42, b"c").is_none());
    }

    #[test]
    fn put_replaces_in_place_when_it_fits() {
        let test = TestSegment::new(4, 32, Alignment::Eight);
        let segment = test.segment();
        assert!(!put(&segment, "k", b"first").unwrap());
        let slot = segment.find(hash_key(b"k"), b"k").unwrap();
        assert!(put(&segment, "k", b"second").unwrap());
        assert_eq!(segment.find(hash_key(b"k"), b"k"), Some(slot));
        assert_eq!(get(&segment, "k").unwrap(), b"second");
        assert_eq!(segment.occupied_count(), 1);
    }

    #[test]
    fn large_entries_span_several_slots() {
        let test = TestSegment::new(8, 16, Alignment::Eight);
        let segment = test.segment();
        let slot_size = test.plan.slot_size as usize;
        let big = vec![7u8; slot_size * 2];

        assert!(!put(&segment, "big", &big).unwrap());
        assert_eq!(segment.occupied_count(), 1);
        assert_eq!(segment.slots_in_use(), 3);
        assert_eq!(get(&segment, "big").unwrap(), big);

        // Growing past the run moves the entry; shrinking keeps it in place.
        let bigger = vec![9u8; slot_size * 3];
        assert!(put(&segment, "big", &bigger).unwrap());
        assert_eq!(get(&segment, "big").unwrap(), bigger);
        assert_eq!(segment.slots_in_use(), 4);
        assert!(put(&segment, "big", b"tiny").unwrap());
        assert_eq!(get(&segment, "big").unwrap(), b"tiny");
        assert_eq!(segment.slots_in_use(), 4);
        segment.stats().unwrap();
    }

    #[test]
    fn failed_move_keeps_old_value() {
        let test = TestSegment::new(4, 16, Alignment::Four);
        let segment = test.segment();
        for i in 0..3 {
            put(&segment, &format!("k{i}"), b"x").unwrap();
        }
        let slot_size = test.plan.slot_size as usize;
        let err = put(&segment, "k1", &vec![1u8; slot_size * 2]).unwrap_err();
        assert!(err.is_full());
        assert_eq!(get(&segment, "k1").unwrap(), b"x");
        assert_eq!(segment.occupied_count(), 3);
        segment.stats().unwrap();
    }

    #[test]
    fn entry_larger_than_segment_is_rejected() {
        let test = TestSegment::new(2, 16, Alignment::Four);
        let segment = test.segment();
        let err = put(&segment, "k", &vec![0u8; 1024]).unwrap_err();
        assert!(matches!(err, ShmMapError::EntryTooLarge { max: 2, .. }));
    }

    #[test]
    fn acquire_returns_existing_and_mutates_in_place() {
        let test = TestSegment::new(4, 32, Alignment::Eight);
        let segment = test.segment();
        let hash = hash_key(b"counter");
        let value = segment
            .get_or_insert_and_acquire(hash, b"counter", &0u64.to_ne_bytes())
            .unwrap();
        value.atomic_u64(0).unwrap().fetch_add(3, Ordering::Relaxed);

        let again = segment
            .get_or_insert_and_acquire(hash, b"counter", &100u64.to_ne_bytes())
            .unwrap();
        assert_eq!(again.read_u64(0), Some(3));
        assert_eq!(again.region_offset(), value.region_offset());
        assert_eq!(segment.occupied_count(), 1);
    }

    #[test]
    fn acquire_reference_by_slot() {
        let test = TestSegment::new(8, 32, Alignment::Four);
        let segment = test.segment();
        let slot = segment.insert(7, b"key", b"value").unwrap().slot();
        assert_eq!(segment.acquire_reference(slot).unwrap().to_vec(), b"value");
        assert!(segment.acquire_reference(SlotIndex::new(slot.get() + 1)).is_none());
        assert!(segment.acquire_reference(SlotIndex::new(1_000)).is_none());
        segment.remove(7, b"key");
        assert!(segment.acquire_reference(slot).is_none());
    }

    #[test]
    fn value_offsets_are_aligned() {
        for alignment in [Alignment::Two, Alignment::Four, Alignment::Eight] {
            let test = TestSegment::new(32, 24, alignment);
            let segment = test.segment();
            for i in 0..32 {
                let key = "k".repeat(i % 7 + 1);
                let value = segment
                    .get_or_insert_and_acquire(i as u64, key.as_bytes(), b"12345678")
                    .unwrap();
                assert_eq!(value.region_offset() % alignment.bytes(), 0);
                assert_eq!(value.as_ptr() as usize % alignment.bytes(), 0);
            }
        }
    }

    #[test]
    fn with_lock_groups_operations() {
        let test = TestSegment::new(8, 32, Alignment::Four);
        let segment = test.segment();
        let moved = segment.with_lock(|locked| {
            locked.insert(1, b"a", b"1").unwrap();
            locked.insert(2, b"b", b"2").unwrap();
            locked.remove(1, b"a")
        });
        assert!(moved);
        assert_eq!(segment.lock().holder(), None);
        assert_eq!(segment.occupied_count(), 1);
    }

    #[test]
    fn allocation_rotates_through_slots() {
        let test = TestSegment::new(8, 16, Alignment::Four);
        let segment = test.segment();
        let first = segment.insert(1, b"a", b"").unwrap().slot();
        segment.remove(1, b"a");
        let second = segment.insert(2, b"b", b"").unwrap().slot();
        assert_ne!(first, second);
    }

    #[test]
    fn clear_empties_the_segment() {
        let test = TestSegment::new(8, 16, Alignment::Four);
        let segment = test.segment();
        for i in 0..8u64 {
            segment.insert(i, &i.to_le_bytes(), b"").unwrap();
        }
        segment.clear();
        assert_eq!(segment.occupied_count(), 0);
        assert_eq!(segment.stats().unwrap().free_slots, 8);
        assert!(segment.find(3, &3u64.to_le_bytes()).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn fuzz_operations_match_model() {
        bolero::check!()
            .with_type::<Vec<(u8, u8, u8)>>()
            .for_each(|ops| {
                let test = TestSegment::new(24, 16, Alignment::Four);
                let slot_size = test.plan.slot_size as usize;
                let segment = test.segment();
                let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

                for &(op, key, len) in ops {
                    let key = vec![key % 40];
                    let hash = hash_key(&key);
                    let value = vec![len; len as usize % (slot_size * 2)];
                    match op % 4 {
                        0 => match segment.put(hash, &key, &value) {
                            Ok(replaced) => {
                                assert_eq!(replaced, model.insert(key, value).is_some());
                            }
                            Err(err) => assert!(err.is_full(), "{err}"),
                        },
                        1 => match segment.insert(hash, &key, &value) {
                            Ok(Inserted::New(_)) => {
                                assert!(model.insert(key, value).is_none());
                            }
                            Ok(Inserted::Existing(_)) => assert!(model.contains_key(&key)),
                            Err(err) => {
                                assert!(err.is_full(), "{err}");
                                assert!(!model.contains_key(&key));
                            }
                        },
                        2 => {
                            assert_eq!(segment.remove(hash, &key), model.remove(&key).is_some());
                        }
                        _ => {
                            let found = segment.get(hash, &key).map(|v| v.to_vec());
                            assert_eq!(found.as_ref(), model.get(&key));
                        }
                    }
                }

                let stats = segment.stats().unwrap();
                assert_eq!(stats.occupied, model.len() as u64);
                assert_eq!(segment.occupied_count(), model.len() as u64);
            });
    }
}
