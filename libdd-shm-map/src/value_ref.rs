// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live handles to values inside the mapping.

use crate::segment::SlotIndex;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, AtomicU64};
use std::fmt;

/// A handle pointing directly at a value's bytes in the shared region.
///
/// Reads and writes go to the mapping without an intermediate copy, so they
/// are immediately visible to every attached process. The handle borrows the
/// map, so it cannot outlive the mapping. It stays valid until the entry is
/// removed, or moved by a `put` whose value outgrows the entry's slot run;
/// coordinating that is up to the caller. Writes through a handle are not
/// serialized by the segment lock.
///
/// Holding a raw pointer, the handle is neither `Send` nor `Sync`.
pub struct ValueRef<'a> {
    ptr: NonNull<u8>,
    len: usize,
    segment: u32,
    slot: SlotIndex,
    region_offset: usize,
    _map: PhantomData<&'a ()>,
}

impl<'a> ValueRef<'a> {
    /// # Safety
    /// `ptr` must point to `len` bytes of a present record's value inside a
    /// mapping that outlives `'a`.
    pub(crate) unsafe fn new(
        ptr: NonNull<u8>,
        len: usize,
        segment: u32,
        slot: SlotIndex,
        region_offset: usize,
    ) -> Self {
        ValueRef {
            ptr,
            len,
            segment,
            slot,
            region_offset,
            _map: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn segment(&self) -> u32 {
        self.segment
    }

    #[inline]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Offset of the value's first byte from the start of the region. Always
    /// a multiple of the map's alignment.
    #[inline]
    pub fn region_offset(&self) -> usize {
        self.region_offset
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Borrows the value bytes.
    ///
    /// # Safety
    /// No one, in this or any other process, may write the value while the
    /// returned slice is alive.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Copies the value out of the mapping.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_at(0, &mut out);
        out
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`. Returns
    /// `false` without copying if the range is out of bounds.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> bool {
        if !self.in_bounds(offset, buf.len()) {
            return false;
        }
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len()) };
        true
    }

    /// Writes `bytes` at `offset` in place. Returns `false` without writing
    /// if the range is out of bounds.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> bool {
        if !self.in_bounds(offset, bytes.len()) {
            return false;
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len()) };
        true
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf).then(|| u64::from_ne_bytes(buf))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> bool {
        self.write_at(offset, &value.to_ne_bytes())
    }

    /// Views eight bytes at `offset` as an atomic, for lock-free updates
    /// shared across processes. `None` if out of bounds or misaligned.
    pub fn atomic_u64(&self, offset: usize) -> Option<&AtomicU64> {
        self.atomic_at::<AtomicU64>(offset)
    }

    pub fn atomic_u32(&self, offset: usize) -> Option<&AtomicU32> {
        self.atomic_at::<AtomicU32>(offset)
    }

    fn atomic_at<T>(&self, offset: usize) -> Option<&T> {
        let size = core::mem::size_of::<T>();
        if !self.in_bounds(offset, size) {
            return None;
        }
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        if ptr as usize % core::mem::align_of::<T>() != 0 {
            return None;
        }
        // SAFETY: in bounds, aligned, and the mapping outlives 'a.
        Some(unsafe { &*(ptr as *const T) })
    }

    #[inline]
    fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }
}

impl fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueRef")
            .field("segment", &self.segment)
            .field("slot", &self.slot)
            .field("region_offset", &self.region_offset)
            .field("len", &self.len)
            .finish()
    }
}
