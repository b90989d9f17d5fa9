// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Global region header.
//!
//! The first [`REGION_HEADER_SIZE`] bytes of every region describe the
//! layout, so that a process attaching to an existing file can refuse a
//! region it does not understand. Fields are little-endian.
//!
//! ```text
//! 0   magic            [u8; 8]
//! 8   version          u32
//! 12  alignment        u32
//! 16  segment_count    u32
//! 20  record_header    u32
//! 24  requested        u64
//! 32  avg_entry_size   u32
//! 36  state            u32   (atomic, written last)
//! 40  slots            u64
//! 48  buckets          u64
//! 56  slot_size        u64
//! 64  free_list_bytes  u64
//! 72  segment_size     u64
//! 80  total_size       u64
//! ```

use crate::config::Alignment;
use crate::error::ShmMapError;
use crate::layout::LayoutPlan;
use crate::record::RECORD_HEADER_SIZE;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

/// Bytes reserved for the global header.
pub const REGION_HEADER_SIZE: u64 = 128;

pub const MAGIC: [u8; 8] = *b"DDSHMMAP";
pub const VERSION: u32 = 1;

/// `state` while the creator is still initializing segments.
const STATE_INITIALIZING: u32 = 0;
/// `state` once the region is ready for use.
const STATE_READY: u32 = 1;

mod offset {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 8;
    pub const ALIGNMENT: usize = 12;
    pub const SEGMENT_COUNT: usize = 16;
    pub const RECORD_HEADER: usize = 20;
    pub const REQUESTED: usize = 24;
    pub const AVG_ENTRY_SIZE: usize = 32;
    pub const STATE: usize = 36;
    pub const SLOTS: usize = 40;
    pub const BUCKETS: usize = 48;
    pub const SLOT_SIZE: usize = 56;
    pub const FREE_LIST_BYTES: usize = 64;
    pub const SEGMENT_SIZE: usize = 72;
    pub const TOTAL_SIZE: usize = 80;
}

/// View over the header bytes at the start of a mapped region.
pub(crate) struct RegionHeader {
    base: NonNull<u8>,
}

impl RegionHeader {
    /// # Safety
    /// `base` must point to at least [`REGION_HEADER_SIZE`] readable and
    /// writable bytes, 4-byte aligned, valid for as long as the view is used.
    pub(crate) unsafe fn new(base: NonNull<u8>) -> Self {
        RegionHeader { base }
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: every offset used is below REGION_HEADER_SIZE.
        unsafe { self.base.as_ptr().add(offset) }
    }

    fn state(&self) -> &AtomicU32 {
        // SAFETY: offset 36 is 4-aligned given a 4-aligned base.
        unsafe { &*(self.at(offset::STATE) as *const AtomicU32) }
    }

    fn magic(&self) -> [u8; 8] {
        unsafe { ptr::read_unaligned(self.at(offset::MAGIC) as *const [u8; 8]) }
    }

    fn put_u32(&self, at: usize, value: u32) {
        unsafe { ptr::write_unaligned(self.at(at) as *mut [u8; 4], value.to_le_bytes()) }
    }

    fn put_u64(&self, at: usize, value: u64) {
        unsafe { ptr::write_unaligned(self.at(at) as *mut [u8; 8], value.to_le_bytes()) }
    }

    fn get_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(unsafe { ptr::read_unaligned(self.at(at) as *const [u8; 4]) })
    }

    fn get_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(unsafe { ptr::read_unaligned(self.at(at) as *const [u8; 8]) })
    }

    /// Writes the layout and then publishes the region as ready. Must be the
    /// last step of creation, after every segment is initialized.
    pub(crate) fn publish(&self, plan: &LayoutPlan) {
        self.state().store(STATE_INITIALIZING, Ordering::Relaxed);
        unsafe { ptr::write_unaligned(self.at(offset::MAGIC) as *mut [u8; 8], MAGIC) };
        self.put_u32(offset::VERSION, VERSION);
        self.put_u32(offset::ALIGNMENT, plan.alignment.into());
        self.put_u32(offset::SEGMENT_COUNT, plan.segment_count);
        self.put_u32(offset::RECORD_HEADER, RECORD_HEADER_SIZE as u32);
        self.put_u64(offset::REQUESTED, plan.requested_entries);
        self.put_u32(offset::AVG_ENTRY_SIZE, plan.average_entry_size);
        self.put_u64(offset::SLOTS, plan.slots_per_segment);
        self.put_u64(offset::BUCKETS, plan.directory_buckets);
        self.put_u64(offset::SLOT_SIZE, plan.slot_size);
        self.put_u64(offset::FREE_LIST_BYTES, plan.free_list_bytes);
        self.put_u64(offset::SEGMENT_SIZE, plan.segment_size);
        self.put_u64(offset::TOTAL_SIZE, plan.total_size);
        // Release so an opener that observes READY sees every byte above and
        // every initialized segment.
        self.state().store(STATE_READY, Ordering::Release);
    }

    /// Validates the header against this build and against `mapped_len`, and
    /// returns the layout it describes.
    pub(crate) fn validate(&self, mapped_len: usize) -> Result<LayoutPlan, ShmMapError> {
        if self.magic() != MAGIC {
            return Err(ShmMapError::Corruption(
                "region does not start with the shm map magic".to_owned(),
            ));
        }
        expect("version", VERSION as u64, self.get_u32(offset::VERSION) as u64)?;
        expect(
            "record_header",
            RECORD_HEADER_SIZE as u64,
            self.get_u32(offset::RECORD_HEADER) as u64,
        )?;
        if self.state().load(Ordering::Acquire) != STATE_READY {
            return Err(ShmMapError::Corruption(
                "region was never fully initialized".to_owned(),
            ));
        }

        let alignment = Alignment::try_from(self.get_u32(offset::ALIGNMENT))?;
        let plan = LayoutPlan::from_parameters(
            self.get_u64(offset::REQUESTED),
            self.get_u32(offset::SEGMENT_COUNT),
            self.get_u32(offset::AVG_ENTRY_SIZE),
            alignment,
        )?;

        // The stored layout must be exactly what this build would plan.
        expect("slots", plan.slots_per_segment, self.get_u64(offset::SLOTS))?;
        expect("buckets", plan.directory_buckets, self.get_u64(offset::BUCKETS))?;
        expect("slot_size", plan.slot_size, self.get_u64(offset::SLOT_SIZE))?;
        expect(
            "free_list_bytes",
            plan.free_list_bytes,
            self.get_u64(offset::FREE_LIST_BYTES),
        )?;
        expect(
            "segment_size",
            plan.segment_size,
            self.get_u64(offset::SEGMENT_SIZE),
        )?;
        expect("total_size", plan.total_size, self.get_u64(offset::TOTAL_SIZE))?;
        expect("mapped_size", plan.total_size, mapped_len as u64)?;

        Ok(plan)
    }
}

fn expect(field: &'static str, expected: u64, found: u64) -> Result<(), ShmMapError> {
    if expected == found {
        Ok(())
    } else {
        Err(ShmMapError::HeaderMismatch {
            field,
            expected,
            found,
        })
    }
}
