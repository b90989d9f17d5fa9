// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry records inside data slots.
//!
//! ```text
//! +---------+----------+--------+------+----------+---------+-----------+-----+-------+
//! | present | reserved | chunks | next | key_hash | key_len | value_len | key | value |
//! | u8      | u8       | u16    | u32  | u64      | u32     | u32       |     |       |
//! +---------+----------+--------+------+----------+---------+-----------+-----+-------+
//! ```
//!
//! `next` is `slot + 1` of the following entry in the bucket chain, or 0 at
//! the end. The value starts at the first `alignment` boundary after the key.
//! A record longer than one slot continues into the following `chunks - 1`
//! slots. Header fields are little-endian and read unaligned, since slots
//! may be 1- or 2-byte aligned.

use crate::config::Alignment;
use core::ptr::{self, NonNull};

/// Bytes before the key in every record.
pub const RECORD_HEADER_SIZE: usize = 24;

mod field {
    pub const PRESENT: usize = 0;
    pub const CHUNKS: usize = 2;
    pub const NEXT: usize = 4;
    pub const KEY_HASH: usize = 8;
    pub const KEY_LEN: usize = 16;
    pub const VALUE_LEN: usize = 20;
}

/// Offset of the value from the start of the record.
#[inline]
pub fn value_offset(key_len: usize, alignment: Alignment) -> usize {
    let mask = alignment.bytes() - 1;
    (RECORD_HEADER_SIZE + key_len + mask) & !mask
}

/// Total bytes a record with these lengths occupies.
#[inline]
pub fn record_len(key_len: usize, value_len: usize, alignment: Alignment) -> usize {
    value_offset(key_len, alignment) + value_len
}

/// Raw view of one record. Reads and writes go straight to the mapping; the
/// caller must hold the segment lock for anything but the value bytes.
#[derive(Clone, Copy)]
pub(crate) struct Record {
    ptr: NonNull<u8>,
}

impl Record {
    /// # Safety
    /// `ptr` must point to the start of a slot run inside a live mapping,
    /// at least `RECORD_HEADER_SIZE` bytes long (and long enough for the key
    /// and value once those are written).
    #[inline]
    pub(crate) unsafe fn new(ptr: NonNull<u8>) -> Self {
        Record { ptr }
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(unsafe { ptr::read_unaligned(self.at(offset) as *const [u8; 2]) })
    }

    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(unsafe { ptr::read_unaligned(self.at(offset) as *const [u8; 4]) })
    }

    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(unsafe { ptr::read_unaligned(self.at(offset) as *const [u8; 8]) })
    }

    #[inline]
    fn write_u16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_unaligned(self.at(offset) as *mut [u8; 2], value.to_le_bytes()) }
    }

    #[inline]
    fn write_u32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_unaligned(self.at(offset) as *mut [u8; 4], value.to_le_bytes()) }
    }

    #[inline]
    fn write_u64(&self, offset: usize, value: u64) {
        unsafe { ptr::write_unaligned(self.at(offset) as *mut [u8; 8], value.to_le_bytes()) }
    }

    #[inline]
    pub(crate) fn is_present(&self) -> bool {
        unsafe { *self.at(field::PRESENT) == 1 }
    }

    #[inline]
    pub(crate) fn chunks(&self) -> u64 {
        self.read_u16(field::CHUNKS) as u64
    }

    /// Next slot in the chain, if any.
    #[inline]
    pub(crate) fn next(&self) -> Option<u32> {
        self.read_u32(field::NEXT).checked_sub(1)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: Option<u32>) {
        self.write_u32(field::NEXT, next.map_or(0, |slot| slot + 1));
    }

    #[inline]
    pub(crate) fn key_hash(&self) -> u64 {
        self.read_u64(field::KEY_HASH)
    }

    #[inline]
    pub(crate) fn key_len(&self) -> usize {
        self.read_u32(field::KEY_LEN) as usize
    }

    #[inline]
    pub(crate) fn value_len(&self) -> usize {
        self.read_u32(field::VALUE_LEN) as usize
    }

    #[inline]
    pub(crate) fn set_value_len(&self, len: usize) {
        self.write_u32(field::VALUE_LEN, len as u32);
    }

    /// # Safety
    /// The record must be present and not concurrently rewritten.
    #[inline]
    pub(crate) unsafe fn key(&self) -> &[u8] {
        core::slice::from_raw_parts(self.at(RECORD_HEADER_SIZE), self.key_len())
    }

    /// Compares the stored hash first and the key bytes only on a hash match.
    #[inline]
    pub(crate) fn matches(&self, hash: u64, key: &[u8]) -> bool {
        // SAFETY: only called on chained records while the lock is held.
        self.key_hash() == hash && self.key_len() == key.len() && unsafe { self.key() == key }
    }

    #[inline]
    pub(crate) fn value_ptr(&self, alignment: Alignment) -> NonNull<u8> {
        // SAFETY: stays inside the record's slot run.
        unsafe { NonNull::new_unchecked(self.at(value_offset(self.key_len(), alignment))) }
    }

    /// Writes a complete record and marks it present. `next` is the chain
    /// link at the time of insertion.
    ///
    /// # Safety
    /// The record's slot run must be at least
    /// `record_len(key.len(), value.len(), alignment)` bytes and exclusively
    /// owned by the caller (segment lock held, bits just claimed).
    pub(crate) unsafe fn write(
        &self,
        chunks: u16,
        next: Option<u32>,
        hash: u64,
        key: &[u8],
        value: &[u8],
        alignment: Alignment,
    ) {
        *self.at(1) = 0;
        self.write_u16(field::CHUNKS, chunks);
        self.set_next(next);
        self.write_u64(field::KEY_HASH, hash);
        self.write_u32(field::KEY_LEN, key.len() as u32);
        self.write_u32(field::VALUE_LEN, value.len() as u32);
        ptr::copy_nonoverlapping(key.as_ptr(), self.at(RECORD_HEADER_SIZE), key.len());
        let value_at = value_offset(key.len(), alignment);
        let key_end = RECORD_HEADER_SIZE + key.len();
        ptr::write_bytes(self.at(key_end), 0, value_at - key_end);
        ptr::copy_nonoverlapping(value.as_ptr(), self.at(value_at), value.len());
        *self.at(field::PRESENT) = 1;
    }

    /// Overwrites the value of a present record in place.
    ///
    /// # Safety
    /// The record's slot run must fit the new value, and the caller must
    /// hold the segment lock.
    pub(crate) unsafe fn overwrite_value(&self, value: &[u8], alignment: Alignment) {
        let value_at = value_offset(self.key_len(), alignment);
        ptr::copy_nonoverlapping(value.as_ptr(), self.at(value_at), value.len());
        self.set_value_len(value.len());
    }

    /// Marks the record absent.
    #[inline]
    pub(crate) fn clear(&self) {
        unsafe { *self.at(field::PRESENT) = 0 };
        self.set_next(None);
    }
}
