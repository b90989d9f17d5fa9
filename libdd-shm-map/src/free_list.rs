// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Free-slot bitset of a segment: one bit per data slot, `1 = free`. Bits
//! past the slot count are always 0 so that word scans never return them.
//!
//! Only touched while the segment lock is held.

use core::ptr::NonNull;

pub(crate) struct FreeList {
    words: NonNull<u64>,
    slots: u64,
}

impl FreeList {
    /// # Safety
    /// `words` must be 8-byte aligned and point to `ceil(slots / 64)` words
    /// inside a live mapping, and the caller must hold the segment lock for
    /// as long as the view is used.
    #[inline]
    pub(crate) unsafe fn new(words: NonNull<u64>, slots: u64) -> Self {
        FreeList { words, slots }
    }

    #[inline]
    fn word_count(&self) -> u64 {
        self.slots.div_ceil(64)
    }

    #[inline]
    fn word(&self, index: u64) -> u64 {
        unsafe { *self.words.as_ptr().add(index as usize) }
    }

    #[inline]
    fn set_word(&self, index: u64, value: u64) {
        unsafe { *self.words.as_ptr().add(index as usize) = value }
    }

    /// Marks every slot free.
    pub(crate) fn reset(&self) {
        let words = self.word_count();
        for w in 0..words {
            self.set_word(w, u64::MAX);
        }
        let tail = self.slots % 64;
        if tail != 0 {
            self.set_word(words - 1, (1u64 << tail) - 1);
        }
    }

    #[inline]
    pub(crate) fn is_free(&self, slot: u64) -> bool {
        self.word(slot / 64) & (1u64 << (slot % 64)) != 0
    }

    pub(crate) fn mark_used(&self, start: u64, len: u64) {
        for slot in start..start + len {
            let w = slot / 64;
            self.set_word(w, self.word(w) & !(1u64 << (slot % 64)));
        }
    }

    pub(crate) fn mark_free(&self, start: u64, len: u64) {
        for slot in start..start + len {
            let w = slot / 64;
            self.set_word(w, self.word(w) | (1u64 << (slot % 64)));
        }
    }

    pub(crate) fn count_free(&self) -> u64 {
        (0..self.word_count())
            .map(|w| self.word(w).count_ones() as u64)
            .sum()
    }

    /// Finds `len` consecutive free slots, scanning forward from `hint` and
    /// wrapping around once. Runs never wrap past the last slot.
    pub(crate) fn find_run(&self, hint: u64, len: u64) -> Option<u64> {
        if len == 0 || len > self.slots {
            return None;
        }
        let hint = if hint >= self.slots { 0 } else { hint };
        if len == 1 {
            return self.find_one(hint);
        }
        self.find_run_in(hint, self.slots, len).or_else(|| {
            let end = (hint + len - 1).min(self.slots);
            self.find_run_in(0, end, len)
        })
    }

    fn find_one(&self, hint: u64) -> Option<u64> {
        let words = self.word_count();
        let start_word = hint / 64;
        let start_bit = hint % 64;
        for step in 0..=words {
            let w = (start_word + step) % words;
            let mut bits = self.word(w);
            if step == 0 {
                bits &= u64::MAX << start_bit;
            } else if step == words {
                // Back at the first word: only the bits before the hint remain.
                bits &= (1u64 << start_bit) - 1;
            }
            if bits != 0 {
                return Some(w * 64 + bits.trailing_zeros() as u64);
            }
        }
        None
    }

    fn find_run_in(&self, from: u64, to: u64, len: u64) -> Option<u64> {
        let mut run_start = from;
        let mut run = 0;
        let mut slot = from;
        while slot < to {
            if slot % 64 == 0 && slot + 64 <= to && self.word(slot / 64) == 0 {
                run = 0;
                slot += 64;
                continue;
            }
            if self.is_free(slot) {
                if run == 0 {
                    run_start = slot;
                }
                run += 1;
                if run == len {
                    return Some(run_start);
                }
            } else {
                run = 0;
            }
            slot += 1;
        }
        None
    }
}
