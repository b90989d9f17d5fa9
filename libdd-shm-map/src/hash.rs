// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key hashing and routing.
//!
//! The hash must be identical in every process attached to a region, so
//! Rust's randomized default hasher cannot be used. Keys are hashed with
//! FNV-1a and then run through a 64-bit finalizer so that both the low bits
//! (segment selection) and the high bits (directory bucket) are well mixed.

/// Hashes key bytes deterministically.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    fmix64(h)
}

/// MurmurHash3 64-bit finalizer.
#[inline]
const fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Segment owning `hash`. `segment_count` must be a power of two.
#[inline]
pub const fn segment_index(hash: u64, segment_count: u32) -> u32 {
    (hash & (segment_count as u64 - 1)) as u32
}

/// Directory bucket for `hash`. Uses the high half so it is independent of
/// the segment bits. `bucket_count` must be a power of two.
#[inline]
pub(crate) const fn bucket_index(hash: u64, bucket_count: u64) -> u64 {
    (hash >> 32) & (bucket_count - 1)
}
