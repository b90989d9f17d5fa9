// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use libdd_shm_map::{Alignment, MapConfig, ShmMap, ShmMapError};

/// Anonymous map with 32-byte entries, 4-byte aligned.
pub fn config(segments: u32, entries: u64) -> MapConfig {
    MapConfig::new(entries)
        .with_segments(segments)
        .with_entry_size(32)
        .with_alignment(Alignment::Four)
}

pub fn key(i: u64) -> String {
    format!("key:{i}")
}

/// Inserts `key:0`, `key:1`, ... until the first `Full`. Returns how many
/// entries were accepted, which is also the index of the refused key.
pub fn fill_until_full(map: &ShmMap) -> u64 {
    for i in 0.. {
        match map.acquire_key(key(i).as_bytes(), &i.to_ne_bytes()) {
            Ok(_) => {}
            Err(ShmMapError::Full { .. }) => return i,
            Err(err) => panic!("unexpected error inserting {}: {err}", key(i)),
        }
    }
    unreachable!()
}
