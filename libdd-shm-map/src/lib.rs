// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity, segmented key-value map in a shared memory region.
//!
//! - [`ShmMap`]: owns a `MAP_SHARED` mapping, either of a file (shared by
//!   every process that opens it, and persistent) or anonymous (shared with
//!   forked children). Keys and values are byte strings.
//! - The keyspace is split into a power-of-two number of [`Segment`]s, each
//!   with its own hash directory, free-slot bitset and cross-process lock.
//! - Capacity is planned once at creation by [`LayoutPlan`] with headroom
//!   for hash skew across segments. Nothing ever grows: when a segment runs
//!   out of slots the insert fails with [`ShmMapError::Full`].
//! - [`ValueRef`] points straight at a value in the mapping; writes through
//!   it are visible to every attached process.
//!
//! Routing is `segment = hash & (segments - 1)` on the hash from
//! [`hash_key`], which is stable across processes and builds.
//!
//! A process that dies while holding a segment lock leaves that segment
//! locked. [`ShmMap::stale_locks`] reports such segments.

pub mod config;
mod error;
mod free_list;
mod hash;
mod header;
pub mod layout;
mod lock;
mod map;
mod record;
mod region;
mod segment;
mod value_ref;

pub use config::{Alignment, MapConfig};
pub use error::{ConfigError, ShmMapError};
pub use hash::{hash_key, segment_index};
pub use header::{MAGIC, REGION_HEADER_SIZE, VERSION};
pub use layout::LayoutPlan;
pub use lock::{SegmentGuard, SegmentLock, STALE_CHECK_AFTER};
pub use map::ShmMap;
pub use record::RECORD_HEADER_SIZE;
pub use region::MappedRegion;
pub use segment::{Inserted, LockedSegment, Segment, SegmentStats, SlotIndex};
pub use value_ref::ValueRef;
