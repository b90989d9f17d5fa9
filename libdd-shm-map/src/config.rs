// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Creation parameters for a [`ShmMap`](crate::ShmMap).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_ENTRIES: &str = "DD_SHM_MAP_ENTRIES";
pub const ENV_SEGMENTS: &str = "DD_SHM_MAP_SEGMENTS";
pub const ENV_ENTRY_SIZE: &str = "DD_SHM_MAP_ENTRY_SIZE";
pub const ENV_ALIGNMENT: &str = "DD_SHM_MAP_ALIGNMENT";
pub const ENV_PATH: &str = "DD_SHM_MAP_PATH";

/// Alignment of slots and value payloads inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum Alignment {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl Alignment {
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Rounds `value` up to the next multiple of this alignment.
    #[inline]
    pub const fn round_up(self, value: u64) -> Option<u64> {
        let mask = self as u64 - 1;
        match value.checked_add(mask) {
            Some(v) => Some(v & !mask),
            None => None,
        }
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment::Eight
    }
}

impl TryFrom<u32> for Alignment {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Alignment::One),
            2 => Ok(Alignment::Two),
            4 => Ok(Alignment::Four),
            8 => Ok(Alignment::Eight),
            other => Err(ConfigError::UnsupportedAlignment(other)),
        }
    }
}

impl From<Alignment> for u32 {
    fn from(alignment: Alignment) -> u32 {
        alignment as u32
    }
}

/// Parameters a map is created with. They are recorded in the region header,
/// so every process attaching to the same file sees the same layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Total number of entries the map must be able to hold.
    pub requested_entries: u64,
    /// Number of independently locked segments. Must be a power of two.
    pub segment_count: u32,
    /// Expected key + value size in bytes. Larger entries span several slots.
    pub average_entry_size: u32,
    pub alignment: Alignment,
    /// File backing the region. `None` maps anonymous shared memory, which
    /// is only visible to this process and its forked children.
    pub backing_path: Option<PathBuf>,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            requested_entries: 1024,
            segment_count: 16,
            average_entry_size: 64,
            alignment: Alignment::default(),
            backing_path: None,
        }
    }
}

impl MapConfig {
    pub fn new(requested_entries: u64) -> Self {
        MapConfig {
            requested_entries,
            ..Default::default()
        }
    }

    pub fn with_entries(mut self, requested_entries: u64) -> Self {
        self.requested_entries = requested_entries;
        self
    }

    pub fn with_segments(mut self, segment_count: u32) -> Self {
        self.segment_count = segment_count;
        self
    }

    pub fn with_entry_size(mut self, average_entry_size: u32) -> Self {
        self.average_entry_size = average_entry_size;
        self
    }

    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn persisted_to(mut self, path: impl AsRef<Path>) -> Self {
        self.backing_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Defaults overridden by the `DD_SHM_MAP_*` environment variables.
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = MapConfig::default();
        if let Some(entries) = parse_env::int(ENV_ENTRIES) {
            config.requested_entries = entries;
        }
        if let Some(segments) = parse_env::int(ENV_SEGMENTS) {
            config.segment_count = segments;
        }
        if let Some(size) = parse_env::int(ENV_ENTRY_SIZE) {
            config.average_entry_size = size;
        }
        if let Some(alignment) =
            parse_env::int::<u32>(ENV_ALIGNMENT).and_then(|a| Alignment::try_from(a).ok())
        {
            config.alignment = alignment;
        }
        if let Some(path) = parse_env::str_not_empty(ENV_PATH) {
            config.backing_path = Some(PathBuf::from(path));
        }
        config
    }

    /// Checks the parameters that do not depend on layout arithmetic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requested_entries == 0 {
            return Err(ConfigError::ZeroEntries);
        }
        if !self.segment_count.is_power_of_two() {
            return Err(ConfigError::InvalidSegmentCount(self.segment_count));
        }
        if self.average_entry_size == 0 {
            return Err(ConfigError::ZeroEntrySize);
        }
        Ok(())
    }
}

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.trim().parse::<T>().ok()
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn alignment_round_up() {
        assert_eq!(Alignment::One.round_up(13), Some(13));
        assert_eq!(Alignment::Four.round_up(13), Some(16));
        assert_eq!(Alignment::Eight.round_up(16), Some(16));
        assert_eq!(Alignment::Eight.round_up(u64::MAX), None);
    }

    #[test]
    fn alignment_from_u32() {
        assert_eq!(Alignment::try_from(2), Ok(Alignment::Two));
        assert_eq!(
            Alignment::try_from(3),
            Err(ConfigError::UnsupportedAlignment(3))
        );
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        assert_eq!(
            MapConfig::new(0).validate(),
            Err(ConfigError::ZeroEntries)
        );
        assert_eq!(
            MapConfig::new(10).with_segments(6).validate(),
            Err(ConfigError::InvalidSegmentCount(6))
        );
        assert_eq!(
            MapConfig::new(10).with_segments(0).validate(),
            Err(ConfigError::InvalidSegmentCount(0))
        );
        assert_eq!(
            MapConfig::new(10).with_entry_size(0).validate(),
            Err(ConfigError::ZeroEntrySize)
        );
        assert!(MapConfig::new(10).validate().is_ok());
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: MapConfig =
            serde_json::from_str(r#"{"requested_entries": 5000, "alignment": 4}"#).unwrap();
        assert_eq!(config.requested_entries, 5000);
        assert_eq!(config.alignment, Alignment::Four);
        assert_eq!(config.segment_count, 16);
        assert_eq!(config.backing_path, None);
    }

    #[test]
    fn deserialize_rejects_unsupported_alignment() {
        let result = serde_json::from_str::<MapConfig>(r#"{"alignment": 16}"#);
        assert!(result.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = MapConfig::new(100)
            .with_segments(4)
            .with_entry_size(32)
            .with_alignment(Alignment::Two)
            .persisted_to("/tmp/map");
        assert_eq!(config.segment_count, 4);
        assert_eq!(config.average_entry_size, 32);
        assert_eq!(config.alignment, Alignment::Two);
        assert_eq!(config.backing_path, Some(PathBuf::from("/tmp/map")));
    }

    #[test]
    fn from_env_overrides_defaults() {
        env::set_var(ENV_ENTRIES, "4096");
        env::set_var(ENV_SEGMENTS, "not a number");
        env::set_var(ENV_ALIGNMENT, "4");
        let config = MapConfig::from_env();
        env::remove_var(ENV_ENTRIES);
        env::remove_var(ENV_SEGMENTS);
        env::remove_var(ENV_ALIGNMENT);

        assert_eq!(config.requested_entries, 4096);
        assert_eq!(config.segment_count, MapConfig::default().segment_count);
        assert_eq!(config.alignment, Alignment::Four);
    }
}
