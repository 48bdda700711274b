//! String-keyed settings exchanged with the producer

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const FRAMERATE: &str = "framerate";
pub const CHANNEL: &str = "channel";
pub const BUFFER_COUNT: &str = "buffer.count";
pub const BUFFER_STRATEGY: &str = "buffer.strategy";
pub const CROP_X: &str = "crop.x";
pub const CROP_Y: &str = "crop.y";
pub const CROP_WIDTH: &str = "crop.width";
pub const CROP_HEIGHT: &str = "crop.height";
pub const SIMD_ALIGN: &str = "simd.align";
pub const SUBFORMAT: &str = "subformat";
pub const FORMAT: &str = "format";
pub const TIMESTAMP_TYPE: &str = "timestamp.type";
pub const PITCH: &str = "pitch";

/// `format` value for planar YUV streams
pub const FORMAT_YUV: u32 = 3;
/// `buffer.strategy` value letting the consumer hold buffers indefinitely
pub const BUFFER_STRATEGY_INFINITE: u32 = 4;
/// `timestamp.type` value for the producer's monotonic clock
pub const TIMESTAMP_MONO_SERVER: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    U32(u32),
    Str(String),
}

/// Typed key/value map with defaults on read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsMap {
    entries: BTreeMap<String, SettingValue>,
}

impl SettingsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_u32(&mut self, key: &str, value: u32) {
        self.entries.insert(key.to_owned(), SettingValue::U32(value));
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_owned(), SettingValue::Str(value.into()));
    }

    /// Integer value of `key`, or `default` when absent or not an integer
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        match self.entries.get(key) {
            Some(SettingValue::U32(value)) => *value,
            _ => default,
        }
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.entries.get(key) {
            Some(SettingValue::Str(value)) => value,
            _ => default,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Copy every entry of `other` over this map
    pub fn merge(&mut self, other: &SettingsMap) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
