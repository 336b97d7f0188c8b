//! Configuration types for objfs
//!
//! Region sizes of the on-device layout and the shape of the block cache.
//! Every field has a default so a partial JSON document is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Root configuration for an object store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// On-device metadata layout
    pub layout: LayoutConfig,
    /// Block cache configuration
    pub cache: CacheConfig,
}

impl Config {
    /// Check every section for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        self.cache.validate()
    }
}

/// Sizes, in blocks, of the fixed metadata regions at the start of the device
///
/// The regions are laid out back to back starting at block 0: object bitmap,
/// block bitmap, object table. Everything after them is data space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Blocks reserved for the object bitmap
    pub object_bitmap_blocks: u32,
    /// Blocks reserved for the block bitmap
    pub block_bitmap_blocks: u32,
    /// Blocks reserved for the packed object table
    pub object_table_blocks: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            object_bitmap_blocks: 31,
            block_bitmap_blocks: 256,
            object_table_blocks: 20_000,
        }
    }
}

impl LayoutConfig {
    /// Total number of metadata blocks
    #[must_use]
    pub const fn metadata_blocks(&self) -> u64 {
        self.object_bitmap_blocks as u64
            + self.block_bitmap_blocks as u64
            + self.object_table_blocks as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.object_bitmap_blocks == 0 {
            return Err(Error::configuration("object bitmap region cannot be empty"));
        }
        if self.block_bitmap_blocks == 0 {
            return Err(Error::configuration("block bitmap region cannot be empty"));
        }
        if self.object_table_blocks == 0 {
            return Err(Error::configuration("object table region cannot be empty"));
        }
        Ok(())
    }
}

/// How block I/O is mediated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Writes land in the slot cache and reach the device on eviction or flush
    #[default]
    WriteBack,
    /// Every read and write goes straight to the device
    Direct,
}

/// Block cache configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of cache slots; a block lives in slot `block % slots`
    pub slots: usize,
    /// Cached or direct I/O
    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slots: 32_704,
            policy: CachePolicy::WriteBack,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.policy == CachePolicy::WriteBack && self.slots == 0 {
            return Err(Error::configuration(
                "write-back cache needs at least one slot",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.layout.object_bitmap_blocks, 31);
        assert_eq!(config.layout.block_bitmap_blocks, 256);
        assert_eq!(config.layout.object_table_blocks, 20_000);
        assert_eq!(config.layout.metadata_blocks(), 20_287);
        assert_eq!(config.cache.slots, 32_704);
        assert_eq!(config.cache.policy, CachePolicy::WriteBack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"cache": {"slots": 8, "policy": "direct"}}"#).unwrap();
        assert_eq!(config.cache.slots, 8);
        assert_eq!(config.cache.policy, CachePolicy::Direct);
        assert_eq!(config.layout, LayoutConfig::default());
    }

    #[test]
    fn test_validate_rejects_empty_regions() {
        let mut config = Config::default();
        config.layout.object_table_blocks = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = Config::default();
        config.cache.slots = 0;
        assert!(config.validate().is_err());
        config.cache.policy = CachePolicy::Direct;
        assert!(config.validate().is_ok());
    }
}
