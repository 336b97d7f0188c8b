//! Core type definitions for objfs
//!
//! Identifiers, keys and the small value types that cross the boundary
//! between the storage engine and the host dispatcher.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical block number on the device. Zero means "unset".
pub type BlockNo = u32;

/// Maximum object key length in bytes
pub const MAX_KEY_LEN: usize = 32;

/// Identifier of a stored object
///
/// Ids 0 and 1 are reserved; the first usable id is [`ObjectId::FIRST`].
/// The object table slot of an id is `id - 2`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct ObjectId(u32);

impl ObjectId {
    /// Lowest id handed out to objects
    pub const FIRST: u32 = 2;

    /// Wrap a raw id without checking the reserved range
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Build the id that owns the given table slot
    #[must_use]
    pub fn from_slot(slot: usize) -> Option<Self> {
        u32::try_from(slot)
            .ok()
            .and_then(|s| s.checked_add(Self::FIRST))
            .map(Self)
    }

    /// Raw numeric id
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// True for ids 0 and 1
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::FIRST
    }

    /// Object table slot, or `None` for reserved ids
    #[must_use]
    pub const fn slot(self) -> Option<usize> {
        if self.is_reserved() {
            None
        } else {
            Some((self.0 - Self::FIRST) as usize)
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Object key (flat namespace, at most [`MAX_KEY_LEN`] bytes)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Create a new object key
    pub fn new(key: impl Into<String>) -> Result<Self, ObjectKeyError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Get the object key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the object key as raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    fn validate(key: &str) -> Result<(), ObjectKeyError> {
        if key.is_empty() {
            return Err(ObjectKeyError::Empty);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ObjectKeyError::TooLong { len: key.len() });
        }
        if key.contains('\0') {
            return Err(ObjectKeyError::InteriorNul);
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({:?})", self.0)
    }
}

impl TryFrom<&str> for ObjectKey {
    type Error = ObjectKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Errors that can occur when creating an object key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key is {len} bytes, limit is {MAX_KEY_LEN}")]
    TooLong { len: usize },
    #[error("object key cannot contain NUL bytes")]
    InteriorNul,
}

/// Kind of resource an allocator ran out of
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Resource {
    #[display("object slot")]
    ObjectSlot,
    #[display("data block")]
    Block,
}

/// Attributes reported for an object, the subset of `struct stat` the
/// storage engine is responsible for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    /// Object id (`st_ino`)
    pub id: ObjectId,
    /// Accumulated bytes written (`st_size`)
    pub size: u64,
    /// Number of 512-byte units covering `size` (`st_blocks`)
    pub blocks: u64,
}

impl ObjectStat {
    /// Unit used for `st_blocks` regardless of the storage block size
    pub const STAT_BLOCK_SIZE: u64 = 512;

    #[must_use]
    pub const fn new(id: ObjectId, size: u64) -> Self {
        Self {
            id,
            size,
            blocks: size.div_ceil(Self::STAT_BLOCK_SIZE),
        }
    }
}
