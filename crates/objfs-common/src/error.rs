//! Error types for objfs
//!
//! Every public storage operation returns [`Result`]. Failures propagate
//! immediately; the engine never retries on its own.

use crate::types::{BlockNo, MAX_KEY_LEN, ObjectKeyError, Resource};
use thiserror::Error;

/// Common result type for objfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for objfs
#[derive(Debug, Error)]
pub enum Error {
    // Allocation errors
    #[error("no free {0} available")]
    Full(Resource),

    // Namespace errors
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Duplicate(String),

    #[error("object key is {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    // Device errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("device error on block {block}: {reason}")]
    Device { block: u64, reason: String },

    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("metadata corruption: {0}")]
    Corrupted(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a device error for the given block
    pub fn device(block: impl Into<u64>, reason: impl Into<String>) -> Self {
        Self::Device {
            block: block.into(),
            reason: reason.into(),
        }
    }

    /// Create a metadata corruption error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Error for a block number outside the addressable range
    pub fn bad_block(block: BlockNo, limit: u64) -> Self {
        Self::invalid_argument(format!("block {block} outside addressable range 1..{limit}"))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an allocator exhaustion error
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Check if the failure came from the device
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::DiskIo(_) | Self::Device { .. })
    }

    /// POSIX errno for a filesystem-protocol front end
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Full(_) => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Duplicate(_) => libc::EEXIST,
            Self::KeyTooLong { .. } => libc::ENAMETOOLONG,
            Self::DiskIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. } | Self::Corrupted(_) => libc::EIO,
            Self::InvalidArgument(_) | Self::Configuration(_) => libc::EINVAL,
        }
    }
}

impl From<ObjectKeyError> for Error {
    fn from(err: ObjectKeyError) -> Self {
        match err {
            ObjectKeyError::TooLong { len } => Self::KeyTooLong {
                len,
                max: MAX_KEY_LEN,
            },
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::Full(Resource::Block).errno(), libc::ENOSPC);
        assert_eq!(Error::NotFound("k".into()).errno(), libc::ENOENT);
        assert_eq!(Error::Duplicate("k".into()).errno(), libc::EEXIST);
        assert_eq!(Error::device(7u32, "short read").errno(), libc::EIO);
        assert_eq!(Error::invalid_argument("x").errno(), libc::EINVAL);
    }

    #[test]
    fn test_key_error_conversion() {
        let err: Error = ObjectKeyError::TooLong { len: 40 }.into();
        assert!(matches!(err, Error::KeyTooLong { len: 40, max: 32 }));
        assert_eq!(err.errno(), libc::ENAMETOOLONG);

        let err: Error = ObjectKeyError::Empty.into();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::NotFound("k".into()).is_not_found());
        assert!(Error::Full(Resource::ObjectSlot).is_full());
        assert!(Error::device(1u32, "boom").is_io());
        assert!(!Error::Duplicate("k".into()).is_io());
    }
}
