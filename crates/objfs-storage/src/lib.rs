//! objfs Storage Engine - keyed objects on a raw block device
//!
//! This crate implements the storage engine for objfs including:
//! - Block devices (image files, raw disks, in-memory)
//! - Fixed metadata layout (object bitmap, block bitmap, object table)
//! - First-fit bitmap allocation of object ids and data blocks
//! - Direct/indirect block mapping with copy-on-write data blocks
//! - Slot-indexed write-back block cache
//! - Object lifecycle operations and bulk mount/unmount

pub mod bitmap;
pub mod cache;
pub mod device;
pub mod layout;
pub mod mapping;
pub mod store;

// Re-exports
pub use bitmap::{Allocator, AllocatorStats, Bitmap};
pub use cache::{BlockCache, CacheStats};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use layout::{
    BLOCK_SIZE, DIRECT_BLOCKS, ENTRIES_PER_INDIRECT, INDIRECT_BLOCKS, IndirectBlock, Layout,
    MAX_LOGICAL_BLOCKS, MAX_OBJECT_SIZE, ObjectRecord, RECORD_SIZE, Region,
};
pub use mapping::{BlockAddr, BlockMapper, Remap};
pub use store::{ObjectStore, StoreStats};
