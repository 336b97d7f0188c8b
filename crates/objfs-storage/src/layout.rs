//! Disk layout definitions
//!
//! Disk Layout:
//! ```text
//! +------------------+  Block 0
//! |  Object Bitmap   |  1 bit per object table slot
//! +------------------+
//! |  Block Bitmap    |  1 bit per device block
//! +------------------+
//! |  Object Table    |  Packed 96-byte object records
//! +------------------+
//! |   Data Region    |  Direct, indirect and data blocks
//! +------------------+
//! ```
//!
//! Block 0 is always metadata, so block number 0 doubles as "unset" in
//! object mappings and as "empty" in cache slots.

use bytes::{Buf, BufMut, BytesMut};
use objfs_common::{BlockNo, Error, LayoutConfig, MAX_KEY_LEN, ObjectId, Result};

/// Block size in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Direct block pointers per object
pub const DIRECT_BLOCKS: usize = 4;

/// Indirection block pointers per object
pub const INDIRECT_BLOCKS: usize = 4;

/// Block numbers held by one indirection block
pub const ENTRIES_PER_INDIRECT: usize = BLOCK_SIZE / size_of::<BlockNo>();

/// Logical blocks addressable by one object
pub const MAX_LOGICAL_BLOCKS: u64 = (DIRECT_BLOCKS + INDIRECT_BLOCKS * ENTRIES_PER_INDIRECT) as u64;

/// Largest object size in bytes
pub const MAX_OBJECT_SIZE: u64 = MAX_LOGICAL_BLOCKS * BLOCK_SIZE as u64;

/// Size of one packed object record
pub const RECORD_SIZE: usize = 96;

const BITS_PER_BLOCK: u64 = BLOCK_SIZE as u64 * 8;

/// A contiguous run of metadata blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// First block of the region
    pub start: u64,
    /// Number of blocks in the region
    pub blocks: u64,
}

impl Region {
    #[must_use]
    pub const fn new(start: u64, blocks: u64) -> Self {
        Self { start, blocks }
    }

    /// First block after the region
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.blocks
    }

    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.blocks as usize * BLOCK_SIZE
    }
}

/// Resolved layout of a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub object_bitmap: Region,
    pub block_bitmap: Region,
    pub object_table: Region,
    /// Blocks reported by the device
    pub device_blocks: u64,
    /// Blocks the block bitmap can track (never more than the device holds)
    pub addressable_blocks: u64,
    /// Object slots covered by both the object bitmap and the object table
    pub object_capacity: usize,
}

impl Layout {
    /// Compute the layout for a device of `device_blocks` blocks
    pub fn new(config: &LayoutConfig, device_blocks: u64) -> Result<Self> {
        config.validate()?;

        let object_bitmap = Region::new(0, u64::from(config.object_bitmap_blocks));
        let block_bitmap = Region::new(object_bitmap.end(), u64::from(config.block_bitmap_blocks));
        let object_table = Region::new(block_bitmap.end(), u64::from(config.object_table_blocks));

        // Block numbers are stored as u32 in records and indirection blocks
        let addressable_blocks = (block_bitmap.blocks * BITS_PER_BLOCK)
            .min(device_blocks)
            .min(u64::from(BlockNo::MAX));

        if addressable_blocks <= object_table.end() {
            return Err(Error::configuration(format!(
                "device has {device_blocks} blocks, metadata needs {} plus data space",
                object_table.end()
            )));
        }

        let bitmap_bits = object_bitmap.blocks * BITS_PER_BLOCK;
        let table_slots = object_table.byte_len() as u64 / RECORD_SIZE as u64;
        let id_limit = u64::from(u32::MAX - ObjectId::FIRST);
        let object_capacity = usize::try_from(bitmap_bits.min(table_slots).min(id_limit))
            .map_err(|_| Error::configuration("object table too large for this platform"))?;

        Ok(Self {
            object_bitmap,
            block_bitmap,
            object_table,
            device_blocks,
            addressable_blocks,
            object_capacity,
        })
    }

    /// First block of the data region
    #[must_use]
    pub const fn data_start(&self) -> u64 {
        self.object_table.end()
    }

    /// Number of allocatable data blocks
    #[must_use]
    pub const fn data_blocks(&self) -> u64 {
        self.addressable_blocks - self.data_start()
    }
}

/// In-memory form of one object table slot
///
/// Wire format (little-endian):
/// ```text
/// 0   id        u32
/// 4   size      u64
/// 12  direct    [u32; 4]
/// 28  indirect  [u32; 4]
/// 44  key_len   u8
/// 45  key       [u8; 32]
/// 77  reserved  15 bytes
/// 92  crc32c    u32 over bytes 0..92
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Id stored in the slot; 0 if the slot was never used
    pub id: u32,
    /// Accumulated bytes written
    pub size: u64,
    pub direct: [BlockNo; DIRECT_BLOCKS],
    pub indirect: [BlockNo; INDIRECT_BLOCKS],
    pub key: String,
}

impl ObjectRecord {
    const CHECKSUM_OFFSET: usize = RECORD_SIZE - 4;
    const RESERVED: usize = Self::CHECKSUM_OFFSET - (4 + 8 + 16 + 16 + 1 + MAX_KEY_LEN);

    /// Fresh record for a newly created object
    #[must_use]
    pub fn new(id: ObjectId, key: &str) -> Self {
        Self {
            id: id.get(),
            key: key.to_owned(),
            ..Self::default()
        }
    }

    /// True if any direct or indirect pointer is set
    #[must_use]
    pub fn has_blocks(&self) -> bool {
        self.direct.iter().chain(&self.indirect).any(|&b| b != 0)
    }

    /// Serialize to `RECORD_SIZE` bytes
    pub fn encode(&self, out: &mut [u8]) {
        let mut buf = BytesMut::with_capacity(RECORD_SIZE);
        buf.put_u32_le(self.id);
        buf.put_u64_le(self.size);
        for &b in &self.direct {
            buf.put_u32_le(b);
        }
        for &b in &self.indirect {
            buf.put_u32_le(b);
        }

        let key = self.key.as_bytes();
        let key_len = key.len().min(MAX_KEY_LEN);
        buf.put_u8(u8::try_from(key_len).unwrap_or(u8::MAX));
        buf.put_slice(&key[..key_len]);
        buf.put_bytes(0, MAX_KEY_LEN - key_len);
        buf.put_bytes(0, Self::RESERVED);

        let checksum = crc32c::crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf.put_u32_le(checksum);

        out[..RECORD_SIZE].copy_from_slice(&buf);
    }

    /// Parse and verify a record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(Error::corrupted("object record too small"));
        }

        let stored = u32::from_le_bytes([
            data[Self::CHECKSUM_OFFSET],
            data[Self::CHECKSUM_OFFSET + 1],
            data[Self::CHECKSUM_OFFSET + 2],
            data[Self::CHECKSUM_OFFSET + 3],
        ]);
        if crc32c::crc32c(&data[..Self::CHECKSUM_OFFSET]) != stored {
            return Err(Error::corrupted("object record checksum mismatch"));
        }

        let mut buf = &data[..Self::CHECKSUM_OFFSET];
        let id = buf.get_u32_le();
        let size = buf.get_u64_le();
        let mut direct = [0; DIRECT_BLOCKS];
        for b in &mut direct {
            *b = buf.get_u32_le();
        }
        let mut indirect = [0; INDIRECT_BLOCKS];
        for b in &mut indirect {
            *b = buf.get_u32_le();
        }

        let key_len = usize::from(buf.get_u8());
        if key_len > MAX_KEY_LEN {
            return Err(Error::corrupted(format!("object {id} key length {key_len}")));
        }
        let key = std::str::from_utf8(&buf[..key_len])
            .map_err(|_| Error::corrupted(format!("object {id} key is not UTF-8")))?
            .to_owned();

        Ok(Self {
            id,
            size,
            direct,
            indirect,
            key,
        })
    }
}

/// Contents of an indirection block: `ENTRIES_PER_INDIRECT` block numbers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectBlock {
    entries: Vec<BlockNo>,
}

impl Default for IndirectBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl IndirectBlock {
    /// Zero-initialized table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![0; ENTRIES_PER_INDIRECT],
        }
    }

    /// Parse a block read from the device
    #[must_use]
    pub fn from_bytes(mut data: &[u8]) -> Self {
        let mut entries = vec![0; ENTRIES_PER_INDIRECT];
        for e in &mut entries {
            if data.remaining() < 4 {
                break;
            }
            *e = data.get_u32_le();
        }
        Self { entries }
    }

    /// Serialize to a full block
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLOCK_SIZE);
        for &e in &self.entries {
            buf.put_u32_le(e);
        }
        buf.to_vec()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> BlockNo {
        self.entries.get(position).copied().unwrap_or(0)
    }

    /// Store `block` at `position`, returning the previous entry
    pub fn set(&mut self, position: usize, block: BlockNo) -> BlockNo {
        std::mem::replace(&mut self.entries[position], block)
    }

    /// Non-zero entries
    pub fn mapped(&self) -> impl Iterator<Item = BlockNo> + '_ {
        self.entries.iter().copied().filter(|&b| b != 0)
    }
}
