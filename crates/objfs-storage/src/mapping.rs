//! Block mapping for objects
//!
//! Translates an object-relative logical block index into a physical block.
//!
//! ```text
//! logical 0..4        → direct[logical]
//! logical 4..4100     → indirect[(logical-4) / 1024] → entry (logical-4) % 1024
//! ```
//!
//! Writes never overwrite a data block in place: every write maps the
//! logical block to a freshly allocated physical block and hands back the
//! block it replaced. Indirection blocks are created on first use and never
//! resized or compacted.

use crate::bitmap::Allocator;
use crate::cache::BlockCache;
use crate::device::BlockDevice;
use crate::layout::{
    BLOCK_SIZE, DIRECT_BLOCKS, ENTRIES_PER_INDIRECT, IndirectBlock, MAX_LOGICAL_BLOCKS,
    ObjectRecord,
};
use objfs_common::{BlockNo, Error, Result};
use tracing::debug;

/// Where a logical block's physical address is recorded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockAddr {
    /// `direct[index]`
    Direct(usize),
    /// Entry `position` of the indirection block `indirect[slot]`
    Indirect { slot: usize, position: usize },
}

impl BlockAddr {
    /// Address of logical block `logical`
    pub fn of(logical: u64) -> Result<Self> {
        if logical >= MAX_LOGICAL_BLOCKS {
            return Err(Error::invalid_argument(format!(
                "logical block {logical} beyond maximum object size"
            )));
        }
        // Bounded by MAX_LOGICAL_BLOCKS above
        let logical = logical as usize;
        if logical < DIRECT_BLOCKS {
            return Ok(Self::Direct(logical));
        }
        let rel = logical - DIRECT_BLOCKS;
        Ok(Self::Indirect {
            slot: rel / ENTRIES_PER_INDIRECT,
            position: rel % ENTRIES_PER_INDIRECT,
        })
    }

    /// Address of the block containing byte `offset`
    pub fn of_offset(offset: u64) -> Result<Self> {
        Self::of(offset / BLOCK_SIZE as u64)
    }
}

/// Result of mapping a logical block for writing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Remap {
    /// Freshly allocated data block now recorded in the mapping
    pub block: BlockNo,
    /// Data block the mapping pointed at before, if any
    pub previous: Option<BlockNo>,
}

/// Resolves and materializes object block mappings
pub struct BlockMapper<'a, D> {
    allocator: &'a Allocator,
    cache: &'a BlockCache<D>,
}

impl<'a, D: BlockDevice> BlockMapper<'a, D> {
    pub const fn new(allocator: &'a Allocator, cache: &'a BlockCache<D>) -> Self {
        Self { allocator, cache }
    }

    fn load_indirect(&self, block: BlockNo) -> Result<IndirectBlock> {
        Ok(IndirectBlock::from_bytes(&self.cache.read_block(block)?))
    }

    /// Physical block of `logical`, or `None` if nothing was ever written there
    pub fn lookup(&self, record: &ObjectRecord, logical: u64) -> Result<Option<BlockNo>> {
        let block = match BlockAddr::of(logical)? {
            BlockAddr::Direct(index) => record.direct[index],
            BlockAddr::Indirect { slot, position } => match record.indirect[slot] {
                0 => 0,
                table => self.load_indirect(table)?.get(position),
            },
        };
        Ok((block != 0).then_some(block))
    }

    /// Point `logical` at a brand-new data block
    ///
    /// On failure the mapping is left as it was and every block claimed by
    /// this call is freed again.
    pub fn remap(&self, record: &mut ObjectRecord, logical: u64) -> Result<Remap> {
        match BlockAddr::of(logical)? {
            BlockAddr::Direct(index) => {
                let block = self.allocator.allocate_block()?;
                let previous = std::mem::replace(&mut record.direct[index], block);
                Ok(Remap {
                    block,
                    previous: (previous != 0).then_some(previous),
                })
            }
            BlockAddr::Indirect { slot, position } if record.indirect[slot] == 0 => {
                let table_block = self.allocator.allocate_block()?;
                let block = self
                    .allocator
                    .allocate_block()
                    .inspect_err(|_| self.allocator.free_block(table_block))?;
                let mut table = IndirectBlock::new();
                table.set(position, block);
                self.cache
                    .write(table_block, &table.to_bytes())
                    .inspect_err(|_| self.allocator.free_blocks(&[block, table_block]))?;
                record.indirect[slot] = table_block;
                debug!(
                    object_id = record.id,
                    slot, table_block, "materialized indirection block"
                );
                Ok(Remap {
                    block,
                    previous: None,
                })
            }
            BlockAddr::Indirect { slot, position } => {
                let table_block = record.indirect[slot];
                let mut table = self.load_indirect(table_block)?;
                let block = self.allocator.allocate_block()?;
                let previous = table.set(position, block);
                self.cache
                    .write(table_block, &table.to_bytes())
                    .inspect_err(|_| self.allocator.free_block(block))?;
                Ok(Remap {
                    block,
                    previous: (previous != 0).then_some(previous),
                })
            }
        }
    }

    /// Every block owned by `record`: data blocks first, then indirection blocks
    pub fn owned_blocks(&self, record: &ObjectRecord) -> Result<Vec<BlockNo>> {
        let mut blocks: Vec<BlockNo> = record.direct.iter().copied().filter(|&b| b != 0).collect();
        for &table_block in record.indirect.iter().filter(|&&b| b != 0) {
            blocks.extend(self.load_indirect(table_block)?.mapped());
            blocks.push(table_block);
        }
        Ok(blocks)
    }

    /// Release every block owned by `record` and clear its mapping
    ///
    /// All indirection blocks are read before anything is freed, so a read
    /// failure leaves both the record and the bitmap untouched.
    pub fn release(&self, record: &mut ObjectRecord) -> Result<usize> {
        let blocks = self.owned_blocks(record)?;
        self.allocator.free_blocks(&blocks);
        for &block in &blocks {
            self.cache.evict(block);
        }
        record.direct = [0; DIRECT_BLOCKS];
        record.indirect = Default::default();
        Ok(blocks.len())
    }

    /// Release a data block superseded by a remap
    ///
    /// Its cached copy is dropped unwritten; nothing maps it any more.
    pub fn retire(&self, block: BlockNo) {
        self.cache.evict(block);
        self.allocator.free_block(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::device::MemDevice;
    use objfs_common::{CacheConfig, CachePolicy, ObjectId, Resource};

    const DEVICE_BLOCKS: u64 = 64;
    const RESERVED: u64 = 4;

    fn setup() -> (Allocator, BlockCache<MemDevice>) {
        let allocator = Allocator::new(Bitmap::new(8), Bitmap::new(DEVICE_BLOCKS as usize));
        allocator.reserve_blocks(RESERVED);
        let cache = BlockCache::new(
            MemDevice::new(DEVICE_BLOCKS),
            &CacheConfig {
                slots: 16,
                policy: CachePolicy::WriteBack,
            },
        );
        (allocator, cache)
    }

    fn record() -> ObjectRecord {
        ObjectRecord::new(ObjectId::new(2), "obj")
    }

    #[test]
    fn test_block_addr() {
        assert_eq!(BlockAddr::of(0).unwrap(), BlockAddr::Direct(0));
        assert_eq!(BlockAddr::of(3).unwrap(), BlockAddr::Direct(3));
        assert_eq!(
            BlockAddr::of(4).unwrap(),
            BlockAddr::Indirect {
                slot: 0,
                position: 0
            }
        );
        assert_eq!(
            BlockAddr::of(1027).unwrap(),
            BlockAddr::Indirect {
                slot: 0,
                position: 1023
            }
        );
        assert_eq!(
            BlockAddr::of(1028).unwrap(),
            BlockAddr::Indirect {
                slot: 1,
                position: 0
            }
        );
        assert_eq!(
            BlockAddr::of(4099).unwrap(),
            BlockAddr::Indirect {
                slot: 3,
                position: 1023
            }
        );
        assert!(BlockAddr::of(4100).is_err());
        assert_eq!(
            BlockAddr::of_offset(16_384).unwrap(),
            BlockAddr::Indirect {
                slot: 0,
                position: 0
            }
        );
    }

    #[test]
    fn test_direct_remap_allocates_fresh_block() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();

        assert_eq!(mapper.lookup(&rec, 0).unwrap(), None);
        let first = mapper.remap(&mut rec, 0).unwrap();
        assert_eq!(first, Remap { block: 4, previous: None });
        assert_eq!(rec.direct[0], 4);

        let second = mapper.remap(&mut rec, 0).unwrap();
        assert_eq!(second, Remap { block: 5, previous: Some(4) });
        assert_eq!(mapper.lookup(&rec, 0).unwrap(), Some(5));
    }

    #[test]
    fn test_indirect_materialization() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();

        // Logical 6 lands at position 2 of the first indirection block
        let remap = mapper.remap(&mut rec, 6).unwrap();
        assert_eq!(rec.indirect[0], 4);
        assert_eq!(remap.block, 5);
        assert_eq!(mapper.lookup(&rec, 6).unwrap(), Some(5));
        assert_eq!(mapper.lookup(&rec, 4).unwrap(), None);

        let table = IndirectBlock::from_bytes(&cache.read_block(4).unwrap());
        assert_eq!(table.get(2), 5);
        assert_eq!(table.get(0), 0);

        // A second block in the same range reuses the table
        let remap = mapper.remap(&mut rec, 4).unwrap();
        assert_eq!(remap, Remap { block: 6, previous: None });
        assert_eq!(rec.indirect[0], 4);
        assert_eq!(mapper.lookup(&rec, 6).unwrap(), Some(5));
        assert_eq!(mapper.lookup(&rec, 4).unwrap(), Some(6));

        let remap = mapper.remap(&mut rec, 6).unwrap();
        assert_eq!(remap, Remap { block: 7, previous: Some(5) });
    }

    #[test]
    fn test_release_frees_everything() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();

        mapper.remap(&mut rec, 0).unwrap();
        mapper.remap(&mut rec, 3).unwrap();
        mapper.remap(&mut rec, 4).unwrap();
        mapper.remap(&mut rec, 2000).unwrap();
        assert_eq!(mapper.owned_blocks(&rec).unwrap().len(), 6);

        let before = allocator.stats().blocks_used;
        assert_eq!(mapper.release(&mut rec).unwrap(), 6);
        assert_eq!(allocator.stats().blocks_used, before - 6);
        assert!(!rec.has_blocks());
        assert_eq!(allocator.stats().blocks_used, RESERVED as usize);
    }

    #[test]
    fn test_remap_exhaustion() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();
        while allocator.allocate_block().is_ok() {}

        assert!(matches!(
            mapper.remap(&mut rec, 0),
            Err(Error::Full(Resource::Block))
        ));
        assert_eq!(rec.direct[0], 0);
    }

    #[test]
    fn test_remap_full_releases_new_indirection_block() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();
        // Leave exactly one free block: enough for the table, not the data
        while allocator.stats().blocks_used + 1 < DEVICE_BLOCKS as usize {
            allocator.allocate_block().unwrap();
        }
        let before = allocator.snapshot(8, 8);

        assert!(matches!(
            mapper.remap(&mut rec, 4),
            Err(Error::Full(Resource::Block))
        ));
        assert_eq!(rec.indirect, [0; 4]);
        assert_eq!(allocator.snapshot(8, 8), before);
        assert_eq!(allocator.stats().blocks_used, DEVICE_BLOCKS as usize - 1);
    }

    #[test]
    fn test_retire() {
        let (allocator, cache) = setup();
        let mapper = BlockMapper::new(&allocator, &cache);
        let mut rec = record();

        let remap = mapper.remap(&mut rec, 1).unwrap();
        cache.write(remap.block, b"old").unwrap();
        mapper.retire(remap.block);
        assert!(!allocator.block_in_use(remap.block));
        assert!(!cache.contains(remap.block));
    }
}
