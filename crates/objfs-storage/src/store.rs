//! Object store
//!
//! Ties the allocator, block mapper and cache together into the keyed
//! object operations. All metadata (both bitmaps and the object table) is
//! loaded into memory at mount and written back in bulk by [`ObjectStore::sync`]
//! and [`ObjectStore::unmount`]; data blocks move through the cache.
//!
//! Locks are always taken in this order: object table, object bitmap,
//! block bitmap, cache slot.

use crate::bitmap::{Allocator, AllocatorStats, Bitmap};
use crate::cache::BlockCache;
use crate::device::BlockDevice;
use crate::layout::{BLOCK_SIZE, Layout, MAX_OBJECT_SIZE, ObjectRecord, RECORD_SIZE};
use crate::mapping::BlockMapper;
use objfs_common::{Config, Error, ObjectId, ObjectKey, ObjectStat, Result};
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Counters reported by [`ObjectStore::stats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub allocator: AllocatorStats,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_writebacks: u64,
}

/// Keyed object store on a block device
pub struct ObjectStore<D> {
    layout: Layout,
    cache: BlockCache<D>,
    allocator: Allocator,
    table: RwLock<Vec<ObjectRecord>>,
}

impl<D: BlockDevice> ObjectStore<D> {
    /// Write empty metadata regions to `device` and mount it
    pub fn format(device: D, config: &Config) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(&config.layout, device.block_count())?;
        let cache = BlockCache::new(device, &config.cache);

        for region in [layout.object_bitmap, layout.block_bitmap, layout.object_table] {
            cache.store_region(region, &[])?;
        }
        cache.sync_device()?;
        info!(
            device_blocks = layout.device_blocks,
            data_blocks = layout.data_blocks(),
            object_capacity = layout.object_capacity,
            "formatted object store"
        );

        Self::mount(cache.into_device(), config)
    }

    /// Load all metadata from `device`
    ///
    /// Blocks `0..data_start` are marked allocated. Every live object record
    /// must pass its checksum and carry the id of its slot.
    pub fn mount(device: D, config: &Config) -> Result<Self> {
        config.validate()?;
        let layout = Layout::new(&config.layout, device.block_count())?;
        let cache = BlockCache::new(device, &config.cache);

        let objects = Bitmap::from_bytes(
            &cache.load_region(layout.object_bitmap)?,
            layout.object_capacity,
        );
        let blocks = Bitmap::from_bytes(
            &cache.load_region(layout.block_bitmap)?,
            usize::try_from(layout.addressable_blocks)
                .map_err(|_| Error::configuration("device too large for this platform"))?,
        );

        let raw_table = cache.load_region(layout.object_table)?;
        let mut table = vec![ObjectRecord::default(); layout.object_capacity];
        for slot in objects.iter_set() {
            let offset = slot * RECORD_SIZE;
            let record = ObjectRecord::decode(&raw_table[offset..offset + RECORD_SIZE])
                .map_err(|e| Error::corrupted(format!("object slot {slot}: {e}")))?;
            let expected = ObjectId::from_slot(slot).map(ObjectId::get);
            if Some(record.id) != expected {
                return Err(Error::corrupted(format!(
                    "object slot {slot} holds id {}",
                    record.id
                )));
            }
            table[slot] = record;
        }

        let allocator = Allocator::new(objects, blocks);
        allocator.reserve_blocks(layout.data_start());
        let stats = allocator.stats();
        info!(
            objects = stats.objects_used,
            blocks_used = stats.blocks_used,
            blocks_total = stats.blocks_total,
            cache_slots = cache.slot_count(),
            "mounted object store"
        );

        Ok(Self {
            layout,
            cache,
            allocator,
            table: RwLock::new(table),
        })
    }

    /// Flush the cache and write all metadata back, returning the device
    ///
    /// On failure the store is dropped along with any dirty cached blocks and
    /// unsaved metadata. [`ObjectStore::try_unmount`] keeps it for a retry.
    pub fn unmount(self) -> Result<D> {
        self.try_unmount().map_err(|(_, e)| e)
    }

    /// Like [`ObjectStore::unmount`], but hands the store back if the sync fails
    pub fn try_unmount(self) -> std::result::Result<D, (Self, Error)> {
        if let Err(e) = self.sync() {
            warn!(error = %e, "unmount sync failed");
            return Err((self, e));
        }
        info!("unmounted object store");
        Ok(self.cache.into_device())
    }

    /// Flush dirty data blocks, then persist both bitmaps and the object table
    pub fn sync(&self) -> Result<()> {
        let table = self.table.read();
        let flushed = self.cache.flush()?;

        let (objects, blocks) = self.allocator.snapshot(
            self.layout.object_bitmap.byte_len(),
            self.layout.block_bitmap.byte_len(),
        );
        self.cache.store_region(self.layout.object_bitmap, &objects)?;
        self.cache.store_region(self.layout.block_bitmap, &blocks)?;

        let mut raw_table = vec![0u8; self.layout.object_table.byte_len()];
        for (record, out) in table
            .iter()
            .zip(raw_table.chunks_exact_mut(RECORD_SIZE))
            .filter(|(record, _)| record.id != 0)
        {
            record.encode(out);
        }
        self.cache.store_region(self.layout.object_table, &raw_table)?;
        self.cache.sync_device()?;

        debug!(flushed, "synced object store");
        Ok(())
    }

    /// Resolved on-device layout
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    fn mapper(&self) -> BlockMapper<'_, D> {
        BlockMapper::new(&self.allocator, &self.cache)
    }

    /// Slot of a live object with this id
    fn live_slot(&self, table: &[ObjectRecord], id: ObjectId) -> Result<usize> {
        let slot = id
            .slot()
            .ok_or_else(|| Error::invalid_argument(format!("object id {id} is reserved")))?;
        let live = table.get(slot).is_some_and(|r| r.id == id.get())
            && self.allocator.object_exists(id);
        if !live {
            return Err(Error::NotFound(format!("object id {id}")));
        }
        Ok(slot)
    }

    /// Lowest live slot whose key is `key`
    fn find_slot(&self, table: &[ObjectRecord], key: &str) -> Option<usize> {
        self.allocator
            .with_objects(|objects| objects.iter_set().find(|&slot| table[slot].key == key))
    }

    fn create_locked(&self, table: &mut [ObjectRecord], key: &ObjectKey) -> Result<ObjectId> {
        let id = self.allocator.allocate_object()?;
        let record = id
            .slot()
            .and_then(|slot| table.get_mut(slot))
            .ok_or_else(|| Error::corrupted(format!("object id {id} has no table slot")))?;
        *record = ObjectRecord::new(id, key.as_str());
        debug!(object_id = %id, key = key.as_str(), "created object");
        Ok(id)
    }

    /// Id of the lowest-numbered live object with this key
    pub fn find(&self, key: &str) -> Result<ObjectId> {
        let table = self.table.read();
        self.find_slot(&table, key)
            .and_then(ObjectId::from_slot)
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    /// Create an empty object in the lowest free slot
    ///
    /// Does not check for an existing object with the same key; see
    /// [`ObjectStore::create_unique`].
    pub fn create(&self, key: &str) -> Result<ObjectId> {
        let key = ObjectKey::new(key)?;
        let mut table = self.table.write();
        self.create_locked(&mut table, &key)
    }

    /// Create an object, failing if a live object already has this key
    pub fn create_unique(&self, key: &str) -> Result<ObjectId> {
        let key = ObjectKey::new(key)?;
        let mut table = self.table.write();
        if self.find_slot(&table, key.as_str()).is_some() {
            return Err(Error::Duplicate(key.as_str().to_owned()));
        }
        self.create_locked(&mut table, &key)
    }

    /// Change the key of the object found under `old`
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let new_key = ObjectKey::new(new)?;
        let mut table = self.table.write();
        let slot = self
            .find_slot(&table, old)
            .ok_or_else(|| Error::NotFound(old.to_owned()))?;
        if self.find_slot(&table, new_key.as_str()).is_some() {
            return Err(Error::Duplicate(new.to_owned()));
        }
        table[slot].key = new_key.as_str().to_owned();
        debug!(object_id = table[slot].id, old, new, "renamed object");
        Ok(())
    }

    /// Remove an object and release every block it owns
    ///
    /// The record keeps its key and size until the slot is reused.
    pub fn destroy(&self, key: &str) -> Result<()> {
        let mut table = self.table.write();
        let slot = self
            .find_slot(&table, key)
            .ok_or_else(|| Error::NotFound(key.to_owned()))?;
        let id = ObjectId::from_slot(slot)
            .ok_or_else(|| Error::corrupted(format!("object slot {slot} has no id")))?;

        let freed = self.mapper().release(&mut table[slot])?;
        self.allocator.free_object(id);
        debug!(object_id = %id, key, freed, "destroyed object");
        Ok(())
    }

    /// Write `data` at byte `offset` of an object
    ///
    /// `data` may be at most one block long. Each logical block it touches
    /// (two when the range straddles a block boundary) is moved to a freshly
    /// allocated block holding the previous contents with its piece of `data`
    /// spliced in; the old block is then freed. `size` grows by `data.len()`
    /// whatever the offset.
    ///
    /// If the second piece fails the first one stays written.
    pub fn write(&self, id: ObjectId, data: &[u8], offset: u64) -> Result<usize> {
        if data.len() > BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes exceeds block size {BLOCK_SIZE}",
                data.len()
            )));
        }
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > MAX_OBJECT_SIZE)
        {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes at offset {offset} runs past maximum object size",
                data.len()
            )));
        }

        let mut table = self.table.write();
        let slot = self.live_slot(&table, id)?;
        if data.is_empty() {
            return Ok(0);
        }
        let record = &mut table[slot];

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let len = (BLOCK_SIZE - in_block).min(data.len() - done);
            let piece = &data[done..done + len];
            if let Err(e) = self.write_piece(record, pos / BLOCK_SIZE as u64, in_block, piece) {
                if done > 0 {
                    warn!(
                        object_id = %id, offset, written = done, error = %e,
                        "write failed after its first block"
                    );
                }
                return Err(e);
            }
            done += len;
        }
        record.size += data.len() as u64;

        debug!(object_id = %id, offset, len = data.len(), "wrote object");
        Ok(data.len())
    }

    /// Move one logical block to a fresh block with `data` spliced in at `in_block`
    fn write_piece(
        &self,
        record: &mut ObjectRecord,
        logical: u64,
        in_block: usize,
        data: &[u8],
    ) -> Result<()> {
        let mapper = self.mapper();
        let contents = if data.len() == BLOCK_SIZE {
            data.to_vec()
        } else {
            let mut contents = match mapper.lookup(record, logical)? {
                Some(block) => self.cache.read_block(block)?,
                None => vec![0u8; BLOCK_SIZE],
            };
            contents[in_block..in_block + data.len()].copy_from_slice(data);
            contents
        };

        let remap = mapper.remap(record, logical)?;
        if let Err(e) = self.cache.write(remap.block, &contents) {
            warn!(
                object_id = record.id, logical, block = remap.block, error = %e,
                "data write failed after remap"
            );
            return Err(e);
        }
        if let Some(previous) = remap.previous {
            mapper.retire(previous);
        }
        Ok(())
    }

    /// Read into `buf` starting at byte `offset` of an object
    ///
    /// Blocks never written read as zeros. The range is clamped to the
    /// maximum object size; the number of bytes filled is returned.
    pub fn read(&self, id: ObjectId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let table = self.table.read();
        let slot = self.live_slot(&table, id)?;
        let record = &table[slot];
        let mapper = self.mapper();

        let available = MAX_OBJECT_SIZE.saturating_sub(offset);
        let len = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            let out = &mut buf[done..done + chunk];
            match mapper.lookup(record, pos / BLOCK_SIZE as u64)? {
                Some(block) => self.cache.read(block, in_block, out)?,
                None => out.fill(0),
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Size and 512-byte block count of an object
    pub fn stat(&self, id: ObjectId) -> Result<ObjectStat> {
        let table = self.table.read();
        let slot = self.live_slot(&table, id)?;
        Ok(ObjectStat::new(id, table[slot].size))
    }

    /// Release a handle; only checks that the object is live
    pub fn release(&self, id: ObjectId) -> Result<()> {
        let table = self.table.read();
        self.live_slot(&table, id)?;
        debug!(object_id = %id, "released object");
        Ok(())
    }

    /// Live objects in id order
    pub fn list(&self) -> Vec<(ObjectId, String)> {
        let table = self.table.read();
        self.allocator.with_objects(|objects| {
            objects
                .iter_set()
                .filter_map(|slot| Some((ObjectId::from_slot(slot)?, table[slot].key.clone())))
                .collect()
        })
    }

    /// Allocator and cache counters
    pub fn stats(&self) -> StoreStats {
        let cache = self.cache.stats();
        StoreStats {
            allocator: self.allocator.stats(),
            cache_hits: cache.hits.load(Ordering::Relaxed),
            cache_misses: cache.misses.load(Ordering::Relaxed),
            cache_evictions: cache.evictions.load(Ordering::Relaxed),
            cache_writebacks: cache.writebacks.load(Ordering::Relaxed),
        }
    }
}
