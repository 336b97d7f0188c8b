//! Block cache for the storage engine
//!
//! A fixed array of slots, each holding at most one block. Block `n` can
//! only live in slot `n % slots`, so eviction happens purely on collision:
//! installing a block flushes whatever dirty block shared its slot.
//!
//! This is the only module that talks to the device. Metadata regions are
//! loaded and stored through [`BlockCache::load_region`] and
//! [`BlockCache::store_region`], which bypass the slots.

use crate::device::BlockDevice;
use crate::layout::{BLOCK_SIZE, Region};
use objfs_common::{BlockNo, CacheConfig, CachePolicy, Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads served from a slot
    pub hits: AtomicU64,
    /// Reads that went to the device
    pub misses: AtomicU64,
    /// Resident blocks displaced by a colliding block
    pub evictions: AtomicU64,
    /// Dirty blocks written back to the device
    pub writebacks: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// One cache slot; `block == 0` means empty
struct CacheSlot {
    block: BlockNo,
    dirty: bool,
    /// Allocated on first use
    data: Vec<u8>,
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            block: 0,
            dirty: false,
            data: Vec::new(),
        }
    }
}

/// Slot cache in front of a [`BlockDevice`]
pub struct BlockCache<D> {
    device: D,
    slots: Box<[Mutex<CacheSlot>]>,
    policy: CachePolicy,
    stats: CacheStats,
}

impl<D: BlockDevice> BlockCache<D> {
    /// Wrap `device`; with [`CachePolicy::Direct`] no slots are kept
    pub fn new(device: D, config: &CacheConfig) -> Self {
        let slots = match config.policy {
            CachePolicy::WriteBack => config.slots,
            CachePolicy::Direct => 0,
        };
        Self {
            device,
            slots: (0..slots).map(|_| Mutex::new(CacheSlot::empty())).collect(),
            policy: config.policy,
            stats: CacheStats::default(),
        }
    }

    pub const fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Number of slots (0 for direct I/O)
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Give the device back
    pub fn into_device(self) -> D {
        self.device
    }

    fn slot(&self, block: BlockNo) -> &Mutex<CacheSlot> {
        &self.slots[block as usize % self.slots.len()]
    }

    fn check_block(&self, block: BlockNo) -> Result<()> {
        if block == 0 || u64::from(block) >= self.device.block_count() {
            return Err(Error::bad_block(block, self.device.block_count()));
        }
        Ok(())
    }

    /// Write a resident dirty block back to the device
    fn write_back(&self, slot: &mut CacheSlot) -> Result<()> {
        if slot.block == 0 || !slot.dirty {
            return Ok(());
        }
        self.device.write_block(u64::from(slot.block), &slot.data)?;
        slot.dirty = false;
        self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Make room in `slot` for `block`, flushing a dirty occupant first
    fn displace(&self, slot: &mut CacheSlot, block: BlockNo) -> Result<()> {
        if slot.block != 0 && slot.block != block {
            debug!(resident = slot.block, incoming = block, "cache slot collision");
            self.write_back(slot)?;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        if slot.data.len() != BLOCK_SIZE {
            slot.data = vec![0u8; BLOCK_SIZE];
        }
        Ok(())
    }

    /// Copy `out.len()` bytes of `block`, starting at `offset`, into `out`
    pub fn read(&self, block: BlockNo, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_block(block)?;
        let end = offset + out.len();
        if end > BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "read of {offset}..{end} crosses block boundary"
            )));
        }

        if self.policy == CachePolicy::Direct {
            let mut scratch = vec![0u8; BLOCK_SIZE];
            self.device.read_block(u64::from(block), &mut scratch)?;
            out.copy_from_slice(&scratch[offset..end]);
            return Ok(());
        }

        let mut slot = self.slot(block).lock();
        if slot.block == block {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            self.displace(&mut slot, block)?;
            // The slot no longer holds the old block even if the load fails
            slot.block = 0;
            slot.dirty = false;
            self.device.read_block(u64::from(block), &mut slot.data)?;
            slot.block = block;
        }
        out.copy_from_slice(&slot.data[offset..end]);
        Ok(())
    }

    /// Read a whole block
    pub fn read_block(&self, block: BlockNo) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read(block, 0, &mut buf)?;
        Ok(buf)
    }

    /// Replace the contents of `block` with `data`, zero padded to a block
    pub fn write(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        self.check_block(block)?;
        if data.len() > BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes exceeds block size {BLOCK_SIZE}",
                data.len()
            )));
        }

        if self.policy == CachePolicy::Direct {
            let mut scratch = vec![0u8; BLOCK_SIZE];
            scratch[..data.len()].copy_from_slice(data);
            return self.device.write_block(u64::from(block), &scratch);
        }

        let mut slot = self.slot(block).lock();
        self.displace(&mut slot, block)?;
        slot.block = block;
        slot.dirty = true;
        slot.data[..data.len()].copy_from_slice(data);
        slot.data[data.len()..].fill(0);
        Ok(())
    }

    /// Drop `block` from its slot without writing it back
    ///
    /// Returns false if the slot holds some other block, which is left alone.
    pub fn evict(&self, block: BlockNo) -> bool {
        if self.slots.is_empty() || block == 0 {
            return false;
        }
        let mut slot = self.slot(block).lock();
        if slot.block != block {
            return false;
        }
        slot.block = 0;
        slot.dirty = false;
        true
    }

    /// Check whether `block` is resident
    pub fn contains(&self, block: BlockNo) -> bool {
        !self.slots.is_empty() && block != 0 && self.slot(block).lock().block == block
    }

    /// Check whether `block` is resident and not yet on the device
    pub fn is_dirty(&self, block: BlockNo) -> bool {
        if self.slots.is_empty() || block == 0 {
            return false;
        }
        let slot = self.slot(block).lock();
        slot.block == block && slot.dirty
    }

    /// Write every dirty slot back, returning how many were written
    ///
    /// Stops at the first device failure; slots already flushed stay clean.
    pub fn flush(&self) -> Result<usize> {
        let mut flushed = 0;
        for slot in &*self.slots {
            let mut slot = slot.lock();
            if slot.block != 0 && slot.dirty {
                self.write_back(&mut slot).inspect_err(|e| {
                    warn!(block = slot.block, error = %e, "cache flush failed");
                })?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Read a whole metadata region from the device
    pub fn load_region(&self, region: Region) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; region.byte_len()];
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.device.read_block(region.start + i as u64, chunk)?;
        }
        Ok(buf)
    }

    /// Write a whole metadata region to the device, zero padding the tail
    pub fn store_region(&self, region: Region, data: &[u8]) -> Result<()> {
        let mut scratch = vec![0u8; BLOCK_SIZE];
        for i in 0..region.blocks {
            let start = usize::try_from(i).unwrap_or(usize::MAX).saturating_mul(BLOCK_SIZE);
            let src = data.get(start..).unwrap_or_default();
            let len = src.len().min(BLOCK_SIZE);
            scratch[..len].copy_from_slice(&src[..len]);
            scratch[len..].fill(0);
            self.device.write_block(region.start + i, &scratch)?;
        }
        Ok(())
    }

    /// Make the device durable
    pub fn sync_device(&self) -> Result<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(slots: usize) -> (MemDevice, BlockCache<MemDevice>) {
        let dev = MemDevice::new(64);
        let cache = BlockCache::new(
            dev.clone(),
            &CacheConfig {
                slots,
                policy: CachePolicy::WriteBack,
            },
        );
        (dev, cache)
    }

    fn pattern(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn test_write_stays_in_cache_until_flush() {
        let (dev, cache) = cache(8);
        cache.write(10, &pattern(0xaa)).unwrap();
        assert!(cache.is_dirty(10));
        assert_eq!(dev.writes(), 0);

        assert_eq!(cache.read_block(10).unwrap(), pattern(0xaa));
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);

        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(dev.writes(), 1);
        assert_eq!(dev.snapshot(10), pattern(0xaa));
        assert!(!cache.is_dirty(10));
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn test_collision_flushes_dirty_resident() {
        let (dev, cache) = cache(8);
        cache.write(3, &pattern(1)).unwrap();
        cache.write(11, &pattern(2)).unwrap();

        // Block 3 shared slot 3 with block 11 and was written back
        assert_eq!(dev.snapshot(3), pattern(1));
        assert!(!cache.contains(3));
        assert!(cache.contains(11));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);

        assert_eq!(cache.read_block(3).unwrap(), pattern(1));
        assert_eq!(dev.snapshot(11), pattern(2));
        assert_eq!(cache.read_block(11).unwrap(), pattern(2));
    }

    #[test]
    fn test_partial_write_zero_pads() {
        let (_, cache) = cache(4);
        cache.write(5, &pattern(9)).unwrap();
        cache.write(5, b"abc").unwrap();

        let block = cache.read_block(5).unwrap();
        assert_eq!(&block[..3], b"abc");
        assert!(block[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_range() {
        let (_, cache) = cache(4);
        let mut data = pattern(0);
        data[100..104].copy_from_slice(b"objs");
        cache.write(6, &data).unwrap();

        let mut out = [0u8; 4];
        cache.read(6, 100, &mut out).unwrap();
        assert_eq!(&out, b"objs");
        assert!(matches!(
            cache.read(6, BLOCK_SIZE - 2, &mut out),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_block_zero_rejected() {
        let (_, cache) = cache(4);
        assert!(cache.write(0, b"x").is_err());
        assert!(cache.read_block(0).is_err());
        assert!(cache.read_block(64).is_err());
    }

    #[test]
    fn test_evict_discards_only_matching_block() {
        let (dev, cache) = cache(8);
        cache.write(2, &pattern(7)).unwrap();
        assert!(!cache.evict(10));
        assert!(cache.contains(2));

        assert!(cache.evict(2));
        assert!(!cache.contains(2));
        assert_eq!(cache.flush().unwrap(), 0);
        assert_eq!(dev.writes(), 0);
    }

    #[test]
    fn test_failed_writeback_keeps_resident() {
        let (dev, cache) = cache(8);
        cache.write(4, &pattern(4)).unwrap();
        dev.fail_writes_after(0);

        assert!(cache.write(12, &pattern(5)).unwrap_err().is_io());
        assert!(cache.is_dirty(4));
        assert!(!cache.contains(12));

        dev.clear_faults();
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(dev.snapshot(4), pattern(4));
    }

    #[test]
    fn test_direct_policy_bypasses_slots() {
        let dev = MemDevice::new(16);
        let cache = BlockCache::new(
            dev.clone(),
            &CacheConfig {
                slots: 8,
                policy: CachePolicy::Direct,
            },
        );
        assert_eq!(cache.slot_count(), 0);

        cache.write(5, b"direct").unwrap();
        assert_eq!(dev.writes(), 1);
        assert!(dev.snapshot(5).starts_with(b"direct"));
        assert!(!cache.contains(5));
        assert!(!cache.evict(5));

        let mut out = [0u8; 6];
        cache.read(5, 0, &mut out).unwrap();
        assert_eq!(&out, b"direct");
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn test_region_roundtrip() {
        let (dev, cache) = cache(4);
        let region = Region::new(1, 2);
        cache.store_region(region, b"metadata").unwrap();
        assert_eq!(dev.writes(), 2);

        let loaded = cache.load_region(region).unwrap();
        assert_eq!(loaded.len(), 2 * BLOCK_SIZE);
        assert!(loaded.starts_with(b"metadata"));
        assert!(loaded[8..].iter().all(|&b| b == 0));
    }
}
