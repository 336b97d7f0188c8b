//! Bitmap allocation
//!
//! This module provides:
//! - [`Bitmap`]: fixed-length bit set with first-fit search
//! - [`Allocator`]: the object and block bitmaps behind one lock each
//!
//! Allocation is first-fit with no cursor: every call scans from index 0, so
//! the lowest free index always wins.

use objfs_common::{BlockNo, Error, ObjectId, Resource, Result};
use parking_lot::Mutex;
use tracing::warn;

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length bit set, one bit per allocatable unit (1 = used)
///
/// Bit `i` lives in bit `i % 8` of byte `i / 8` when serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` clear bits
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Load a bitmap from its on-device bytes
    ///
    /// Bits at or beyond `len` are dropped.
    #[must_use]
    pub fn from_bytes(data: &[u8], len: usize) -> Self {
        let mut bitmap = Self::new(len);
        for (word, chunk) in bitmap.words.iter_mut().zip(data.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        let tail = len % WORD_BITS;
        if tail != 0
            && let Some(last) = bitmap.words.last_mut()
        {
            *last &= (1u64 << tail) - 1;
        }
        bitmap
    }

    /// Serialize into exactly `byte_len` bytes, zero padded
    #[must_use]
    pub fn to_bytes(&self, byte_len: usize) -> Vec<u8> {
        let mut out: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        out.resize(byte_len, 0);
        out
    }

    /// Number of bits tracked
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if a bit is set; out-of-range bits count as set
    #[must_use]
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.len {
            return true;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set a bit, returning whether it was previously clear
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clear a bit, returning whether it was previously set
    pub fn clear(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    /// Lowest clear bit, scanning word by word then bit by bit
    #[must_use]
    pub fn first_clear(&self) -> Option<usize> {
        for (w, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let index = w * WORD_BITS + (!word).trailing_zeros() as usize;
            // Every later index is larger still
            return (index < self.len).then_some(index);
        }
        None
    }

    /// Claim the lowest clear bit
    pub fn allocate(&mut self) -> Option<usize> {
        let index = self.first_clear()?;
        self.set(index);
        Some(index)
    }

    /// Number of set bits
    #[must_use]
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of set bits in increasing order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * WORD_BITS + bit)
            })
        })
    }
}

/// Allocation counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub objects_used: usize,
    pub objects_total: usize,
    pub blocks_used: usize,
    pub blocks_total: usize,
}

/// Object and block allocator shared by every store operation
///
/// Each bitmap sits behind its own mutex so a scan-and-set is atomic. When
/// both are needed the object bitmap is locked first.
pub struct Allocator {
    objects: Mutex<Bitmap>,
    blocks: Mutex<Bitmap>,
}

impl Allocator {
    #[must_use]
    pub const fn new(objects: Bitmap, blocks: Bitmap) -> Self {
        Self {
            objects: Mutex::new(objects),
            blocks: Mutex::new(blocks),
        }
    }

    /// Claim the lowest free object id
    pub fn allocate_object(&self) -> Result<ObjectId> {
        let slot = self
            .objects
            .lock()
            .allocate()
            .ok_or(Error::Full(Resource::ObjectSlot))?;
        ObjectId::from_slot(slot).ok_or(Error::Full(Resource::ObjectSlot))
    }

    /// Claim the lowest free block
    pub fn allocate_block(&self) -> Result<BlockNo> {
        let mut blocks = self.blocks.lock();
        let index = blocks.first_clear().ok_or(Error::Full(Resource::Block))?;
        let block = BlockNo::try_from(index).map_err(|_| Error::Full(Resource::Block))?;
        blocks.set(index);
        Ok(block)
    }

    /// Release an object id; releasing a free id only logs
    pub fn free_object(&self, id: ObjectId) {
        let released = id.slot().is_some_and(|slot| self.objects.lock().clear(slot));
        if !released {
            warn!(object_id = %id, "freeing object id that was not allocated");
        }
    }

    /// Release a block; releasing a free block only logs
    pub fn free_block(&self, block: BlockNo) {
        self.free_blocks(&[block]);
    }

    /// Release several blocks under one lock acquisition
    pub fn free_blocks(&self, blocks: &[BlockNo]) {
        let mut bitmap = self.blocks.lock();
        for &block in blocks {
            if !bitmap.clear(block as usize) {
                warn!(block, "freeing block that was not allocated");
            }
        }
    }

    /// Mark blocks `0..end` as permanently in use
    pub fn reserve_blocks(&self, end: u64) {
        let mut bitmap = self.blocks.lock();
        for block in 0..usize::try_from(end).unwrap_or(usize::MAX).min(bitmap.len()) {
            bitmap.set(block);
        }
    }

    /// Check whether an object id is allocated
    pub fn object_exists(&self, id: ObjectId) -> bool {
        id.slot().is_some_and(|slot| {
            let objects = self.objects.lock();
            slot < objects.len() && objects.is_set(slot)
        })
    }

    /// Check whether a block is allocated
    pub fn block_in_use(&self, block: BlockNo) -> bool {
        self.blocks.lock().is_set(block as usize)
    }

    /// Run `f` over the object bitmap while holding its lock
    pub fn with_objects<R>(&self, f: impl FnOnce(&Bitmap) -> R) -> R {
        f(&self.objects.lock())
    }

    /// Serialized copies of both bitmaps
    pub fn snapshot(&self, object_bytes: usize, block_bytes: usize) -> (Vec<u8>, Vec<u8>) {
        let objects = self.objects.lock().to_bytes(object_bytes);
        let blocks = self.blocks.lock().to_bytes(block_bytes);
        (objects, blocks)
    }

    pub fn stats(&self) -> AllocatorStats {
        let objects = self.objects.lock();
        let blocks = self.blocks.lock();
        AllocatorStats {
            objects_used: objects.count_set(),
            objects_total: objects.len(),
            blocks_used: blocks.count_set(),
            blocks_total: blocks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocate() {
        let mut bitmap = Bitmap::new(100);
        assert_eq!(bitmap.count_set(), 0);

        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(1));
        assert!(bitmap.is_set(0));
        assert_eq!(bitmap.count_set(), 2);
    }

    #[test]
    fn test_bitmap_first_fit_reuses_lowest() {
        let mut bitmap = Bitmap::new(200);
        for _ in 0..130 {
            bitmap.allocate().unwrap();
        }
        assert!(bitmap.clear(70));
        assert!(bitmap.clear(5));
        assert_eq!(bitmap.allocate(), Some(5));
        assert_eq!(bitmap.allocate(), Some(70));
        assert_eq!(bitmap.allocate(), Some(130));
    }

    #[test]
    fn test_bitmap_clear_twice() {
        let mut bitmap = Bitmap::new(10);
        bitmap.set(3);
        assert!(bitmap.clear(3));
        assert!(!bitmap.clear(3));
        assert!(!bitmap.is_set(3));
    }

    #[test]
    fn test_bitmap_full() {
        let mut bitmap = Bitmap::new(70);
        for i in 0..70 {
            assert_eq!(bitmap.allocate(), Some(i));
        }
        let before = bitmap.clone();
        assert_eq!(bitmap.allocate(), None);
        assert_eq!(bitmap, before);
    }

    #[test]
    fn test_bitmap_out_of_range() {
        let mut bitmap = Bitmap::new(10);
        assert!(bitmap.is_set(10));
        assert!(!bitmap.set(10));
        assert!(!bitmap.clear(99));
    }

    #[test]
    fn test_bitmap_serialization() {
        let mut bitmap = Bitmap::new(100);
        bitmap.set(0);
        bitmap.set(9);
        bitmap.set(99);

        let bytes = bitmap.to_bytes(4096);
        assert_eq!(bytes.len(), 4096);
        assert_eq!(bytes[0], 0b0000_0001);
        assert_eq!(bytes[1], 0b0000_0010);
        assert_eq!(bytes[12], 0b0000_1000);

        let reloaded = Bitmap::from_bytes(&bytes, 100);
        assert_eq!(reloaded, bitmap);
        assert_eq!(reloaded.iter_set().collect::<Vec<_>>(), vec![0, 9, 99]);
    }

    #[test]
    fn test_bitmap_from_bytes_drops_tail() {
        let bytes = vec![0xff; 16];
        let bitmap = Bitmap::from_bytes(&bytes, 70);
        assert_eq!(bitmap.count_set(), 70);
        assert_eq!(bitmap.first_clear(), None);
    }

    #[test]
    fn test_allocator_ids_start_at_two() {
        let allocator = Allocator::new(Bitmap::new(3), Bitmap::new(8));
        assert_eq!(allocator.allocate_object().unwrap(), ObjectId::new(2));
        assert_eq!(allocator.allocate_object().unwrap(), ObjectId::new(3));
        assert!(allocator.object_exists(ObjectId::new(3)));
        assert!(!allocator.object_exists(ObjectId::new(1)));

        allocator.free_object(ObjectId::new(2));
        assert_eq!(allocator.allocate_object().unwrap(), ObjectId::new(2));
        assert_eq!(allocator.allocate_object().unwrap(), ObjectId::new(4));
        assert!(matches!(
            allocator.allocate_object(),
            Err(Error::Full(Resource::ObjectSlot))
        ));
    }

    #[test]
    fn test_allocator_block_exhaustion() {
        let allocator = Allocator::new(Bitmap::new(1), Bitmap::new(16));
        allocator.reserve_blocks(4);
        for expected in 4..16 {
            assert_eq!(allocator.allocate_block().unwrap(), expected);
        }

        let (_, before) = allocator.snapshot(8, 8);
        assert!(matches!(
            allocator.allocate_block(),
            Err(Error::Full(Resource::Block))
        ));
        let (_, after) = allocator.snapshot(8, 8);
        assert_eq!(before, after);

        allocator.free_blocks(&[9, 5]);
        assert!(!allocator.block_in_use(5));
        assert_eq!(allocator.allocate_block().unwrap(), 5);
    }

    #[test]
    fn test_allocator_stats() {
        let allocator = Allocator::new(Bitmap::new(10), Bitmap::new(32));
        allocator.reserve_blocks(4);
        allocator.allocate_object().unwrap();
        allocator.allocate_block().unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.objects_used, 1);
        assert_eq!(stats.objects_total, 10);
        assert_eq!(stats.blocks_used, 5);
        assert_eq!(stats.blocks_total, 32);
    }
}
