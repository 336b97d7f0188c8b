//! Block devices
//!
//! The storage engine is generic over [`BlockDevice`]: anything that can read
//! and write whole `BLOCK_SIZE` blocks by number. Two implementations ship:
//! - [`FileDevice`]: an image file or a raw block device (positional I/O)
//! - [`MemDevice`]: an in-memory device with write-fault injection

use crate::layout::BLOCK_SIZE;
use objfs_common::{Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-size block storage addressed by block number
///
/// Buffers passed to `read_block`/`write_block` are exactly [`BLOCK_SIZE`]
/// bytes long.
pub trait BlockDevice: Send + Sync {
    /// Number of whole blocks on the device
    fn block_count(&self) -> u64;

    /// Read block `block` into `buf`
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to block `block`
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(block, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(block, buf)
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(block, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn check_request(block: u64, len: usize, block_count: u64) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(Error::invalid_argument(format!(
            "buffer is {len} bytes, block size is {BLOCK_SIZE}"
        )));
    }
    if block >= block_count {
        return Err(Error::device(
            block,
            format!("beyond end of device ({block_count} blocks)"),
        ));
    }
    Ok(())
}

/// Block device backed by a regular file or a raw disk
pub struct FileDevice {
    file: File,
    path: String,
    blocks: u64,
    read_only: bool,
}

impl FileDevice {
    /// Open an existing image or block device
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::device(0u64, format!("failed to open {path_str}: {e}")))?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| {
                    Error::device(0u64, format!("failed to get metadata for {path_str}: {e}"))
                })?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            blocks: size / BLOCK_SIZE as u64,
            read_only,
        })
    }

    /// Create an image file of `blocks` zeroed blocks
    ///
    /// For block devices the device is opened as-is and `blocks` is ignored.
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::device(0u64, format!("failed to create {path_str}: {e}")))?;

        let blocks = if is_block_device {
            Self::get_block_device_size(&file, &path_str)? / BLOCK_SIZE as u64
        } else {
            file.set_len(blocks * BLOCK_SIZE as u64).map_err(|e| {
                Error::device(0u64, format!("failed to set size for {path_str}: {e}"))
            })?;
            blocks
        };

        Ok(Self {
            file,
            path: path_str,
            blocks,
            read_only: false,
        })
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
        if ret == -1 {
            return Err(Error::device(
                0u64,
                format!(
                    "failed to get block device size for {path}: {}",
                    std::io::Error::last_os_error()
                ),
            ));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0))
            .map_err(|e| Error::device(0u64, format!("failed to get device size for {path}: {e}")))
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block, buf.len(), self.blocks)?;
        self.file
            .read_exact_at(buf, block * BLOCK_SIZE as u64)
            .map_err(|e| Error::device(block, format!("read failed on {}: {e}", self.path)))
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::device(block, format!("{} is read-only", self.path)));
        }
        check_request(block, buf.len(), self.blocks)?;
        self.file
            .write_all_at(buf, block * BLOCK_SIZE as u64)
            .map_err(|e| Error::device(block, format!("write failed on {}: {e}", self.path)))
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::from)
    }
}

/// In-memory block device
///
/// Clones share the same storage, so a test can keep a handle while the
/// store owns another. Writes can be made to fail after a budget is spent.
#[derive(Clone)]
pub struct MemDevice {
    inner: Arc<MemInner>,
}

struct MemInner {
    data: RwLock<Vec<u8>>,
    blocks: u64,
    /// Remaining successful writes before failures start (`u64::MAX` = never)
    write_budget: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    /// Create a zeroed device of `blocks` blocks
    #[must_use]
    pub fn new(blocks: u64) -> Self {
        let len = usize::try_from(blocks).unwrap_or(usize::MAX / BLOCK_SIZE) * BLOCK_SIZE;
        Self {
            inner: Arc::new(MemInner {
                data: RwLock::new(vec![0u8; len]),
                blocks,
                write_budget: AtomicU64::new(u64::MAX),
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Let `n` more writes succeed, then fail every write
    pub fn fail_writes_after(&self, n: u64) {
        self.inner.write_budget.store(n, Ordering::SeqCst);
    }

    /// Stop injecting write failures
    pub fn clear_faults(&self) {
        self.inner.write_budget.store(u64::MAX, Ordering::SeqCst);
    }

    /// Number of block reads served
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes accepted
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Copy of a block's current contents, bypassing the counters
    pub fn snapshot(&self, block: u64) -> Vec<u8> {
        let start = usize::try_from(block).unwrap_or(usize::MAX) * BLOCK_SIZE;
        let data = self.inner.data.read();
        data.get(start..start + BLOCK_SIZE)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    fn take_write_budget(&self) -> bool {
        self.inner
            .write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| match b {
                u64::MAX => Some(u64::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl BlockDevice for MemDevice {
    fn block_count(&self) -> u64 {
        self.inner.blocks
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_request(block, buf.len(), self.inner.blocks)?;
        let start = block as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.inner.data.read()[start..start + BLOCK_SIZE]);
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_request(block, buf.len(), self.inner.blocks)?;
        if !self.take_write_budget() {
            return Err(Error::device(block, "injected write failure"));
        }
        let start = block as usize * BLOCK_SIZE;
        self.inner.data.write()[start..start + BLOCK_SIZE].copy_from_slice(buf);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mem_device_roundtrip() {
        let dev = MemDevice::new(4);
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"hello");
        dev.write_block(2, &block).unwrap();

        let mut out = vec![0u8; BLOCK_SIZE];
        dev.read_block(2, &mut out).unwrap();
        assert_eq!(out, block);
        assert_eq!(dev.reads(), 1);
        assert_eq!(dev.writes(), 1);
    }

    #[test]
    fn test_mem_device_bounds() {
        let dev = MemDevice::new(4);
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(dev.read_block(4, &mut buf).unwrap_err().is_io());

        let mut short = vec![0u8; 100];
        assert!(matches!(
            dev.read_block(0, &mut short),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mem_device_fault_injection() {
        let dev = MemDevice::new(4);
        let buf = vec![1u8; BLOCK_SIZE];
        dev.fail_writes_after(1);
        dev.write_block(0, &buf).unwrap();
        assert!(dev.write_block(1, &buf).unwrap_err().is_io());
        assert_eq!(dev.snapshot(1), vec![0u8; BLOCK_SIZE]);

        dev.clear_faults();
        dev.write_block(1, &buf).unwrap();
        assert_eq!(dev.snapshot(1), buf);
    }

    #[test]
    fn test_file_device_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let dev = FileDevice::create(path, 8).unwrap();
            assert_eq!(dev.block_count(), 8);
            let mut buf = vec![0u8; BLOCK_SIZE];
            buf[..17].copy_from_slice(b"test data pattern");
            dev.write_block(3, &buf).unwrap();
            dev.sync().unwrap();
        }

        {
            let dev = FileDevice::open(path, true).unwrap();
            assert_eq!(dev.block_count(), 8);
            let mut buf = vec![0u8; BLOCK_SIZE];
            dev.read_block(3, &mut buf).unwrap();
            assert!(buf.starts_with(b"test data pattern"));
            assert!(dev.write_block(3, &buf).is_err());
        }
    }
}
