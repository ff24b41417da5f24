//! Block device abstraction
//!
//! The translator issues whole-sector reads and writes against a
//! [`BlockDevice`]. Two implementations are provided:
//! - [`MemDevice`]: sparse in-memory device, unwritten sectors read as zero
//! - [`FileDevice`]: a regular file or block device using positional I/O on
//!   the blocking thread pool

use crate::error::{BlockError, BlockResult};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use logtl_common::{SECTOR_SIZE, sectors_to_bytes};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// A sector-addressed storage device
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Device size in sectors
    fn capacity_sectors(&self) -> u64;

    /// Read `sectors` starting at `sector`
    async fn read_at(&self, sector: u64, sectors: u32) -> BlockResult<Bytes>;

    /// Write `data` (a whole number of sectors) starting at `sector`
    async fn write_at(&self, sector: u64, data: Bytes) -> BlockResult<()>;

    /// Make completed writes durable
    async fn flush(&self) -> BlockResult<()>;
}

/// Check a request against the device size; returns its byte length
fn check_range(capacity: u64, sector: u64, sectors: u64) -> BlockResult<usize> {
    if sector.checked_add(sectors).is_none_or(|end| end > capacity) {
        return Err(BlockError::Device(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("sectors {sector}+{sectors} beyond device end {capacity}"),
        )));
    }
    Ok(sectors_to_bytes(sectors) as usize)
}

fn whole_sectors(data: &Bytes) -> BlockResult<u64> {
    let len = data.len() as u64;
    if len % SECTOR_SIZE != 0 {
        return Err(BlockError::invalid(format!(
            "write of {len} bytes is not sector aligned"
        )));
    }
    Ok(len / SECTOR_SIZE)
}

// ── In-memory device ────────────────────────────────────────────────────

/// Sparse in-memory device
#[derive(Debug)]
pub struct MemDevice {
    capacity: u64,
    sectors: RwLock<HashMap<u64, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemDevice {
    /// Create a zero-filled device of `capacity` sectors
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            sectors: RwLock::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of sectors ever written
    #[must_use]
    pub fn written_sectors(&self) -> usize {
        self.sectors.read().len()
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn capacity_sectors(&self) -> u64 {
        self.capacity
    }

    async fn read_at(&self, sector: u64, sectors: u32) -> BlockResult<Bytes> {
        let len = check_range(self.capacity, sector, u64::from(sectors))?;
        let mut out = BytesMut::zeroed(len);
        let map = self.sectors.read();
        for (i, chunk) in out.chunks_mut(SECTOR_SIZE as usize).enumerate() {
            if let Some(stored) = map.get(&(sector + i as u64)) {
                chunk.copy_from_slice(stored);
            }
        }
        Ok(out.freeze())
    }

    async fn write_at(&self, sector: u64, data: Bytes) -> BlockResult<()> {
        let count = whole_sectors(&data)?;
        check_range(self.capacity, sector, count)?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BlockError::Device(std::io::Error::other(
                "injected write failure",
            )));
        }
        let mut map = self.sectors.write();
        for i in 0..count {
            let start = sectors_to_bytes(i) as usize;
            map.insert(
                sector + i,
                data.slice(start..start + SECTOR_SIZE as usize),
            );
        }
        Ok(())
    }

    async fn flush(&self) -> BlockResult<()> {
        Ok(())
    }
}

// ── File-backed device ──────────────────────────────────────────────────

/// Regular file or block device accessed with positional I/O
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    path: PathBuf,
    capacity: u64,
}

impl FileDevice {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>) -> BlockResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let bytes = if Self::is_block_device(&file)? {
            Self::block_device_size(&file)?
        } else {
            file.metadata()?.len()
        };
        info!("opened {} ({} sectors)", path.display(), bytes / SECTOR_SIZE);
        Ok(Self {
            file: Arc::new(file),
            path,
            capacity: bytes / SECTOR_SIZE,
        })
    }

    /// Create (or resize) a regular file of `sectors`
    pub fn create(path: impl AsRef<Path>, sectors: u64) -> BlockResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(sectors_to_bytes(sectors))?;
        info!("created {} ({} sectors)", path.display(), sectors);
        Ok(Self {
            file: Arc::new(file),
            path,
            capacity: sectors,
        })
    }

    /// Path of the underlying file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_block_device(file: &File) -> BlockResult<bool> {
        use std::os::unix::fs::FileTypeExt;
        Ok(file.metadata()?.file_type().is_block_device())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn block_device_size(file: &File) -> BlockResult<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File) -> BlockResult<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    async fn blocking<T, F>(&self, op: F) -> BlockResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| BlockError::Internal(format!("blocking I/O task failed: {e}")))?
            .map_err(BlockError::from)
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn capacity_sectors(&self) -> u64 {
        self.capacity
    }

    async fn read_at(&self, sector: u64, sectors: u32) -> BlockResult<Bytes> {
        let len = check_range(self.capacity, sector, u64::from(sectors))?;
        let offset = sectors_to_bytes(sector);
        self.blocking(move |file| {
            let mut buf = BytesMut::zeroed(len);
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf.freeze())
        })
        .await
    }

    async fn write_at(&self, sector: u64, data: Bytes) -> BlockResult<()> {
        let count = whole_sectors(&data)?;
        check_range(self.capacity, sector, count)?;
        let offset = sectors_to_bytes(sector);
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn flush(&self) -> BlockResult<()> {
        self.blocking(File::sync_data).await
    }
}
