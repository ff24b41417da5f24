//! Reference control plane
//!
//! Runs next to a [`Translator`] and does the work it defers:
//! - the write loop copies completed writes out of the log to a backend
//! - the read loop fills faulted ranges into a read-cache region on the
//!   cache device and resolves them into the READ index
//!
//! The read-cache region is reused circularly. Like the write log it is cut
//! into eight octants; when the reservation frontier enters an octant, READ
//! extents in the octant two ahead are cleared so nothing maps space that is
//! about to be refilled.

use crate::allocator::OCTANTS;
use crate::device::BlockDevice;
use crate::engine::Translator;
use crate::error::{BlockError, BlockResult};
use crate::exchange::{FaultRange, WriteRecord};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::try_join_all;
use logtl_common::{ControlConfig, Extent, SECTORS_PER_PAGE, align_up, sectors_to_bytes};
use std::ops::Range;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where written-back data goes and faulted data comes from
#[async_trait]
pub trait Backend: Send + Sync {
    /// Check the backend can hold a logical window of `logical_sectors`
    fn check(&self, logical_sectors: u64) -> BlockResult<()> {
        let _ = logical_sectors;
        Ok(())
    }

    /// Persist completed writes, reading their data from `cache`.
    ///
    /// Records arrive in completion order and must be applied in that order.
    async fn write_back(&self, cache: &dyn BlockDevice, records: &[WriteRecord]) -> BlockResult<()>;

    /// Fill each extent's cache range with the data for its logical range
    async fn fill(&self, cache: &dyn BlockDevice, extents: &[Extent]) -> BlockResult<()>;
}

/// Backend over a second block device addressed by LBA
#[derive(Clone)]
pub struct FileBackend {
    backing: Arc<dyn BlockDevice>,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("backing_sectors", &self.backing.capacity_sectors())
            .finish()
    }
}

impl FileBackend {
    /// Create a backend writing to and reading from `backing`
    #[must_use]
    pub fn new(backing: Arc<dyn BlockDevice>) -> Self {
        Self { backing }
    }

    /// The backing device
    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BlockDevice> {
        &self.backing
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn check(&self, logical_sectors: u64) -> BlockResult<()> {
        let capacity = self.backing.capacity_sectors();
        if capacity < logical_sectors {
            return Err(BlockError::Backend(format!(
                "backing device of {capacity} sectors cannot hold {logical_sectors} logical sectors"
            )));
        }
        Ok(())
    }

    async fn write_back(&self, cache: &dyn BlockDevice, records: &[WriteRecord]) -> BlockResult<()> {
        // later records may overwrite earlier ones, so keep them in order
        for record in records {
            let data = cache.read_at(record.pba, record.len).await?;
            self.backing.write_at(record.lba, data).await?;
        }
        if !records.is_empty() {
            self.backing.flush().await?;
        }
        Ok(())
    }

    async fn fill(&self, cache: &dyn BlockDevice, extents: &[Extent]) -> BlockResult<()> {
        try_join_all(extents.iter().map(|extent| async move {
            let data = self.backing.read_at(extent.lba, extent.len).await?;
            cache.write_at(extent.pba, data).await
        }))
        .await?;
        Ok(())
    }
}

/// Backend with no storage behind it: writes are dropped, reads are zeros
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend {
    read_back: bool,
}

impl NullBackend {
    #[must_use]
    pub const fn new() -> Self {
        Self { read_back: false }
    }

    /// Still read each completed write from the cache before dropping it
    #[must_use]
    pub const fn with_read_back(mut self, read_back: bool) -> Self {
        self.read_back = read_back;
        self
    }
}

#[async_trait]
impl Backend for NullBackend {
    async fn write_back(&self, cache: &dyn BlockDevice, records: &[WriteRecord]) -> BlockResult<()> {
        if self.read_back {
            for record in records {
                cache.read_at(record.pba, record.len).await?;
            }
        }
        Ok(())
    }

    async fn fill(&self, cache: &dyn BlockDevice, extents: &[Extent]) -> BlockResult<()> {
        try_join_all(extents.iter().map(|extent| {
            let zeros = BytesMut::zeroed(sectors_to_bytes(u64::from(extent.len)) as usize);
            cache.write_at(extent.pba, zeros.freeze())
        }))
        .await?;
        Ok(())
    }
}

// ── Read-cache reservation ──────────────────────────────────────────────

/// Circular allocator for the read-cache region
#[derive(Debug)]
pub struct ReadCacheRegion {
    base: u64,
    bound: u64,
    frontier: u64,
    next_clean: u64,
}

impl ReadCacheRegion {
    /// Create a region over `[base, bound)`
    pub fn new(base: u64, bound: u64) -> BlockResult<Self> {
        if base >= bound || base % SECTORS_PER_PAGE != 0 || bound % SECTORS_PER_PAGE != 0 {
            return Err(BlockError::invalid(format!(
                "read-cache region [{base}, {bound}) must be non-empty and page aligned"
            )));
        }
        if (bound - base) / OCTANTS < SECTORS_PER_PAGE {
            return Err(BlockError::invalid(format!(
                "read-cache region [{base}, {bound}) is too small"
            )));
        }
        Ok(Self {
            base,
            bound,
            frontier: base,
            next_clean: 0,
        })
    }

    /// Reserve room for `sectors`.
    ///
    /// Returns the first sector of the reservation, and the range whose READ
    /// extents must be cleared if this reservation entered a new octant.
    pub fn reserve(&mut self, sectors: u32) -> (u64, Option<Range<u64>>) {
        if self.frontier + u64::from(sectors) >= self.bound {
            self.frontier = self.base;
        }
        let pba = self.frontier;
        self.frontier += align_up(u64::from(sectors), SECTORS_PER_PAGE);
        if self.frontier >= self.bound {
            self.frontier = self.base;
        }

        let span = self.bound - self.base;
        let octant = (self.frontier - self.base) * OCTANTS / span;
        let mut clean = None;
        if (octant + 2) % OCTANTS == self.next_clean {
            let eighth = span / OCTANTS;
            let low = self.base + self.next_clean * eighth;
            clean = Some(low..low + eighth);
            self.next_clean = (self.next_clean + 1) % OCTANTS;
        }
        (pba, clean)
    }

    /// Next reservation position
    #[must_use]
    pub const fn frontier(&self) -> u64 {
        self.frontier
    }

    /// Octant cleared next
    #[must_use]
    pub const fn next_clean(&self) -> u64 {
        self.next_clean
    }
}

// ── Loops ───────────────────────────────────────────────────────────────

/// What the loops did before stopping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSummary {
    /// Write records copied to the backend
    pub written_back: u64,
    /// Extents resolved into the READ index
    pub resolved: u64,
}

/// Handle to the running control-plane tasks
#[derive(Debug)]
pub struct ControlPlane {
    writer: JoinHandle<BlockResult<u64>>,
    reader: JoinHandle<BlockResult<u64>>,
}

impl ControlPlane {
    /// Start the write and read loops for `translator`.
    ///
    /// Both loops run until the translator shuts down or the backend fails.
    pub fn spawn(
        translator: Translator,
        backend: Arc<dyn Backend>,
        config: &ControlConfig,
    ) -> BlockResult<Self> {
        config.validate(translator.config(), translator.device().capacity_sectors())?;
        backend.check(translator.config().logical_sectors)?;
        let region = ReadCacheRegion::new(config.read_cache_base, config.read_cache_bound)?;
        let runtime = Handle::try_current().map_err(|e| {
            BlockError::Internal(format!("control plane needs a tokio runtime: {e}"))
        })?;

        info!(
            "control plane started: batch {}, read cache [{}, {})",
            config.batch, config.read_cache_base, config.read_cache_bound
        );
        let writer = runtime.spawn(write_loop(translator.clone(), backend.clone(), config.batch));
        let reader = runtime.spawn(
            ReadLoop {
                translator,
                backend,
                region,
                batch: config.batch,
            }
            .run(),
        );
        Ok(Self { writer, reader })
    }

    /// Check if both loops have stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.writer.is_finished() && self.reader.is_finished()
    }

    /// Wait for both loops to stop
    pub async fn join(self) -> BlockResult<ControlSummary> {
        let written = self.writer.await.map_err(join_error)?;
        let resolved = self.reader.await.map_err(join_error)?;
        Ok(ControlSummary {
            written_back: written?,
            resolved: resolved?,
        })
    }
}

fn join_error(err: tokio::task::JoinError) -> BlockError {
    BlockError::Internal(format!("control plane task failed: {err}"))
}

async fn write_loop(
    translator: Translator,
    backend: Arc<dyn Backend>,
    batch: usize,
) -> BlockResult<u64> {
    let mut written = 0u64;
    loop {
        let records = match translator.wait_for_writes(batch).await {
            Ok(records) => records,
            Err(BlockError::ShutDown) => break,
            Err(e) => return Err(e),
        };
        if records.is_empty() {
            continue;
        }
        if let Err(e) = backend
            .write_back(translator.device().as_ref(), &records)
            .await
        {
            error!("write-back of {} records failed: {}", records.len(), e);
            return Err(e);
        }
        written += records.len() as u64;
    }
    info!("write loop stopped after {} records", written);
    Ok(written)
}

struct ReadLoop {
    translator: Translator,
    backend: Arc<dyn Backend>,
    region: ReadCacheRegion,
    batch: usize,
}

impl ReadLoop {
    async fn run(mut self) -> BlockResult<u64> {
        let mut resolved = 0u64;
        loop {
            let faults = match self.translator.wait_for_reads(self.batch).await {
                Ok(faults) => faults,
                Err(BlockError::ShutDown) => break,
                Err(e) => return Err(e),
            };
            match self.serve(faults).await {
                Ok(n) => resolved += n,
                Err(BlockError::ShutDown) => break,
                Err(e) => {
                    error!("read loop failed: {}", e);
                    return Err(e);
                }
            }
        }
        info!("read loop stopped after {} extents", resolved);
        Ok(resolved)
    }

    /// Reserve, fill and resolve one batch of faults.
    ///
    /// The batch is cut wherever a reservation triggers a clean, so the
    /// cleared octant is empty before anything is filled into it.
    async fn serve(&mut self, faults: Vec<FaultRange>) -> BlockResult<u64> {
        let mut resolved = 0;
        let mut extents = Vec::with_capacity(faults.len());
        for range in faults {
            let (pba, clean) = self.region.reserve(range.len);
            extents.push(Extent::new(range.lba, pba, range.len));
            if let Some(clean) = clean {
                debug!("read cache cleaning [{}, {})", clean.start, clean.end);
                resolved += self.install(&mut extents, Some(clean)).await?;
            }
        }
        if !extents.is_empty() {
            resolved += self.install(&mut extents, None).await?;
        }
        Ok(resolved)
    }

    async fn install(
        &self,
        extents: &mut Vec<Extent>,
        clean: Option<Range<u64>>,
    ) -> BlockResult<u64> {
        self.backend
            .fill(self.translator.device().as_ref(), extents)
            .await?;
        let count = extents.len() as u64;
        let outcome = self.translator.resolve(extents, clean);
        extents.clear();
        match outcome {
            Ok(()) => Ok(count),
            Err(e) if e.is_retryable() => {
                // unresolved reads were parked again and will come back
                warn!("resolve deferred: {}", e);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use bytes::Bytes;
    use logtl_common::{EngineConfig, MapKind, SECTOR_SIZE};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    const LOGICAL: u64 = 4096;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            logical_sectors: LOGICAL,
            log_base: 0,
            log_bound: 8192,
            max_sectors: 2048,
            max_extents: 4096,
            header_pages: 64,
            max_io_sectors: 64,
        }
    }

    fn control_config() -> ControlConfig {
        ControlConfig {
            batch: 16,
            read_cache_base: 8192,
            read_cache_bound: 16384,
        }
    }

    fn pattern(sectors: u64, seed: u8) -> Bytes {
        (0..sectors * SECTOR_SIZE)
            .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
            .collect::<Vec<u8>>()
            .into()
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .unwrap()
    }

    struct Stack {
        translator: Translator,
        backing: Arc<MemDevice>,
        control: ControlPlane,
    }

    fn file_stack() -> Stack {
        let cache = Arc::new(MemDevice::new(16384));
        let backing = Arc::new(MemDevice::new(LOGICAL));
        let translator = Translator::new(engine_config(), cache).unwrap();
        let backend = Arc::new(FileBackend::new(backing.clone()));
        let control = ControlPlane::spawn(translator.clone(), backend, &control_config()).unwrap();
        Stack {
            translator,
            backing,
            control,
        }
    }

    #[test]
    fn test_region_rejects_bad_bounds() {
        assert!(ReadCacheRegion::new(0, 0).is_err());
        assert!(ReadCacheRegion::new(4, 1028).is_err());
        assert!(ReadCacheRegion::new(0, 32).is_err());
        assert!(ReadCacheRegion::new(0, 1024).is_ok());
    }

    #[test]
    fn test_region_wraps_and_rounds() {
        let mut region = ReadCacheRegion::new(1024, 2048).unwrap();
        assert_eq!(region.reserve(3).0, 1024);
        assert_eq!(region.reserve(8).0, 1032);
        assert_eq!(region.frontier(), 1040);

        // does not fit before the bound
        for _ in 0..7 {
            region.reserve(128);
        }
        assert_eq!(region.frontier(), 1040 + 7 * 128);
        let (pba, _) = region.reserve(128);
        assert_eq!(pba, 1024);
    }

    #[test]
    fn test_region_cleans_two_octants_ahead() {
        let mut region = ReadCacheRegion::new(0, 8192).unwrap();
        let mut cleaned = Vec::new();
        for _ in 0..(2 * 8192 / 64) {
            let (pba, clean) = region.reserve(64);
            if let Some(range) = clean {
                assert_eq!(range.end - range.start, 1024);
                // never clears the octant being filled
                assert!(!range.contains(&pba));
                cleaned.push(range.start / 1024);
            }
        }
        assert_eq!(&cleaned[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(region.next_clean(), cleaned.len() as u64 % 8);
    }

    #[tokio::test]
    async fn test_null_backend_zero_fills() {
        let cache = MemDevice::new(64);
        cache.write_at(8, pattern(8, 1)).await.unwrap();

        NullBackend::new()
            .with_read_back(true)
            .write_back(
                &cache,
                &[WriteRecord {
                    lba: 0,
                    pba: 8,
                    len: 8,
                }],
            )
            .await
            .unwrap();
        assert_eq!(cache.read_at(8, 8).await.unwrap(), pattern(8, 1));

        NullBackend::new()
            .fill(&cache, &[Extent::new(100, 8, 8)])
            .await
            .unwrap();
        assert!(cache.read_at(8, 8).await.unwrap().iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_file_backend_copies_by_address() {
        let cache = MemDevice::new(64);
        let backing = Arc::new(MemDevice::new(256));
        let backend = FileBackend::new(backing.clone());

        cache.write_at(16, pattern(4, 2)).await.unwrap();
        backend
            .write_back(
                &cache,
                &[WriteRecord {
                    lba: 200,
                    pba: 16,
                    len: 4,
                }],
            )
            .await
            .unwrap();
        assert_eq!(backing.read_at(200, 4).await.unwrap(), pattern(4, 2));

        backing.write_at(40, pattern(8, 9)).await.unwrap();
        backend
            .fill(&cache, &[Extent::new(40, 32, 8)])
            .await
            .unwrap();
        assert_eq!(cache.read_at(32, 8).await.unwrap(), pattern(8, 9));
    }

    #[tokio::test]
    async fn test_writes_reach_backing_device() {
        let stack = file_stack();
        let data = pattern(16, 5);
        within(stack.translator.write(320, data.clone()).unwrap())
            .await
            .unwrap();

        within(async {
            while stack.backing.read_at(320, 16).await.unwrap() != data {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        stack.translator.shutdown();
        let summary = within(stack.control.join()).await.unwrap();
        assert_eq!(summary.written_back, 1);
    }

    #[tokio::test]
    async fn test_faulted_read_filled_from_backing() {
        let stack = file_stack();
        stack.backing.write_at(1000, pattern(24, 3)).await.unwrap();

        let read = within(stack.translator.read(1000, 24).unwrap())
            .await
            .unwrap();
        assert_eq!(read, pattern(24, 3));

        // the resolution lands in the read-cache region
        let map = stack.translator.get_map(MapKind::Read, 0, 10);
        assert_eq!(map.total, 1);
        assert!((8192..16384).contains(&map.extents[0].pba));

        // served from the cache now, even if the backing changes underneath
        stack.backing.write_at(1000, pattern(24, 4)).await.unwrap();
        let again = within(stack.translator.read(1000, 24).unwrap())
            .await
            .unwrap();
        assert_eq!(again, pattern(24, 3));

        stack.translator.shutdown();
        let summary = within(stack.control.join()).await.unwrap();
        assert_eq!(summary.resolved, 1);
    }

    #[tokio::test]
    async fn test_join_after_shutdown_with_null_backend() {
        let cache = Arc::new(MemDevice::new(16384));
        let translator = Translator::new(engine_config(), cache).unwrap();
        let control =
            ControlPlane::spawn(translator.clone(), Arc::new(NullBackend::new()), &control_config())
                .unwrap();

        let read = within(translator.read(64, 8).unwrap()).await.unwrap();
        assert!(read.iter().all(|&b| b == 0));

        translator.shutdown();
        let summary = within(control.join()).await.unwrap();
        assert_eq!(summary.written_back, 0);
        assert_eq!(summary.resolved, 1);
    }

    #[tokio::test]
    async fn test_spawn_rejects_overlapping_cache_region() {
        let cache = Arc::new(MemDevice::new(16384));
        let translator = Translator::new(engine_config(), cache).unwrap();
        let config = ControlConfig {
            read_cache_base: 4096,
            ..control_config()
        };
        assert!(
            ControlPlane::spawn(translator.clone(), Arc::new(NullBackend::new()), &config).is_err()
        );

        let small = Arc::new(FileBackend::new(Arc::new(MemDevice::new(LOGICAL / 2))));
        assert!(matches!(
            ControlPlane::spawn(translator, small, &control_config()),
            Err(BlockError::Backend(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_workload_matches_model() {
        let stack = file_stack();
        let mut rng = StdRng::seed_from_u64(0x1061);
        let mut model = vec![0u8; (LOGICAL * SECTOR_SIZE) as usize];

        for _ in 0..800 {
            let len: u32 = rng.gen_range(1..=64);
            let lba = rng.gen_range(0..=LOGICAL - u64::from(len));
            let start = (lba * SECTOR_SIZE) as usize;
            let end = start + (u64::from(len) * SECTOR_SIZE) as usize;

            if rng.gen_bool(0.6) {
                let mut data = vec![0u8; end - start];
                rng.fill(&mut data[..]);
                model[start..end].copy_from_slice(&data);
                within(stack.translator.write(lba, Bytes::from(data)).unwrap())
                    .await
                    .unwrap();
            } else {
                let read = within(stack.translator.read(lba, len).unwrap())
                    .await
                    .unwrap();
                assert_eq!(&read[..], &model[start..end], "read {lba}+{len}");
            }
        }

        let stats = stack.translator.stats();
        assert!(stats.io.wraps > 0);
        assert!(stats.io.trims > 0);
        assert!(stats.io.faults > 0);
        assert_eq!(stats.io.write_errors, 0);

        stack.translator.shutdown();
        within(stack.control.join()).await.unwrap();
    }
}
