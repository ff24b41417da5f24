//! Translator engine
//!
//! Ties the components together:
//!
//! ```text
//!  write ─► AdmissionController ─► LogAllocator ─► device (header + data)
//!              │ queued                               │ both landed
//!              ▼                                      ▼
//!          undone writes                     WRITE index commit
//!              ▲ drain                                │
//!              └──── wait_for_writes ◄── done queue ◄─┘
//!
//!  read ─► route_read ─► mapped segments ─► device
//!                   └──► faults ─► wait_for_reads ─► resolve ─► replay
//! ```
//!
//! Client entry points never block. They validate, enqueue or spawn, and
//! return a [`PendingIo`] that resolves when the request completes.

use crate::admission::{Admission, AdmissionController};
use crate::allocator::{self, LogAllocator, WrapMarker, log_footprint};
use crate::device::BlockDevice;
use crate::error::{BlockError, BlockResult};
use crate::exchange::{FaultExchange, FaultRange, WriteRecord};
use crate::index::{ExtentIndex, ExtentPool};
use crate::journal::JournalHeader;
use crate::router::{self, ReadSegment};
use crate::stats::{EngineStats, IoCounters};

use bytes::{Bytes, BytesMut};
use logtl_common::{EngineConfig, Extent, MapKind, PBA_NONE, SECTOR_SIZE, sectors_to_bytes};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, error, info, warn};

/// Outcome of an accepted request, resolved asynchronously
#[derive(Debug)]
#[must_use = "the request outcome is only observed by awaiting it"]
pub struct PendingIo<T> {
    rx: oneshot::Receiver<BlockResult<T>>,
}

impl<T> Future for PendingIo<T> {
    type Output = BlockResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender means the translator went away mid-request
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BlockError::ShutDown)))
    }
}

fn pending_io<T>() -> (oneshot::Sender<BlockResult<T>>, PendingIo<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, PendingIo { rx })
}

/// One page of index contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapPage {
    pub extents: Vec<Extent>,
    /// Extents in the whole index
    pub total: usize,
}

#[derive(Debug)]
struct PendingWrite {
    lba: u64,
    data: Bytes,
    done: oneshot::Sender<BlockResult<()>>,
}

impl PendingWrite {
    fn sectors(&self) -> u32 {
        (self.data.len() as u64 / SECTOR_SIZE) as u32
    }
}

/// A client read being filled from one or more segments
#[derive(Debug)]
struct ReadAssembly {
    lba: u64,
    sectors: u32,
    buf: Mutex<BytesMut>,
    remaining: AtomicU64,
    done: Mutex<Option<oneshot::Sender<BlockResult<Bytes>>>>,
}

impl ReadAssembly {
    fn new(lba: u64, sectors: u32, done: oneshot::Sender<BlockResult<Bytes>>) -> Self {
        Self {
            lba,
            sectors,
            buf: Mutex::new(BytesMut::zeroed(sectors_to_bytes(u64::from(sectors)) as usize)),
            remaining: AtomicU64::new(u64::from(sectors)),
            done: Mutex::new(Some(done)),
        }
    }

    /// Copy a finished segment in; true if this completed the read
    fn fill(&self, lba: u64, data: &[u8]) -> bool {
        let offset = sectors_to_bytes(lba - self.lba) as usize;
        self.buf.lock()[offset..offset + data.len()].copy_from_slice(data);

        let sectors = data.len() as u64 / SECTOR_SIZE;
        if self.remaining.fetch_sub(sectors, Ordering::AcqRel) != sectors {
            return false;
        }
        let Some(done) = self.done.lock().take() else {
            return false;
        };
        let buf = std::mem::take(&mut *self.buf.lock()).freeze();
        let _ = done.send(Ok(buf));
        true
    }

    /// Fail the read; true if this was the first outcome
    fn fail(&self, err: BlockError) -> bool {
        match self.done.lock().take() {
            Some(done) => {
                let _ = done.send(Err(err));
                true
            }
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.done.lock().is_none()
    }
}

struct Inner {
    config: EngineConfig,
    device: Arc<dyn BlockDevice>,
    runtime: Handle,
    pool: Arc<ExtentPool>,
    writes: ExtentIndex,
    reads: ExtentIndex,
    log: LogAllocator,
    admission: AdmissionController<PendingWrite>,
    exchange: FaultExchange<Arc<ReadAssembly>>,
    header_pages: Arc<Semaphore>,
    counters: IoCounters,
}

/// Log-structured address translator
#[derive(Clone)]
pub struct Translator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("log_base", &self.inner.config.log_base)
            .field("log_bound", &self.inner.config.log_bound)
            .field("logical_sectors", &self.inner.config.logical_sectors)
            .finish_non_exhaustive()
    }
}

impl Translator {
    /// Create a translator over `device`.
    ///
    /// Must be called from within a tokio runtime; device I/O is spawned on it.
    pub fn new(config: EngineConfig, device: Arc<dyn BlockDevice>) -> BlockResult<Self> {
        config.validate(device.capacity_sectors())?;
        let runtime = Handle::try_current()
            .map_err(|e| BlockError::Internal(format!("translator needs a tokio runtime: {e}")))?;

        let pool = Arc::new(ExtentPool::new(config.max_extents));
        let inner = Inner {
            device,
            runtime,
            writes: ExtentIndex::new(MapKind::Write, pool.clone()),
            reads: ExtentIndex::new(MapKind::Read, pool.clone()),
            pool,
            log: LogAllocator::new(config.log_base, config.log_bound)?,
            admission: AdmissionController::new(config.max_sectors),
            exchange: FaultExchange::new(),
            header_pages: Arc::new(Semaphore::new(config.header_pages)),
            counters: IoCounters::new(),
            config,
        };
        info!(
            "translator ready: log [{}, {}), {} logical sectors, admission ceiling {}",
            inner.config.log_base,
            inner.config.log_bound,
            inner.config.logical_sectors,
            inner.config.max_sectors
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The cache device
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.inner.device
    }

    // ── Client entry points ─────────────────────────────────────────────

    /// Write `data` at `lba`.
    ///
    /// The returned future resolves once the data and its header have landed
    /// and the mapping is visible to reads.
    pub fn write(&self, lba: u64, data: Bytes) -> BlockResult<PendingIo<()>> {
        let sectors = self.check_write(lba, &data)?;
        let (done, pending) = pending_io();
        let write = PendingWrite { lba, data, done };

        match self.inner.admission.admit(write, log_footprint(sectors)) {
            Admission::Admitted(write) => {
                let submitted = self
                    .inner
                    .acquire_header_page()
                    .and_then(|page| self.inner.submit_write(write, page).map_err(|(_, err)| err));
                if let Err(err) = submitted {
                    self.inner.admission.refund(log_footprint(sectors));
                    return Err(err);
                }
            }
            Admission::Queued => {
                debug!("write {}+{} queued at admission ceiling", lba, sectors);
            }
            Admission::Closed(_) => return Err(BlockError::ShutDown),
        }
        Ok(pending)
    }

    /// Read `sectors` at `lba`.
    ///
    /// Unmapped parts are parked until the control plane resolves them.
    pub fn read(&self, lba: u64, sectors: u32) -> BlockResult<PendingIo<Bytes>> {
        self.check_range(lba, sectors)?;
        if self.inner.exchange.is_shut_down() {
            return Err(BlockError::ShutDown);
        }
        let (done, pending) = pending_io();
        let assembly = Arc::new(ReadAssembly::new(lba, sectors, done));
        let segments = self.route_read(lba, sectors);
        self.inner.dispatch(&assembly, segments);
        Ok(pending)
    }

    /// Flush the cache device
    pub fn flush(&self) -> PendingIo<()> {
        let (done, pending) = pending_io();
        let device = self.inner.device.clone();
        self.inner.runtime.spawn(async move {
            let _ = done.send(device.flush().await);
        });
        pending
    }

    /// Split a read into mapped and faulted segments without issuing it
    #[must_use]
    pub fn route_read(&self, lba: u64, sectors: u32) -> Vec<ReadSegment> {
        router::route_read(&self.inner.writes, &self.inner.reads, lba, sectors)
    }

    // ── Control plane ───────────────────────────────────────────────────

    /// Release writes held at the admission ceiling, then wait for completed
    /// writes and take up to `max` of them.
    ///
    /// Admission is charged in log sectors (data rounded to pages plus the
    /// header). Writes returned here are credited back on the next call, once
    /// the caller has had the chance to persist them elsewhere.
    pub async fn wait_for_writes(&self, max: usize) -> BlockResult<Vec<WriteRecord>> {
        let released = self.inner.admission.drain();
        if !released.is_empty() {
            debug!("replaying {} queued writes", released.len());
        }
        for write in released {
            self.inner.replay_write(write);
        }

        let records = self.inner.exchange.wait_for_writes(max).await?;
        let delivered = records.iter().map(|r| log_footprint(r.len)).sum();
        self.inner.admission.mark_delivered(delivered);
        Ok(records)
    }

    /// Wait for faulted reads and take up to `max` ranges
    pub async fn wait_for_reads(&self, max: usize) -> BlockResult<Vec<FaultRange>> {
        self.inner.exchange.wait_for_reads(max).await
    }

    /// Install resolutions into the READ index and replay faulted reads.
    ///
    /// Every extent is validated before any is applied. An extent carrying
    /// [`PBA_NONE`] unmaps its range instead. READ extents whose physical
    /// range overlaps `clear` are dropped afterwards.
    pub fn resolve(&self, extents: &[Extent], clear: Option<Range<u64>>) -> BlockResult<()> {
        if self.inner.exchange.is_shut_down() {
            return Err(BlockError::ShutDown);
        }
        let capacity = self.inner.device.capacity_sectors();
        for extent in extents {
            let len = u64::from(extent.len);
            let in_window = extent
                .lba
                .checked_add(len)
                .is_some_and(|end| end <= self.inner.config.logical_sectors);
            let on_device = extent.pba == PBA_NONE
                || extent
                    .pba
                    .checked_add(len)
                    .is_some_and(|end| end <= capacity);
            if extent.len == 0 || !in_window || !on_device {
                warn!("resolve: rejecting invalid {:?}", extent);
                return Err(BlockError::invalid(format!("invalid resolution {extent:?}")));
            }
        }
        if let Some(range) = &clear
            && range.start > range.end
        {
            return Err(BlockError::invalid(format!(
                "invalid clear range {}..{}",
                range.start, range.end
            )));
        }

        let mut outcome = Ok(());
        let mut applied = 0u64;
        for extent in extents {
            let pba = (extent.pba != PBA_NONE).then_some(extent.pba);
            if let Err(err) = self.inner.reads.update_range(extent.lba, pba, extent.len) {
                outcome = Err(err);
                break;
            }
            applied += 1;
        }
        self.inner.counters.record_resolved(applied);

        let faulted = self.inner.exchange.take_faulted();
        debug!(
            "resolved {} extents, replaying {} faulted reads",
            applied,
            faulted.len()
        );
        for (range, assembly) in faulted {
            if assembly.is_settled() {
                continue;
            }
            let segments = self.route_read(range.lba, range.len);
            self.inner.dispatch(&assembly, segments);
        }

        if let Some(range) = clear
            && range.start < range.end
        {
            let dropped = self.inner.reads.remove_range_by_pba(range.start, range.end);
            debug!(
                "cleared {} read extents in [{}, {})",
                dropped.len(),
                range.start,
                range.end
            );
        }
        outcome
    }

    /// Up to `max` extents of one index starting at `start`
    #[must_use]
    pub fn get_map(&self, kind: MapKind, start: u64, max: usize) -> MapPage {
        let index = match kind {
            MapKind::Write => &self.inner.writes,
            MapKind::Read => &self.inner.reads,
        };
        let map = index.lock();
        MapPage {
            extents: map.extents_from(start, max),
            total: map.len(),
        }
    }

    /// Counters and queue depths
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queues: self.inner.exchange.depths(),
            admission: self.inner.admission.stats(),
            frontier: self.inner.log.frontier(),
            trim_cursor: self.inner.log.trim_cursor(),
            write_extents: self.inner.writes.len(),
            read_extents: self.inner.reads.len(),
            extent_nodes: self.inner.pool.in_use(),
            io: self.inner.counters.snapshot(),
        }
    }

    /// Refuse new requests and fail everything still queued
    pub fn shutdown(&self) {
        let writes = self.inner.admission.close();
        let reads = self.inner.exchange.shutdown();
        info!(
            "translator shutting down: failing {} queued writes, {} parked reads",
            writes.len(),
            reads.len()
        );
        for write in writes {
            let _ = write.done.send(Err(BlockError::ShutDown));
        }
        for read in reads {
            if read.fail(BlockError::ShutDown) {
                self.inner.counters.record_read_error();
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────────

    fn check_range(&self, lba: u64, sectors: u32) -> BlockResult<()> {
        let config = &self.inner.config;
        if sectors == 0 {
            return Err(BlockError::invalid("zero-length request"));
        }
        if sectors > config.max_io_sectors {
            return Err(BlockError::invalid(format!(
                "request of {sectors} sectors exceeds limit {}",
                config.max_io_sectors
            )));
        }
        if lba
            .checked_add(u64::from(sectors))
            .is_none_or(|end| end > config.logical_sectors)
        {
            return Err(BlockError::invalid(format!(
                "range {lba}+{sectors} outside logical window of {} sectors",
                config.logical_sectors
            )));
        }
        Ok(())
    }

    fn check_write(&self, lba: u64, data: &Bytes) -> BlockResult<u32> {
        let len = data.len() as u64;
        if len % SECTOR_SIZE != 0 {
            return Err(BlockError::invalid(format!(
                "write of {len} bytes is not sector aligned"
            )));
        }
        let sectors = u32::try_from(len / SECTOR_SIZE)
            .map_err(|_| BlockError::invalid(format!("write of {len} bytes is too large")))?;
        self.check_range(lba, sectors)?;
        Ok(sectors)
    }
}

impl Inner {
    fn acquire_header_page(&self) -> BlockResult<OwnedSemaphorePermit> {
        self.header_pages.clone().try_acquire_owned().map_err(|_| {
            warn!("header page pool exhausted, refusing write");
            BlockError::TryLater("header pages")
        })
    }

    /// Submit a write released from the undone queue; errors go to its waiter
    fn replay_write(self: &Arc<Self>, write: PendingWrite) {
        let outcome = match self.acquire_header_page() {
            Ok(page) => self.submit_write(write, page),
            Err(err) => Err((write, err)),
        };
        if let Err((write, err)) = outcome {
            self.admission.refund(log_footprint(write.sectors()));
            let _ = write.done.send(Err(err));
        }
    }

    /// Allocate log space and issue the header and data writes.
    ///
    /// The WRITE index is updated only once both have landed, and the
    /// allocation stays pinned until then. A write refused here is handed
    /// back with its admission charge still held.
    fn submit_write(
        self: &Arc<Self>,
        write: PendingWrite,
        page: OwnedSemaphorePermit,
    ) -> Result<(), (PendingWrite, BlockError)> {
        let sectors = write.sectors();
        let alloc = match self.log.allocate(sectors, |range| {
            let (dropped, _) = allocator::reclaim(&self.writes, &self.reads, range);
            self.counters.record_trim(dropped as u64);
        }) {
            Ok(alloc) => alloc,
            Err(err) => return Err((write, err)),
        };

        let marker = alloc.wrap.and_then(|marker| self.encode_wrap_marker(marker));
        let header = u16::try_from(sectors)
            .map_err(|_| BlockError::Journal(format!("{sectors} sectors overflow a header")))
            .and_then(|n| JournalHeader::data(alloc.sequence, write.lba, n).encode());
        let header = match header {
            Ok(header) => header,
            Err(err) => {
                error!("cannot frame write {}+{}: {}", write.lba, sectors, err);
                self.log.release(&alloc);
                self.counters.record_write_error();
                return Err((write, err));
            }
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let PendingWrite { lba, data, done } = write;
            let device = &inner.device;

            let wrap = async {
                match marker {
                    Some((pba, page)) => device.write_at(pba, page).await,
                    None => Ok(()),
                }
            };
            let (wrap_result, header_result, data_result) = tokio::join!(
                wrap,
                device.write_at(alloc.header_pba, header),
                device.write_at(alloc.data_pba, data),
            );
            drop(page);

            if let Err(err) = wrap_result {
                warn!("wrap marker write failed: {}", err);
            }
            let result = header_result.and(data_result).and_then(|()| {
                inner
                    .writes
                    .update_range(lba, Some(alloc.data_pba), sectors)
            });
            inner.log.release(&alloc);

            match result {
                Ok(()) => {
                    inner.counters.record_write(u64::from(sectors));
                    inner.exchange.push_done(WriteRecord {
                        lba,
                        pba: alloc.data_pba,
                        len: sectors,
                    });
                    let _ = done.send(Ok(()));
                }
                Err(err) => {
                    if err.is_io_error() {
                        error!("write {}+{} at {} failed: {}", lba, sectors, alloc.data_pba, err);
                    } else {
                        warn!("write {}+{} not committed: {}", lba, sectors, err);
                    }
                    inner.counters.record_write_error();
                    inner.admission.refund(log_footprint(sectors));
                    let _ = done.send(Err(err));
                    // nothing may complete to wake the control plane
                    for queued in inner.admission.release() {
                        inner.replay_write(queued);
                    }
                }
            }
        });
        Ok(())
    }

    fn encode_wrap_marker(&self, marker: WrapMarker) -> Option<(u64, Bytes)> {
        self.counters.record_wrap();
        let dead = u16::try_from(marker.sectors).unwrap_or(u16::MAX);
        match JournalHeader::wrap_marker(marker.sequence, dead).encode() {
            Ok(page) => Some((marker.pba, page)),
            Err(err) => {
                warn!("cannot encode wrap marker at {}: {}", marker.pba, err);
                None
            }
        }
    }

    /// Issue mapped segments to the device and park faults
    fn dispatch(self: &Arc<Self>, assembly: &Arc<ReadAssembly>, segments: Vec<ReadSegment>) {
        for segment in segments {
            match segment {
                ReadSegment::Mapped { lba, pba, len } => {
                    let inner = Arc::clone(self);
                    let assembly = Arc::clone(assembly);
                    self.runtime.spawn(async move {
                        match inner.device.read_at(pba, len).await {
                            Ok(data) => {
                                if assembly.fill(lba, &data) {
                                    inner
                                        .counters
                                        .record_read(u64::from(assembly.sectors));
                                }
                            }
                            Err(err) => {
                                error!("read {}+{} at {} failed: {}", lba, len, pba, err);
                                if assembly.fail(err) {
                                    inner.counters.record_read_error();
                                }
                            }
                        }
                    });
                }
                ReadSegment::Fault { lba, len } => {
                    self.counters.record_fault();
                    let range = FaultRange { lba, len };
                    if let Err(assembly) = self.exchange.park(range, Arc::clone(assembly))
                        && assembly.fail(BlockError::ShutDown)
                    {
                        self.counters.record_read_error();
                    }
                }
            }
        }
    }
}
