//! Verified random workload
//!
//! Each worker owns a disjoint slice of the logical window and keeps a
//! generation number per sector. Every written sector carries its LBA and
//! generation, so a read can be checked without keeping the data around.

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::join_all;
use logtl_common::SECTOR_SIZE;
use logtl_core::{BlockResult, PendingIo, Translator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mismatches reported individually before going quiet
const REPORTED_MISMATCHES: u64 = 8;

/// Workload shape
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Concurrent workers
    pub workers: usize,
    /// Operations per worker
    pub ops: u64,
    /// Share of writes, 0..=100
    pub write_percent: u32,
    /// Largest request in sectors
    pub max_request: u32,
    pub seed: u64,
    /// Check read data against the per-sector model
    pub verify: bool,
}

/// Totals across all workers
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadReport {
    pub writes: u64,
    pub reads: u64,
    pub write_sectors: u64,
    pub read_sectors: u64,
    /// Sectors whose content did not match the model
    pub mismatches: u64,
    /// Requests resubmitted after a retryable refusal
    pub retries: u64,
    pub elapsed: Duration,
}

impl WorkloadReport {
    fn add(&mut self, other: &Self) {
        self.writes += other.writes;
        self.reads += other.reads;
        self.write_sectors += other.write_sectors;
        self.read_sectors += other.read_sectors;
        self.mismatches += other.mismatches;
        self.retries += other.retries;
    }

    /// Requests per second
    #[must_use]
    pub fn iops(&self) -> f64 {
        (self.writes + self.reads) as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    /// Throughput in MiB/s over reads and writes
    #[must_use]
    pub fn mib_per_sec(&self) -> f64 {
        let bytes = (self.write_sectors + self.read_sectors) * SECTOR_SIZE;
        bytes as f64 / (1024.0 * 1024.0) / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Content of one sector at `lba` written in generation `generation`
fn sector_content(buf: &mut BytesMut, lba: u64, generation: u32) {
    buf.put_u64_le(lba);
    buf.put_u32_le(generation);
    let seed = (lba as u8) ^ (generation as u8);
    for i in 12..SECTOR_SIZE as usize {
        buf.put_u8(seed.wrapping_add(i as u8));
    }
}

fn write_payload(lba: u64, sectors: u32, generation: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity((u64::from(sectors) * SECTOR_SIZE) as usize);
    for i in 0..u64::from(sectors) {
        sector_content(&mut buf, lba + i, generation);
    }
    buf.freeze()
}

/// Submit a request, backing off while the translator says try later.
///
/// A queued write can also be refused once it is released, so the awaited
/// outcome is checked too.
async fn submit<T>(
    retries: &mut u64,
    mut issue: impl FnMut() -> BlockResult<PendingIo<T>>,
) -> BlockResult<T> {
    loop {
        let outcome = match issue() {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        match outcome {
            Err(e) if e.is_retryable() => {
                *retries += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            outcome => return outcome,
        }
    }
}

struct Worker {
    translator: Translator,
    id: usize,
    start: u64,
    generations: Vec<u32>,
    next_generation: u32,
    rng: StdRng,
    report: WorkloadReport,
}

impl Worker {
    fn new(translator: Translator, id: usize, start: u64, sectors: u64, seed: u64) -> Self {
        Self {
            translator,
            id,
            start,
            generations: vec![0; sectors as usize],
            next_generation: 0,
            rng: StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            report: WorkloadReport::default(),
        }
    }

    async fn run(mut self, config: WorkloadConfig) -> Result<WorkloadReport> {
        let sectors = self.generations.len() as u64;
        let max_len = u64::from(config.max_request).min(sectors);
        for _ in 0..config.ops {
            let len = self.rng.gen_range(1..=max_len);
            let offset = self.rng.gen_range(0..=sectors - len);
            let len = len as u32;
            if self.rng.gen_range(0..100) < config.write_percent {
                self.write(offset, len).await?;
            } else {
                self.read(offset, len, config.verify).await?;
            }
        }
        debug!("worker {} done: {:?}", self.id, self.report);
        Ok(self.report)
    }

    async fn write(&mut self, offset: u64, len: u32) -> Result<()> {
        let lba = self.start + offset;
        self.next_generation += 1;
        let generation = self.next_generation;
        let data = write_payload(lba, len, generation);

        let translator = &self.translator;
        submit(&mut self.report.retries, || translator.write(lba, data.clone()))
            .await
            .with_context(|| format!("write {lba}+{len}"))?;

        let range = offset as usize..offset as usize + len as usize;
        self.generations[range].fill(generation);
        self.report.writes += 1;
        self.report.write_sectors += u64::from(len);
        Ok(())
    }

    async fn read(&mut self, offset: u64, len: u32, verify: bool) -> Result<()> {
        let lba = self.start + offset;
        let translator = &self.translator;
        let data = submit(&mut self.report.retries, || translator.read(lba, len))
            .await
            .with_context(|| format!("read {lba}+{len}"))?;

        self.report.reads += 1;
        self.report.read_sectors += u64::from(len);
        if !verify {
            return Ok(());
        }

        let mut expected = BytesMut::with_capacity(SECTOR_SIZE as usize);
        for (i, actual) in data.chunks(SECTOR_SIZE as usize).enumerate() {
            let generation = self.generations[offset as usize + i];
            // never written here: whatever the backing held
            if generation == 0 {
                continue;
            }
            expected.clear();
            sector_content(&mut expected, lba + i as u64, generation);
            if actual != &expected[..] {
                self.report.mismatches += 1;
                if self.report.mismatches <= REPORTED_MISMATCHES {
                    warn!(
                        "worker {}: sector {} does not match generation {}",
                        self.id,
                        lba + i as u64,
                        generation
                    );
                }
            }
        }
        Ok(())
    }
}

/// Run the workload to completion
pub async fn run(translator: &Translator, config: &WorkloadConfig) -> Result<WorkloadReport> {
    let logical = translator.config().logical_sectors;
    let workers = config.workers.max(1) as u64;
    let stripe = logical / workers;
    if stripe == 0 {
        anyhow::bail!("{workers} workers do not fit {logical} logical sectors");
    }

    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let worker = Worker::new(
                translator.clone(),
                id as usize,
                id * stripe,
                stripe,
                config.seed,
            );
            tokio::spawn(worker.run(config.clone()))
        })
        .collect();

    let mut report = WorkloadReport::default();
    for outcome in join_all(handles).await {
        let worker = outcome.context("worker task panicked")??;
        report.add(&worker);
    }
    report.elapsed = started.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logtl_common::{ControlConfig, EngineConfig};
    use logtl_core::{ControlPlane, FileBackend, MemDevice, NullBackend};
    use std::sync::Arc;

    fn engine() -> EngineConfig {
        EngineConfig {
            logical_sectors: 8192,
            log_base: 0,
            log_bound: 8192,
            max_sectors: 2048,
            max_extents: 8192,
            header_pages: 32,
            max_io_sectors: 64,
        }
    }

    fn control() -> ControlConfig {
        ControlConfig {
            batch: 32,
            read_cache_base: 8192,
            read_cache_bound: 16384,
        }
    }

    fn workload(verify: bool) -> WorkloadConfig {
        WorkloadConfig {
            workers: 4,
            ops: 300,
            write_percent: 60,
            max_request: 64,
            seed: 7,
            verify,
        }
    }

    #[test]
    fn test_sector_content_is_tagged() {
        let data = write_payload(100, 2, 9);
        assert_eq!(data.len(), 1024);
        assert_eq!(&data[..8], &100u64.to_le_bytes());
        assert_eq!(&data[8..12], &9u32.to_le_bytes());
        assert_eq!(&data[512..520], &101u64.to_le_bytes());
        assert_ne!(write_payload(100, 1, 9), write_payload(100, 1, 10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workload_verifies_with_backing() {
        let cache = Arc::new(MemDevice::new(16384));
        let backing = Arc::new(MemDevice::new(8192));
        let translator = Translator::new(engine(), cache).unwrap();
        let control = ControlPlane::spawn(
            translator.clone(),
            Arc::new(FileBackend::new(backing)),
            &control(),
        )
        .unwrap();

        let report = run(&translator, &workload(true)).await.unwrap();
        assert_eq!(report.writes + report.reads, 1200);
        assert_eq!(report.mismatches, 0);
        assert!(translator.stats().io.trims > 0);

        translator.shutdown();
        let summary = control.join().await.unwrap();
        assert!(summary.written_back > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workload_runs_against_null_backend() {
        let cache = Arc::new(MemDevice::new(16384));
        let translator = Translator::new(engine(), cache).unwrap();
        let control =
            ControlPlane::spawn(translator.clone(), Arc::new(NullBackend::new()), &control())
                .unwrap();

        let report = run(&translator, &workload(false)).await.unwrap();
        assert!(report.writes > 0);
        assert!(report.reads > 0);
        assert!(report.iops() > 0.0);

        translator.shutdown();
        control.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_more_workers_than_sectors() {
        let cache = Arc::new(MemDevice::new(16384));
        let translator = Translator::new(engine(), cache).unwrap();
        let config = WorkloadConfig {
            workers: 10_000,
            ..workload(false)
        };
        assert!(run(&translator, &config).await.is_err());
    }
}
