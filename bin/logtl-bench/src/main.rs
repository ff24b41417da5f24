#![allow(clippy::result_large_err)]
//! logtl bench
//!
//! Stands up a translator and the reference control plane over file-backed
//! or in-memory devices, drives a random write/read workload, and checks
//! every read against what was written.

mod workload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use logtl_common::Config;
use logtl_core::{
    Backend, BlockDevice, ControlPlane, FileBackend, FileDevice, MemDevice, NullBackend,
    Translator,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::workload::WorkloadConfig;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "logtl-bench", about = "Verified workload for the logtl translation layer")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache device holding the write log and read cache (in memory if omitted)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Backing device written back to and filled from (in memory if omitted)
    #[arg(long)]
    backing: Option<PathBuf>,

    /// Drop written-back data and zero-fill faults; disables verification
    #[arg(long)]
    null_backend: bool,

    /// Logical window size in sectors
    #[arg(long)]
    logical_sectors: Option<u64>,

    /// Admission ceiling in log sectors
    #[arg(long)]
    max_sectors: Option<u64>,

    /// Control plane batch size
    #[arg(long)]
    batch: Option<usize>,

    /// Concurrent workers, each on its own slice of the logical window
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 10_000)]
    ops: u64,

    /// Share of writes in percent
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(0..=100))]
    write_percent: u32,

    /// Largest request in sectors (capped by max_io_sectors)
    #[arg(long, default_value_t = 64)]
    max_request: u32,

    /// Workload RNG seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, env = "LOGTL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Merge CLI args into the file config (CLI takes precedence)
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(sectors) = args.logical_sectors {
        config.engine.logical_sectors = sectors;
    }
    if let Some(max) = args.max_sectors {
        config.engine.max_sectors = max;
    }
    if let Some(batch) = args.batch {
        config.control.batch = batch;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Open `path`, creating a file of `sectors` if it does not exist
fn open_device(path: Option<&Path>, sectors: u64) -> Result<Arc<dyn BlockDevice>> {
    let Some(path) = path else {
        return Ok(Arc::new(MemDevice::new(sectors)));
    };
    let device = if path.exists() {
        FileDevice::open(path)
    } else {
        FileDevice::create(path, sectors)
    }
    .with_context(|| format!("open device {}", path.display()))?;
    Ok(Arc::new(device))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    init_tracing(&config.logging.level, args.json_logs);

    info!("Starting logtl bench");

    // ── Devices ───────────────────────────────────────────────────────────────
    let cache_sectors = config.engine.log_bound.max(config.control.read_cache_bound);
    let cache = open_device(args.cache.as_deref(), cache_sectors)?;
    config
        .validate(cache.capacity_sectors())
        .context("invalid configuration")?;

    let backend: Arc<dyn Backend> = if args.null_backend {
        Arc::new(NullBackend::new().with_read_back(true))
    } else {
        let backing = open_device(args.backing.as_deref(), config.engine.logical_sectors)?;
        Arc::new(FileBackend::new(backing))
    };

    // ── Translator + control plane ────────────────────────────────────────────
    let translator =
        Translator::new(config.engine.clone(), cache).context("create translator")?;
    let control = ControlPlane::spawn(translator.clone(), backend, &config.control)
        .context("start control plane")?;

    let workload = WorkloadConfig {
        workers: args.workers,
        ops: args.ops,
        write_percent: args.write_percent,
        max_request: args.max_request.min(config.engine.max_io_sectors).max(1),
        seed: args.seed,
        verify: !args.null_backend,
    };
    info!(
        "Running {} workers x {} ops, {}% writes, requests up to {} sectors",
        workload.workers, workload.ops, workload.write_percent, workload.max_request
    );

    let outcome = tokio::select! {
        outcome = workload::run(&translator, &workload) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    translator.flush().await.context("flush cache device")?;
    let stats = translator.stats();
    translator.shutdown();
    let summary = control.join().await.context("control plane")?;

    let report = outcome?;
    info!(
        "{} writes ({} sectors), {} reads ({} sectors) in {:.2?}",
        report.writes, report.write_sectors, report.reads, report.read_sectors, report.elapsed
    );
    info!(
        "{:.0} IOPS, {:.1} MiB/s, {} retries",
        report.iops(),
        report.mib_per_sec(),
        report.retries
    );
    info!(
        "Log: {} wraps, {} trims ({} extents); {} faults, {} resolved",
        stats.io.wraps,
        stats.io.trims,
        stats.io.trimmed_extents,
        stats.io.faults,
        stats.io.resolved_extents
    );
    info!(
        "Control plane: {} records written back, {} extents resolved",
        summary.written_back, summary.resolved
    );

    if report.mismatches > 0 {
        error!("{} sectors failed verification", report.mismatches);
        anyhow::bail!("verification failed");
    }
    Ok(())
}
