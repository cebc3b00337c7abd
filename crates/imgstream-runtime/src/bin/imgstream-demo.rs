#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::info;

use imgstream_core::config::{LoaderConfig, DEFAULT_PARTITION};
use imgstream_runtime::engine::{LoaderMetrics, Sources};
use imgstream_runtime::fetch::HttpImageFetcher;
use imgstream_runtime::sequence::BatchSequence;
use imgstream_store::fs::{FsIndexStore, FsLabelStore};

#[derive(Debug, Parser)]
#[command(name = "imgstream-demo")]
struct Args {
    /// Directory holding `<partition>.tsv` and `image_labels.tsv`.
    #[arg(long, env = "IMGSTREAM_STORE_DIR")]
    store_dir: PathBuf,

    #[arg(long, env = "IMGSTREAM_PARTITION", default_value = DEFAULT_PARTITION)]
    partition: String,

    #[arg(long, env = "IMGSTREAM_TOTAL_SAMPLES")]
    total_samples: u64,

    #[arg(long, env = "IMGSTREAM_NUM_CLASSES")]
    num_classes: usize,

    #[arg(long, env = "IMGSTREAM_BATCH_SIZE", default_value_t = 32)]
    batch_size: usize,

    #[arg(long, env = "IMGSTREAM_LENGTH", default_value_t = 1000)]
    length: usize,

    /// Batches to pull before exiting (capped at `length`).
    #[arg(long, env = "IMGSTREAM_BATCHES", default_value_t = 20)]
    batches: usize,

    #[arg(long, env = "IMGSTREAM_POOL_SIZE", default_value_t = 10)]
    pool_size: usize,

    #[arg(long, env = "IMGSTREAM_IMAGE_HEIGHT", default_value_t = 224)]
    image_height: u32,

    #[arg(long, env = "IMGSTREAM_IMAGE_WIDTH", default_value_t = 224)]
    image_width: u32,

    #[arg(long, env = "IMGSTREAM_BACKOFF_MS", default_value_t = 3000)]
    backoff_ms: u64,

    /// Emit a metrics snapshot every N batches (0 disables).
    #[arg(long, env = "IMGSTREAM_METRICS_EVERY", default_value_t = 5)]
    metrics_every: usize,
}

impl Args {
    fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            num_classes: self.num_classes,
            length: self.length,
            total_samples: self.total_samples,
            partition: self.partition.clone(),
            pool_size: self.pool_size,
            image_height: self.image_height,
            image_width: self.image_width,
            backoff_ms: self.backoff_ms,
            ..LoaderConfig::default()
        }
    }
}

fn emit_metrics_snapshot(metrics: &LoaderMetrics, partition: &str) {
    let latency = metrics.fetch_group_latency.snapshot();
    tracing::info!(
        target: "imgstream_metrics",
        partition = %partition,
        resolve_rounds_submitted = metrics.resolve_rounds_submitted.get(),
        resolve_rounds_failed = metrics.resolve_rounds_failed.get(),
        url_batches_resolved = metrics.url_batches_resolved.get(),
        fetch_groups_submitted = metrics.fetch_groups_submitted.get(),
        fetch_groups_lost = metrics.fetch_groups_lost.get(),
        items_fetched = metrics.items_fetched.get(),
        items_failed = metrics.items_failed.get(),
        label_groups_failed = metrics.label_groups_failed.get(),
        dropped_windows_discarded = metrics.dropped_windows_discarded.get(),
        batches_delivered = metrics.batches_delivered.get(),
        samples_delivered = metrics.samples_delivered.get(),
        ready_slots = metrics.ready_slots.get(),
        ready_slots_high_water = metrics.ready_slots_high_water.get(),
        pending_fetch_groups = metrics.pending_fetch_groups.get(),
        fetch_group_latency_avg_ms = latency.avg_ns() / 1_000_000,
        fetch_group_latency_max_ms = latency.max_ns / 1_000_000,
        "metrics"
    );
}

fn main() -> Result<()> {
    imgstream_observe::logging::init_tracing();
    let args = Args::parse();
    let cfg = args.loader_config();

    let sources = Sources {
        records: Arc::new(FsIndexStore::new(&args.store_dir)),
        labels: Arc::new(FsLabelStore::new(&args.store_dir)),
        fetcher: Arc::new(HttpImageFetcher::new(cfg.image_height, cfg.image_width)?),
    };

    info!(
        store_dir = %args.store_dir.display(),
        partition = %args.partition,
        batch_size = args.batch_size as u64,
        batches = args.batches as u64,
        "starting imgstream demo"
    );

    let start = Instant::now();
    let mut seq = BatchSequence::new(cfg, sources)?;
    let metrics = seq.metrics();
    info!(
        startup_ms = start.elapsed().as_millis() as u64,
        "sequence primed"
    );

    let batches = args.batches.min(seq.length());
    let mut slowest = Duration::ZERO;
    for i in 0..batches {
        let t = Instant::now();
        let batch = seq.get(i)?;
        slowest = slowest.max(t.elapsed());
        info!(
            index = i as u64,
            samples = batch.len() as u64,
            positives = batch.y.iter().map(|y| y.positives() as u64).sum::<u64>(),
            get_ms = t.elapsed().as_millis() as u64,
            "batch"
        );
        if args.metrics_every > 0 && (i + 1) % args.metrics_every == 0 {
            emit_metrics_snapshot(&metrics, &args.partition);
        }
    }

    let elapsed = start.elapsed();
    emit_metrics_snapshot(&metrics, &args.partition);
    seq.close();

    let delivered = metrics.samples_delivered.get();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        delivered as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        delivered_samples = delivered,
        slowest_get_ms = slowest.as_millis() as u64,
        samples_per_sec = throughput,
        "demo complete"
    );
    Ok(())
}
