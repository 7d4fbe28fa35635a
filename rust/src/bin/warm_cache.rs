use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use _rs::config::AudioConfig;
use _rs::dataset::Dataset;
use _rs::labels::CharLabels;
use _rs::loader::{Loader, LoaderConfig};
use _rs::parser::SpectrogramParser;
use _rs::sampler::BucketingSampler;

#[derive(Debug, Parser)]
#[command(name = "warm_cache")]
#[command(about = "Pre-compute the canonical spectrogram cache for a manifest", long_about = None)]
struct Args {
    /// Manifest CSV: audio_path,transcript_path[,duration].
    #[arg(long)]
    manifest: PathBuf,

    /// Cache root directory.
    #[arg(long)]
    cache_dir: PathBuf,

    /// Audio config JSON. Augmentation is always disabled.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Label alphabet.
    #[arg(long, default_value = "_'ABCDEFGHIJKLMNOPQRSTUVWXYZ ")]
    labels: String,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, default_value_t = 8)]
    workers: usize,

    #[arg(long)]
    max_items: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.batch_size > 0, "--batch-size must be positive");

    let mut config = match &args.config {
        Some(path) => AudioConfig::from_json_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => AudioConfig::default(),
    };
    // only the canonical variant is cached
    config.augment = false;
    config.noise_dir = None;

    let parser = SpectrogramParser::new(&config, &args.cache_dir).context("build parser")?;
    let dataset = Dataset::from_manifest(
        parser,
        &args.manifest,
        args.max_items,
        Arc::new(CharLabels::new(&args.labels)),
        None,
    )
    .with_context(|| format!("load manifest {}", args.manifest.display()))?;
    let dataset = Arc::new(dataset);

    let bins = BucketingSampler::new(dataset.len(), args.batch_size, None).bins();
    let total = bins.len();
    let started = Instant::now();
    let mut failed = 0usize;

    let loader = Loader::spawn(
        Arc::clone(&dataset),
        bins,
        LoaderConfig {
            n_workers: args.workers.max(1),
            prefetch: args.workers.max(1) * 2,
        },
    );
    for (i, batch) in loader.enumerate() {
        if let Err(e) = batch {
            failed += 1;
            tracing::error!(batch = i, error = %e, "batch failed");
        }
        if (i + 1) % 100 == 0 {
            tracing::info!(done = i + 1, total, "progress");
        }
    }

    let stats = dataset.parser().stats();
    println!(
        "{} samples in {:.1}s: {} hits, {} misses, {} transforms, {} stored, {} failed batches",
        dataset.len(),
        started.elapsed().as_secs_f64(),
        stats.cache_hits,
        stats.cache_misses,
        stats.transforms,
        stats.stores,
        failed,
    );
    Ok(())
}
