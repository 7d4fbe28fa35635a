//! Benchmarks for resampling, spectrogram computation and normalization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::f32::consts::PI;

// Import from our crate (lib name is "_rs" per Cargo.toml)
use _rs::config::Normalization;
use _rs::decode::resample;
use _rs::normalize::normalize;
use _rs::spectrogram::{SpectrogramTransform, StftConfig};

/// Synthetic waveform: a 440Hz tone.
fn make_waveform(sample_rate: usize, seconds: usize) -> Vec<f32> {
    (0..sample_rate * seconds)
        .map(|i| (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

fn bench_spectrogram(c: &mut Criterion) {
    let waveform = make_waveform(16000, 10);
    let transform = SpectrogramTransform::new(StftConfig::default());

    c.bench_function("spectrogram_10s", |b| {
        b.iter(|| transform.magnitude(black_box(&waveform)))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let waveform = make_waveform(16000, 10);
    let spect = SpectrogramTransform::new(StftConfig::default()).magnitude(&waveform);

    let mut group = c.benchmark_group("normalize_10s");
    for (name, mode) in [
        ("mean", Normalization::Mean),
        ("norm", Normalization::Norm),
        ("frame", Normalization::Frame),
        ("max_frame", Normalization::MaxFrame),
    ] {
        group.bench_function(name, |b| b.iter(|| normalize(black_box(&spect), mode)));
    }
    group.finish();
}

fn bench_resample(c: &mut Criterion) {
    let waveform = make_waveform(44100, 10);

    c.bench_function("resample_44k_to_16k_10s", |b| {
        b.iter(|| resample(black_box(&waveform), 44100, 16000).unwrap())
    });
}

criterion_group!(benches, bench_spectrogram, bench_normalize, bench_resample);
criterion_main!(benches);
