//! Audio path -> normalized feature tensor, through the spectrogram cache.
//!
//! The cache holds raw magnitudes for the canonical tempo only, computed from
//! a plain decode with no gain or noise, so any worker that computes a key
//! produces the same array. Augmented variants and noisy samples are
//! recomputed on every call.

use ndarray::Array2;
use rand::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::augment::{AugmentationEngine, NoiseInjector, TempoVariant};
use crate::cache::SpectrogramCache;
use crate::config::{AudioConfig, ChannelSelector, Normalization};
use crate::decode::load_audio;
use crate::error::{Error, Result};
use crate::normalize::{jitter, normalize};
use crate::sox::{AudioTool, Sox};
use crate::spectrogram::{SpectrogramTransform, StftConfig};

/// Counters for cache behavior, shared by every thread using the parser.
#[derive(Debug, Default)]
pub struct ParserStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    transforms: AtomicU64,
    stores: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// STFT computations.
    pub transforms: u64,
    /// Entries written to the cache.
    pub stores: u64,
}

impl ParserStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            transforms: self.transforms.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }
}

pub struct SpectrogramParser {
    sample_rate: u32,
    augment: bool,
    noise_prob: f64,
    normalization: Normalization,
    channel: ChannelSelector,
    transform: SpectrogramTransform,
    cache: SpectrogramCache,
    augmenter: AugmentationEngine,
    noise: Option<NoiseInjector>,
    interrupt: Arc<AtomicBool>,
    stats: ParserStats,
}

impl SpectrogramParser {
    /// Parser backed by the sox command-line utility.
    pub fn new<P: Into<PathBuf>>(config: &AudioConfig, cache_root: P) -> Result<Self> {
        Self::with_tool(config, cache_root, Arc::new(Sox))
    }

    pub fn with_tool<P: Into<PathBuf>>(
        config: &AudioConfig,
        cache_root: P,
        tool: Arc<dyn AudioTool>,
    ) -> Result<Self> {
        config.validate()?;
        let channel = config.channel_selector();

        let noise = match &config.noise_dir {
            Some(dir) => Some(NoiseInjector::new(
                dir,
                config.sample_rate,
                config.noise_levels,
                Arc::clone(&tool),
            )?),
            None => None,
        };

        Ok(Self {
            sample_rate: config.sample_rate,
            augment: config.augment,
            noise_prob: config.noise_prob,
            normalization: config.normalization()?,
            channel,
            transform: SpectrogramTransform::new(StftConfig::from(config)),
            cache: SpectrogramCache::new(cache_root),
            augmenter: AugmentationEngine::new(tool, config.sample_rate, config.gain_range, channel),
            noise,
            interrupt: Arc::new(AtomicBool::new(false)),
            stats: ParserStats::default(),
        })
    }

    /// Share a cancellation flag with the caller. Raising it aborts cache
    /// writes started through [`parse_audio`](Self::parse_audio).
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> &Arc<AtomicBool> {
        &self.interrupt
    }

    pub fn set_augment(&mut self, augment: bool) {
        self.augment = augment;
    }

    pub fn cache(&self) -> &SpectrogramCache {
        &self.cache
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Normalized features [161, frames] for the audio at `path`.
    pub fn parse_audio(&self, path: &Path) -> Result<Array2<f32>> {
        self.parse_audio_with_cancel(path, &self.interrupt)
    }

    /// As [`parse_audio`](Self::parse_audio), but a cache write is aborted
    /// when `cancel` is raised instead of the parser's own interrupt flag.
    pub fn parse_audio_with_cancel(&self, path: &Path, cancel: &AtomicBool) -> Result<Array2<f32>> {
        let mut rng = thread_rng();
        let tempo = if self.augment {
            TempoVariant::random(&mut rng)
        } else {
            TempoVariant::Normal
        };

        let lookup = self.cache.load(path, tempo, self.channel)?;
        let raw = match lookup.spect {
            Some(spect) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                spect
            }
            None => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

                let mut samples = if tempo.is_canonical() {
                    load_audio(path, self.channel, self.sample_rate)?
                } else {
                    self.augmenter.load_augmented(path, tempo, &mut rng)?
                };

                let mut noisy = false;
                if let Some(noise) = &self.noise {
                    if rng.gen_bool(self.noise_prob) {
                        noise.inject_noise(&mut samples, &mut rng)?;
                        noisy = true;
                    }
                }

                let spect = self.audio_to_spectrogram(&samples);

                if tempo.is_canonical() && !noisy {
                    match self.cache.store(&lookup.key, &spect, cancel) {
                        Ok(true) => {
                            self.stats.stores.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e @ Error::Interrupted(_)) => return Err(e),
                        Err(e) => {
                            tracing::warn!(path = %lookup.path.display(), error = %e, "failed to write cache entry");
                        }
                    }
                }
                spect
            }
        };

        let mut spect = normalize(&raw, self.normalization);
        if self.augment && self.normalization == Normalization::MaxFrame {
            jitter(&mut spect, &mut rng);
        }
        Ok(spect)
    }

    /// Raw magnitude spectrogram [161, frames] of mono samples.
    pub fn audio_to_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        self.stats.transforms.fetch_add(1, Ordering::Relaxed);
        self.transform.magnitude(samples)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::augment::tests::MockTool;
    use crate::cache::CacheKey;
    use crate::spectrogram::FREQ_BINS;
    use ndarray_npy::read_npy;
    use std::f32::consts::PI;

    /// Mono 16-bit WAV: a tone whose pitch depends on `freq`.
    pub(crate) fn write_tone(path: &Path, seconds: f32, freq: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let n = (seconds * 16000.0) as usize;
        for i in 0..n {
            let s = (2.0 * PI * freq * i as f32 / 16000.0).sin() * 0.5;
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn config(normalize: &str, augment: bool) -> AudioConfig {
        AudioConfig {
            normalize: Some(normalize.to_string()),
            augment,
            ..Default::default()
        }
    }

    #[test]
    fn test_second_parse_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.5, 440.0);

        let parser = SpectrogramParser::new(&config("mean", false), dir.path().join("cache")).unwrap();
        let first = parser.parse_audio(&audio).unwrap();
        let second = parser.parse_audio(&audio).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.nrows(), FREQ_BINS);
        assert_eq!(
            parser.stats(),
            StatsSnapshot {
                cache_hits: 1,
                cache_misses: 1,
                transforms: 1,
                stores: 1,
            }
        );
    }

    #[test]
    fn test_cache_holds_raw_magnitudes() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.3, 1000.0);

        let parser = SpectrogramParser::new(&config("norm", false), dir.path().join("cache")).unwrap();
        let features = parser.parse_audio(&audio).unwrap();

        let key = CacheKey::for_file(&audio, TempoVariant::Normal, ChannelSelector::Average).unwrap();
        let cached: Array2<f32> = read_npy(parser.cache().path_for(&key)).unwrap();
        assert!(cached.iter().all(|v| *v >= 0.0));
        assert_eq!(normalize(&cached, Normalization::Norm), features);
    }

    #[test]
    fn test_mean_normalized_output_has_zero_mean() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.4, 300.0);

        let parser = SpectrogramParser::new(&config("mean", false), dir.path().join("cache")).unwrap();
        let features = parser.parse_audio(&audio).unwrap();
        assert!(features.mean().unwrap().abs() < 1e-4);
    }

    #[test]
    fn test_augmented_variants_bypass_cache() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.1, 440.0);

        let tool = Arc::new(MockTool::new(16000));
        let parser = SpectrogramParser::with_tool(
            &config("max_frame", true),
            dir.path().join("cache"),
            tool.clone(),
        )
        .unwrap();

        for _ in 0..30 {
            let spect = parser.parse_audio(&audio).unwrap();
            assert_eq!(spect.nrows(), FREQ_BINS);
        }

        let stats = parser.stats();
        let perturbed = tool.perturb_calls.load(Ordering::SeqCst) as u64;
        assert_eq!(stats.cache_hits + stats.cache_misses, 30);
        // canonical misses happen once, everything else is recomputed
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.cache_misses, perturbed + 1);
        assert_eq!(stats.transforms, stats.cache_misses);
    }

    #[test]
    fn test_interrupt_propagates_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.2, 440.0);

        let interrupt = Arc::new(AtomicBool::new(true));
        let parser = SpectrogramParser::new(&config("none", false), dir.path().join("cache"))
            .unwrap()
            .with_interrupt(Arc::clone(&interrupt));

        let path = match parser.parse_audio(&audio) {
            Err(Error::Interrupted(path)) => path,
            other => panic!("expected Interrupted, got {other:?}"),
        };
        assert!(!path.exists());

        interrupt.store(false, Ordering::Relaxed);
        parser.parse_audio(&audio).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_call_cancel_is_independent_of_parser_flag() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.2, 440.0);

        let parser = SpectrogramParser::new(&config("none", false), dir.path().join("cache")).unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            parser.parse_audio_with_cancel(&audio, &cancel),
            Err(Error::Interrupted(_))
        ));
        assert!(!parser.interrupt().load(Ordering::Relaxed));

        parser.parse_audio(&audio).unwrap();
        assert_eq!(parser.stats().stores, 1);
    }

    #[test]
    fn test_missing_noise_dir_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let config = AudioConfig {
            noise_dir: Some(dir.path().join("missing")),
            ..Default::default()
        };
        let err = SpectrogramParser::new(&config, dir.path().join("cache")).err().unwrap();
        assert!(matches!(err, Error::NoiseDirMissing(_)));
    }

    #[test]
    fn test_noisy_samples_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let noise_dir = dir.path().join("noise");
        std::fs::create_dir(&noise_dir).unwrap();
        write_tone(&noise_dir.join("hum.wav"), 1.0, 60.0);
        let audio = dir.path().join("utt.wav");
        write_tone(&audio, 0.25, 440.0);

        let config = AudioConfig {
            noise_dir: Some(noise_dir),
            noise_prob: 1.0,
            ..Default::default()
        };
        let parser =
            SpectrogramParser::with_tool(&config, dir.path().join("cache"), Arc::new(MockTool::new(16000)))
                .unwrap();
        parser.parse_audio(&audio).unwrap();
        parser.parse_audio(&audio).unwrap();

        let stats = parser.stats();
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.stores, 0);
    }
}
