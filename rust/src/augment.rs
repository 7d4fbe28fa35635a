//! Randomized tempo/gain perturbation and additive noise injection.
//!
//! Draws use the caller's RNG; the parser passes `thread_rng()` so augmentation
//! differs across workers and restarts, unlike sampler shuffles which are
//! seeded by epoch.

use rand::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ChannelSelector;
use crate::error::{Error, Result};
use crate::sox::AudioTool;

/// Extensions picked up when scanning the noise directory.
const AUDIO_EXTENSIONS: [&str; 7] = ["aac", "au", "flac", "m4a", "mp3", "ogg", "wav"];

/// Discrete tempo buckets. Only `Normal` is persisted to the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TempoVariant {
    Normal,
    Slow,
    Fast,
}

impl TempoVariant {
    pub const ALL: [Self; 3] = [Self::Normal, Self::Slow, Self::Fast];

    pub fn id(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Slow => 1,
            Self::Fast => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Label used in cache filenames.
    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "1.0",
            Self::Slow => "0.9",
            Self::Fast => "1.1",
        }
    }

    /// Inclusive tempo factor range drawn from.
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::Normal => (1.0, 1.0),
            Self::Slow => (0.85, 0.95),
            Self::Fast => (1.05, 1.15),
        }
    }

    pub fn is_canonical(self) -> bool {
        self == Self::Normal
    }

    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

/// Tempo/gain perturbation through the external audio utility.
pub struct AugmentationEngine {
    tool: Arc<dyn AudioTool>,
    sample_rate: u32,
    gain_range: (f64, f64),
    channel: ChannelSelector,
}

impl AugmentationEngine {
    pub fn new(
        tool: Arc<dyn AudioTool>,
        sample_rate: u32,
        gain_range: (f64, f64),
        channel: ChannelSelector,
    ) -> Self {
        Self {
            tool,
            sample_rate,
            gain_range,
            channel,
        }
    }

    /// Load `path` with a tempo drawn from `variant`'s range and a gain drawn
    /// from the configured dB range.
    pub fn load_augmented<R: Rng>(
        &self,
        path: &Path,
        variant: TempoVariant,
        rng: &mut R,
    ) -> Result<Vec<f32>> {
        let (low_tempo, high_tempo) = variant.range();
        let tempo = rng.gen_range(low_tempo..=high_tempo);
        let gain = rng.gen_range(self.gain_range.0..=self.gain_range.1);

        let clip = self
            .tool
            .perturb(path, self.sample_rate, tempo, gain, self.channel)?;
        check_rate(self.sample_rate, clip.sample_rate)?;
        Ok(clip.samples)
    }
}

/// Adds a random segment of a random noise file at a random relative level.
pub struct NoiseInjector {
    tool: Arc<dyn AudioTool>,
    paths: Vec<PathBuf>,
    sample_rate: u32,
    levels: (f32, f32),
}

impl NoiseInjector {
    /// Scan `dir` once for noise files. Fails if the directory is missing or
    /// holds no audio.
    pub fn new(
        dir: &Path,
        sample_rate: u32,
        levels: (f32, f32),
        tool: Arc<dyn AudioTool>,
    ) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::NoiseDirMissing(dir.to_path_buf()));
        }
        let paths = find_audio_files(dir);
        if paths.is_empty() {
            return Err(Error::NoNoiseFiles(dir.to_path_buf()));
        }
        tracing::info!(dir = %dir.display(), files = paths.len(), "noise files found");
        Ok(Self {
            tool,
            paths,
            sample_rate,
            levels,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn inject_noise<R: Rng>(&self, data: &mut [f32], rng: &mut R) -> Result<()> {
        let noise_path = &self.paths[rng.gen_range(0..self.paths.len())];
        let level = rng.gen_range(self.levels.0..=self.levels.1);
        self.inject_noise_sample(data, noise_path, level, rng)
    }

    /// Mix a segment of `noise_path` into `data` so that the noise energy is
    /// `level` times the data energy.
    pub fn inject_noise_sample<R: Rng>(
        &self,
        data: &mut [f32],
        noise_path: &Path,
        level: f32,
        rng: &mut R,
    ) -> Result<()> {
        let noise_len = self.tool.duration(noise_path)?;
        let data_len = data.len() as f64 / self.sample_rate as f64;
        let start = (rng.gen::<f64>() * (noise_len - data_len)).max(0.0);
        let end = start + data_len;

        let noise = self.tool.extract(noise_path, self.sample_rate, start, end)?;
        check_rate(self.sample_rate, noise.sample_rate)?;
        if noise.samples.len() != data.len() {
            return Err(Error::NoiseLengthMismatch {
                expected: data.len(),
                actual: noise.samples.len(),
            });
        }

        let noise_energy = energy(&noise.samples);
        if noise_energy == 0.0 {
            tracing::debug!(path = %noise_path.display(), "silent noise segment, skipping");
            return Ok(());
        }
        let scale = level * energy(data) / noise_energy;
        for (d, n) in data.iter_mut().zip(&noise.samples) {
            *d += scale * n;
        }
        Ok(())
    }
}

/// `sqrt(x . x) / len`
fn energy(x: &[f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v * v).sum::<f32>().sqrt() / x.len() as f32
}

fn check_rate(expected: u32, actual: u32) -> Result<()> {
    if expected != actual {
        return Err(Error::SampleRateMismatch { expected, actual });
    }
    Ok(())
}

fn find_audio_files(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("**").join("*");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let Ok(entries) = glob::glob(pattern) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|p| p.ok())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sox::Clip;
    use rand::rngs::StdRng;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stand-in for sox: returns a constant signal of the requested length.
    pub(crate) struct MockTool {
        pub sample_rate: u32,
        pub noise_seconds: f64,
        pub value: f32,
        pub short_by: usize,
        pub perturb_calls: AtomicUsize,
        pub last_tempo: Mutex<Option<f64>>,
    }

    impl MockTool {
        pub(crate) fn new(sample_rate: u32) -> Self {
            Self {
                sample_rate,
                noise_seconds: 10.0,
                value: 0.25,
                short_by: 0,
                perturb_calls: AtomicUsize::new(0),
                last_tempo: Mutex::new(None),
            }
        }
    }

    impl AudioTool for MockTool {
        fn duration(&self, _path: &Path) -> Result<f64> {
            Ok(self.noise_seconds)
        }

        fn extract(&self, _path: &Path, _sample_rate: u32, start: f64, end: f64) -> Result<Clip> {
            let n = ((end - start) * self.sample_rate as f64).round() as usize;
            Ok(Clip {
                samples: vec![self.value; n.saturating_sub(self.short_by)],
                sample_rate: self.sample_rate,
            })
        }

        fn perturb(
            &self,
            _path: &Path,
            _sample_rate: u32,
            tempo: f64,
            _gain: f64,
            _channel: ChannelSelector,
        ) -> Result<Clip> {
            self.perturb_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_tempo.lock().unwrap() = Some(tempo);
            let n = (1600.0 / tempo) as usize;
            Ok(Clip {
                samples: (0..n).map(|i| (i as f32 * 0.05).sin()).collect(),
                sample_rate: self.sample_rate,
            })
        }
    }

    fn noise_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.wav"), b"").unwrap();
        std::fs::write(dir.path().join("sub").join("b.FLAC"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        dir
    }

    #[test]
    fn test_tempo_buckets() {
        assert_eq!(TempoVariant::from_id(0), Some(TempoVariant::Normal));
        assert_eq!(TempoVariant::from_id(3), None);
        assert_eq!(TempoVariant::Slow.name(), "0.9");
        assert_eq!(TempoVariant::Fast.range(), (1.05, 1.15));
        assert!(TempoVariant::Normal.is_canonical());
        assert!(!TempoVariant::Fast.is_canonical());
    }

    #[test]
    fn test_tempo_drawn_within_bucket() {
        let tool = Arc::new(MockTool::new(16000));
        let engine =
            AugmentationEngine::new(tool.clone(), 16000, (-10.0, 10.0), ChannelSelector::Average);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            engine
                .load_augmented(Path::new("x.wav"), TempoVariant::Slow, &mut rng)
                .unwrap();
            let tempo = tool.last_tempo.lock().unwrap().unwrap();
            assert!((0.85..=0.95).contains(&tempo));
        }
    }

    #[test]
    fn test_sample_rate_mismatch_is_fatal() {
        let tool = Arc::new(MockTool::new(8000));
        let engine = AugmentationEngine::new(tool, 16000, (0.0, 0.0), ChannelSelector::Average);
        let err = engine
            .load_augmented(Path::new("x.wav"), TempoVariant::Normal, &mut thread_rng())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SampleRateMismatch { expected: 16000, actual: 8000 }
        ));
    }

    #[test]
    fn test_noise_dir_scan() {
        let dir = noise_dir();
        let injector =
            NoiseInjector::new(dir.path(), 16000, (0.0, 0.5), Arc::new(MockTool::new(16000)))
                .unwrap();
        assert_eq!(injector.paths().len(), 2);
    }

    #[test]
    fn test_missing_noise_dir_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = NoiseInjector::new(&missing, 16000, (0.0, 0.5), Arc::new(MockTool::new(16000)))
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoiseDirMissing(p) if p == missing));
    }

    #[test]
    fn test_noise_scaled_to_level() {
        let dir = noise_dir();
        let injector =
            NoiseInjector::new(dir.path(), 16000, (0.0, 0.5), Arc::new(MockTool::new(16000)))
                .unwrap();

        let mut data = vec![0.5f32; 1600];
        let data_energy = energy(&data);
        let mut rng = StdRng::seed_from_u64(0);
        injector
            .inject_noise_sample(&mut data, &injector.paths()[0], 0.5, &mut rng)
            .unwrap();

        // noise is constant, so the added offset is level * data_energy / noise_energy * value
        let noise_energy = energy(&vec![0.25f32; 1600]);
        let expected = 0.5 + 0.5 * data_energy / noise_energy * 0.25;
        assert!(data.iter().all(|&d| (d - expected).abs() < 1e-5));
    }

    #[test]
    fn test_noise_length_mismatch_is_fatal() {
        let dir = noise_dir();
        let mut tool = MockTool::new(16000);
        tool.short_by = 3;
        let injector = NoiseInjector::new(dir.path(), 16000, (0.0, 0.5), Arc::new(tool)).unwrap();

        let mut data = vec![0.1f32; 1600];
        let err = injector.inject_noise(&mut data, &mut thread_rng()).unwrap_err();
        assert!(matches!(
            err,
            Error::NoiseLengthMismatch { expected: 1600, actual: 1597 }
        ));
    }
}
