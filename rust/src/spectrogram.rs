//! Spectrogram computation: centered STFT -> magnitude -> 161 frequency bins.

use ndarray::{Array2, Axis};
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::{AudioConfig, WindowType};

/// Frequency bins in every spectrogram the pipeline produces.
pub const FREQ_BINS: usize = 161;

/// STFT configuration.
#[derive(Clone, Debug)]
pub struct StftConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub window: WindowType,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            n_fft: 320,      // 20ms at 16kHz
            hop_length: 160, // 10ms at 16kHz
            window: WindowType::Hamming,
        }
    }
}

impl From<&AudioConfig> for StftConfig {
    fn from(config: &AudioConfig) -> Self {
        Self {
            n_fft: config.n_fft(),
            hop_length: config.hop_length(),
            window: config.window,
        }
    }
}

/// Precomputed STFT plan and window.
pub struct SpectrogramTransform {
    config: StftConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
}

impl SpectrogramTransform {
    pub fn new(config: StftConfig) -> Self {
        let mut planner = RealFftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        let window = make_window(config.window, config.n_fft);
        Self {
            config,
            fft,
            window,
        }
    }

    /// Magnitude spectrogram fitted to exactly [`FREQ_BINS`] rows.
    pub fn magnitude(&self, samples: &[f32]) -> Array2<f32> {
        fit_frequency_bins(self.stft_magnitude(samples), FREQ_BINS)
    }

    /// Magnitude STFT with its natural `n_fft/2 + 1` rows.
    /// Input: mono samples. Output: [n_bins, n_frames].
    pub fn stft_magnitude(&self, samples: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let (n_bins, n_frames) = self.output_shape(samples.len());

        let mut spectrogram = Array2::<f32>::zeros((n_bins, n_frames));
        if n_frames == 0 {
            return spectrogram;
        }

        // Frames are centered: reflect-pad by n_fft/2 on both sides
        let pad = n_fft / 2;
        let n = samples.len() as isize;

        let mut input = vec![0.0f32; n_fft];
        let mut spectrum = self.fft.make_output_vec();

        for frame in 0..n_frames {
            let start = (frame * hop) as isize - pad as isize;
            for (i, x) in input.iter_mut().enumerate() {
                let idx = reflect_index(start + i as isize, n);
                *x = samples[idx] * self.window[i];
            }

            self.fft
                .process(&mut input, &mut spectrum)
                .expect("FFT failed");

            for (bin, c) in spectrum.iter().enumerate() {
                spectrogram[[bin, frame]] = c.norm();
            }
        }

        spectrogram
    }

    /// Natural (unfitted) shape for a given input length.
    pub fn output_shape(&self, n_samples: usize) -> (usize, usize) {
        let n_bins = self.config.n_fft / 2 + 1;
        let n_frames = if n_samples == 0 {
            0
        } else {
            1 + n_samples / self.config.hop_length
        };
        (n_bins, n_frames)
    }
}

/// Clip or fill the frequency axis to `target` rows.
///
/// Missing rows are filled by mirroring the existing ones upward: row `r`
/// takes row `r mod 2b`, reflected when that lands at or above `b`, where `b`
/// is the natural bin count. For `b = 81` this maps rows 81..161 onto rows
/// 80 down to 1.
pub fn fit_frequency_bins(spec: Array2<f32>, target: usize) -> Array2<f32> {
    let bins = spec.len_of(Axis(0));
    if bins >= target {
        return spec.slice_move(ndarray::s![..target, ..]);
    }
    if bins == 0 {
        return Array2::zeros((target, spec.len_of(Axis(1))));
    }

    let period = 2 * bins;
    let rows: Vec<usize> = (0..target)
        .map(|r| {
            let m = r % period;
            if m < bins { m } else { period - 1 - m }
        })
        .collect();
    spec.select(Axis(0), &rows)
}

/// Symmetric window of length `n`.
fn make_window(kind: WindowType, n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    let m = (n - 1) as f32;
    (0..n)
        .map(|i| {
            let x = i as f32;
            match kind {
                WindowType::Hamming => 0.54 - 0.46 * (2.0 * PI * x / m).cos(),
                WindowType::Hann => 0.5 - 0.5 * (2.0 * PI * x / m).cos(),
                WindowType::Blackman => {
                    0.42 - 0.5 * (2.0 * PI * x / m).cos() + 0.08 * (4.0 * PI * x / m).cos()
                }
                WindowType::Bartlett => 1.0 - (2.0 * x / m - 1.0).abs(),
            }
        })
        .collect()
}

/// Reflect (edge excluded) out-of-range indices back into `[0, n)`.
fn reflect_index(i: isize, n: isize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - m }) as usize
}
