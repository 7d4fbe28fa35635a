//! Log compression and mean/variance adjustment of magnitude spectrograms.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;

use crate::config::Normalization;

/// Scale applied before log1p in `max_frame` mode (2^20).
const MAX_FRAME_SCALE: f32 = 1_048_576.0;
const FRAME_SIGMA: f32 = 50.0;
const MAX_FRAME_SIGMA: f32 = 20.0;

/// Normalize a raw magnitude spectrogram [freq, time].
pub fn normalize(spect: &Array2<f32>, mode: Normalization) -> Array2<f32> {
    match mode {
        Normalization::None => spect.mapv(f32::ln_1p),
        Normalization::Mean => {
            let mut out = spect.mapv(f32::ln_1p);
            if let Some(mean) = out.mean() {
                out -= mean;
            }
            out
        }
        Normalization::Norm => {
            let mut out = spect.mapv(f32::ln_1p);
            if let Some(mean) = out.mean() {
                out -= mean;
            }
            if out.len_of(Axis(0)) > 1 {
                // unbiased std across frequency, per frame
                let std = out.std_axis(Axis(0), 1.0);
                if let Some(scale) = std.mean().filter(|s| *s > 0.0) {
                    out /= scale;
                }
            }
            out
        }
        Normalization::Frame => subtract_smoothed_frame_mean(spect.mapv(f32::ln_1p), FRAME_SIGMA),
        Normalization::MaxFrame => subtract_smoothed_frame_mean(
            spect.mapv(|v| (v * MAX_FRAME_SCALE).ln_1p()),
            MAX_FRAME_SIGMA,
        ),
    }
}

/// Add one uniform draw from [-0.5, 0.5) to every element.
pub fn jitter<R: Rng>(spect: &mut Array2<f32>, rng: &mut R) {
    let offset = rng.gen::<f32>() - 0.5;
    *spect += offset;
}

/// Mean over frequency for each frame, smoothed along time, collapsed to a
/// scalar and subtracted.
fn subtract_smoothed_frame_mean(mut spect: Array2<f32>, sigma: f32) -> Array2<f32> {
    let Some(frame_mean) = spect.mean_axis(Axis(0)) else {
        return spect;
    };
    let smoothed = gaussian_filter1d(&frame_mean, sigma);
    if let Some(offset) = smoothed.mean() {
        spect -= offset;
    }
    spect
}

/// 1-D Gaussian smoothing with reflected boundaries, kernel truncated at 4 sigma.
pub fn gaussian_filter1d(x: &Array1<f32>, sigma: f32) -> Array1<f32> {
    let n = x.len();
    if n == 0 {
        return x.clone();
    }
    let radius = (4.0 * sigma + 0.5) as isize;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f32 / sigma).powi(2)).exp())
        .collect();
    let total: f32 = weights.iter().sum();

    let n = n as isize;
    let period = 2 * n;
    Array1::from_shape_fn(n as usize, |i| {
        let mut acc = 0.0f32;
        for (w, k) in weights.iter().zip(-radius..=radius) {
            // reflect with the edge sample repeated: (d c b a | a b c d | d c b a)
            let m = (i as isize + k).rem_euclid(period);
            let j = if m < n { m } else { period - 1 - m };
            acc += w * x[j as usize];
        }
        acc / total
    })
}
