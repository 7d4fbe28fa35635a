//! Batch assembly: sort by length, zero-pad along time, flatten targets.

use ndarray::{s, Array1, Array4};
use std::path::PathBuf;

use crate::dataset::Sample;

/// A padded batch, longest sample first.
#[derive(Clone, Debug)]
pub struct Batch {
    /// [N, 1, F, T_max], zero padded on the right.
    pub inputs: Array4<f32>,
    /// All label sequences concatenated; split with `target_lengths`.
    pub targets: Vec<u32>,
    pub paths: Vec<PathBuf>,
    /// T_i / T_max per sample.
    pub input_fraction: Array1<f32>,
    pub target_lengths: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub fn collate(mut samples: Vec<Sample>) -> Batch {
    // stable: equal lengths keep their sampler order
    samples.sort_by_key(|s| std::cmp::Reverse(s.features.ncols()));

    let n = samples.len();
    let freq = samples.first().map_or(0, |s| s.features.nrows());
    let max_len = samples.first().map_or(0, |s| s.features.ncols());

    let mut inputs = Array4::<f32>::zeros((n, 1, freq, max_len));
    let mut input_fraction = Array1::<f32>::zeros(n);
    let mut target_lengths = Vec::with_capacity(n);
    let total: usize = samples.iter().map(|s| s.targets.len()).sum();
    let mut targets = Vec::with_capacity(total);
    let mut paths = Vec::with_capacity(n);

    for (i, sample) in samples.into_iter().enumerate() {
        let len = sample.features.ncols();
        inputs
            .slice_mut(s![i, 0, .., ..len])
            .assign(&sample.features);
        input_fraction[i] = if max_len == 0 {
            0.0
        } else {
            len as f32 / max_len as f32
        };
        target_lengths.push(sample.targets.len());
        targets.extend(sample.targets);
        paths.push(sample.path);
    }

    Batch {
        inputs,
        targets,
        paths,
        input_fraction,
        target_lengths,
    }
}
