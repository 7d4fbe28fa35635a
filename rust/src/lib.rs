//! Spectrogram data pipeline for speech-recognition training.
//!
//! - Audio decoding (symphonia) and resampling (rubato)
//! - Tempo/gain perturbation and noise injection through an external audio tool
//! - STFT magnitude spectrograms (realfft), always 161 frequency bins
//! - Content-addressed on-disk cache of the canonical spectrogram
//! - Curriculum-weighted epoch selection, bucketing samplers, padded batches
//! - Multi-threaded batch loading, optionally exposed to Python

pub mod augment;
pub mod cache;
pub mod collate;
pub mod config;
pub mod curriculum;
pub mod dataset;
pub mod decode;
pub mod error;
pub mod labels;
pub mod loader;
pub mod manifest;
pub mod normalize;
pub mod parser;
#[cfg(feature = "python")]
mod python;
pub mod sampler;
pub mod sox;
pub mod spectrogram;

pub use error::{Error, Result};

#[cfg(feature = "python")]
use pyo3::types::{PyModule, PyModuleMethods};
#[cfg(feature = "python")]
use pyo3::{pymodule, Bound, PyResult};

/// Python module entry point.
#[cfg(feature = "python")]
#[pymodule]
fn _rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyAudioDataset>()?;
    m.add_class::<python::PyBatchLoader>()?;
    Ok(())
}
