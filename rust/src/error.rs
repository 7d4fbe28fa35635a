//! Crate-level error type.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::decode::DecodeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("NPY read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    #[error("NPY write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    /// The external audio utility could not be spawned or exited non-zero.
    #[error("{tool} failed ({status}): {stderr}")]
    ExternalTool {
        tool: &'static str,
        status: String,
        stderr: String,
    },
    #[error("sample rate mismatch: expected {expected}, got {actual}")]
    SampleRateMismatch { expected: u32, actual: u32 },
    #[error("noise segment has {actual} samples, target has {expected}")]
    NoiseLengthMismatch { expected: usize, actual: usize },
    #[error("noise directory doesn't exist: {0}")]
    NoiseDirMissing(PathBuf),
    #[error("no audio files found in noise directory: {0}")]
    NoNoiseFiles(PathBuf),

    /// A cache write was cancelled; the partial file has been removed.
    #[error("cache write interrupted: {0}")]
    Interrupted(PathBuf),
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("unparseable {what}: {value:?}")]
    Parse { what: &'static str, value: String },
    #[error("loader workers exited before all batches were produced")]
    WorkerDisconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
