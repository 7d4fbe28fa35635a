//! Audio front-end configuration.

use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No such normalization: {0}")]
    UnknownNormalization(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// STFT window function. Unknown names fall back to Hamming.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum WindowType {
    #[default]
    Hamming,
    Hann,
    Blackman,
    Bartlett,
}

impl WindowType {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "hann" => Self::Hann,
            "blackman" => Self::Blackman,
            "bartlett" => Self::Bartlett,
            _ => Self::Hamming,
        }
    }
}

impl From<String> for WindowType {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

/// Feature normalization applied after the magnitude spectrogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Normalization {
    #[default]
    None,
    Mean,
    Norm,
    Frame,
    MaxFrame,
}

impl FromStr for Normalization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" | "false" => Ok(Self::None),
            "mean" => Ok(Self::Mean),
            "norm" => Ok(Self::Norm),
            "frame" => Ok(Self::Frame),
            "max_frame" => Ok(Self::MaxFrame),
            other => Err(ConfigError::UnknownNormalization(other.to_string())),
        }
    }
}

/// Which channel of a multi-channel file to keep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChannelSelector {
    #[default]
    Average,
    Index(usize),
}

impl ChannelSelector {
    /// `-1` (or any negative value) averages all channels.
    pub fn from_index(channel: i32) -> Self {
        if channel < 0 {
            Self::Average
        } else {
            Self::Index(channel as usize)
        }
    }
}

impl fmt::Display for ChannelSelector {
    /// Label used in cache filenames.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Average => write!(f, "avg"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Window length in seconds.
    pub window_size: f64,
    /// Hop length in seconds.
    pub window_stride: f64,
    #[serde(alias = "window_type")]
    pub window: WindowType,
    /// One of `mean`, `norm`, `frame`, `max_frame`, `none`. Parsed when the
    /// parser is built.
    pub normalize: Option<String>,
    /// Tempo/gain perturbation and max_frame jitter.
    pub augment: bool,
    pub noise_dir: Option<PathBuf>,
    pub noise_levels: (f32, f32),
    pub noise_prob: f64,
    /// Gain range in dB for tempo/gain perturbation.
    pub gain_range: (f64, f64),
    /// -1 averages channels.
    pub channel: i32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            window_size: 0.02,
            window_stride: 0.01,
            window: WindowType::Hamming,
            normalize: None,
            augment: false,
            noise_dir: None,
            noise_levels: (0.0, 0.5),
            noise_prob: 0.4,
            gain_range: (-10.0, 10.0),
            channel: -1,
        }
    }
}

impl AudioConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be > 0"));
        }
        if self.n_fft() == 0 {
            return Err(invalid("window_size", "yields an empty FFT window"));
        }
        if self.hop_length() == 0 {
            return Err(invalid("window_stride", "yields a zero hop length"));
        }
        if !(0.0..=1.0).contains(&self.noise_prob) {
            return Err(invalid("noise_prob", "must be within [0, 1]"));
        }
        if !ordered(self.noise_levels.0, self.noise_levels.1) {
            return Err(invalid("noise_levels", "min exceeds max"));
        }
        if !ordered(self.gain_range.0, self.gain_range.1) {
            return Err(invalid("gain_range", "min exceeds max"));
        }
        self.normalization()?;
        Ok(())
    }

    pub fn normalization(&self) -> Result<Normalization, ConfigError> {
        match &self.normalize {
            Some(name) => name.parse(),
            None => Ok(Normalization::None),
        }
    }

    pub fn channel_selector(&self) -> ChannelSelector {
        ChannelSelector::from_index(self.channel)
    }

    /// FFT size (and window length) in samples.
    pub fn n_fft(&self) -> usize {
        (self.sample_rate as f64 * (self.window_size + 1e-8)) as usize
    }

    pub fn hop_length(&self) -> usize {
        (self.sample_rate as f64 * (self.window_stride + 1e-8)) as usize
    }
}

/// `low <= high`, false when either is NaN.
fn ordered<T: PartialOrd>(low: T, high: T) -> bool {
    matches!(low.partial_cmp(&high), Some(Ordering::Less | Ordering::Equal))
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
