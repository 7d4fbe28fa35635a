//! Audio decoding using symphonia.
//!
//! Supports MP3, FLAC, OGG, WAV formats.

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::config::ChannelSelector;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Unsupported codec")]
    UnsupportedCodec,
    #[error("channel {channel} requested but audio has {channels} channel(s)")]
    InvalidChannel { channel: usize, channels: usize },
    #[error("Resampler construction error: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("Resampling error: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Decoded audio samples, interleaved.
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    /// Reduce to mono by averaging channels or picking one.
    pub fn select_channel(&self, channel: ChannelSelector) -> Result<Vec<f32>, DecodeError> {
        if self.channels == 1 {
            return Ok(self.samples.clone());
        }

        let n_frames = self.samples.len() / self.channels;
        match channel {
            ChannelSelector::Average => {
                let mut mono = Vec::with_capacity(n_frames);
                for frame in self.samples.chunks_exact(self.channels) {
                    mono.push(frame.iter().sum::<f32>() / self.channels as f32);
                }
                Ok(mono)
            }
            ChannelSelector::Index(ch) if ch < self.channels => Ok(self
                .samples
                .chunks_exact(self.channels)
                .map(|frame| frame[ch])
                .collect()),
            ChannelSelector::Index(ch) => Err(DecodeError::InvalidChannel {
                channel: ch,
                channels: self.channels,
            }),
        }
    }
}

/// Resample mono audio using sinc interpolation (rubato).
pub fn resample(mono: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if source_rate == target_rate || mono.is_empty() {
        return Ok(mono.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;
    let chunk_size = 1024;

    // max_resample_ratio_relative must cover actual ratio (e.g., 8kHz→16kHz = 2x)
    let max_ratio = resample_ratio.max(1.0 / resample_ratio) * 1.1;

    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, max_ratio, params, chunk_size, 1)?;

    let mut output = Vec::new();
    let mut pos = 0;

    while pos < mono.len() {
        let end = (pos + chunk_size).min(mono.len());
        let chunk = &mono[pos..end];

        // Pad last chunk if needed
        let mut padded = chunk.to_vec();
        padded.resize(chunk_size, 0.0);
        let input = vec![padded];

        let resampled = resampler.process(&input, None)?;
        output.extend_from_slice(&resampled[0]);

        pos += chunk_size;
    }

    let expected_len = (mono.len() as f64 * resample_ratio).round() as usize;
    output.resize(expected_len, 0.0);

    Ok(output)
}

/// Decode a file to mono at `sample_rate`. This is the plain (non-augmented) load.
pub fn load_audio<P: AsRef<Path>>(
    path: P,
    channel: ChannelSelector,
    sample_rate: u32,
) -> Result<Vec<f32>, DecodeError> {
    let audio = decode_file(path)?;
    let mono = audio.select_channel(channel)?;
    resample(&mono, audio.sample_rate, sample_rate)
}

/// Decode a file at its native sample rate.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<DecodedAudio, DecodeError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let format_opts = FormatOptions::default();
    let metadata_opts = MetadataOptions::default();

    let probed =
        symphonia::default::get_probe().format(&hint, mss, &format_opts, &metadata_opts)?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let decoder_opts = DecoderOptions::default();
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &decoder_opts)?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(DecodeError::UnsupportedCodec)?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);

    let track_id = track.id;
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder.decode(&packet)?;
        append_samples(&decoded, &mut samples, channels)?;
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn append_samples(
    buffer: &AudioBufferRef,
    output: &mut Vec<f32>,
    channels: usize,
) -> Result<(), DecodeError> {
    match buffer {
        AudioBufferRef::F32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame]);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 32768.0);
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 2147483648.0);
                }
            }
        }
        AudioBufferRef::U8(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push((buf.chan(ch)[frame] as f32 - 128.0) / 128.0);
                }
            }
        }
        _ => {
            return Err(DecodeError::UnsupportedCodec);
        }
    }
    Ok(())
}
