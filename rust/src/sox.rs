//! External audio utility boundary.
//!
//! Tempo/gain perturbation and noise segment extraction shell out to sox.
//! Every invocation writes to a temporary WAV that is removed when the call
//! returns, whether it succeeded or not. Calls are synchronous and have no
//! timeout.

use std::path::Path;
use std::process::{Command, Output};

use crate::config::ChannelSelector;
use crate::decode::decode_file;
use crate::error::{Error, Result};

/// Mono audio as produced by the external utility, with the sample rate read
/// back from the file it wrote.
#[derive(Debug, Clone)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Operations the pipeline needs from an external audio utility.
pub trait AudioTool: Send + Sync {
    /// Clip duration in seconds.
    fn duration(&self, path: &Path) -> Result<f64>;

    /// Crop `[start, end)` seconds and resample to `sample_rate`, mono.
    fn extract(&self, path: &Path, sample_rate: u32, start: f64, end: f64) -> Result<Clip>;

    /// Change tempo and gain (dB), resample to `sample_rate`, mono.
    fn perturb(
        &self,
        path: &Path,
        sample_rate: u32,
        tempo: f64,
        gain: f64,
        channel: ChannelSelector,
    ) -> Result<Clip>;
}

/// The sox command-line utility.
#[derive(Debug, Clone, Default)]
pub struct Sox;

impl Sox {
    fn run_to_wav(&self, input: &Path, sample_rate: u32, effects: &[String]) -> Result<Clip> {
        let target = tempfile::Builder::new().suffix(".wav").tempfile()?;

        let mut cmd = Command::new("sox");
        cmd.arg(input)
            .args(["-r", &sample_rate.to_string()])
            .args(["-c", "1", "-b", "16", "-t", "wav", "-e", "si"])
            .arg(target.path())
            .args(effects);

        let output = run("sox", &mut cmd)?;
        if !output.stderr.is_empty() {
            tracing::debug!(
                path = %input.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "sox warnings"
            );
        }

        let audio = decode_file(target.path())?;
        let samples = audio.select_channel(ChannelSelector::Average)?;
        Ok(Clip {
            samples,
            sample_rate: audio.sample_rate,
        })
    }
}

impl AudioTool for Sox {
    fn duration(&self, path: &Path) -> Result<f64> {
        let output = run("soxi", Command::new("soxi").arg("-D").arg(path))?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse().map_err(|_| Error::Parse {
            what: "soxi duration",
            value: text.trim().to_string(),
        })
    }

    fn extract(&self, path: &Path, sample_rate: u32, start: f64, end: f64) -> Result<Clip> {
        let effects = ["trim".to_string(), start.to_string(), format!("={end}")];
        self.run_to_wav(path, sample_rate, &effects)
    }

    fn perturb(
        &self,
        path: &Path,
        sample_rate: u32,
        tempo: f64,
        gain: f64,
        channel: ChannelSelector,
    ) -> Result<Clip> {
        let mut effects = vec![
            "tempo".to_string(),
            format!("{tempo:.3}"),
            "gain".to_string(),
            format!("{gain:.3}"),
        ];
        // sox remix channels are 1-based
        if let ChannelSelector::Index(ch) = channel {
            effects.push("remix".to_string());
            effects.push((ch + 1).to_string());
        }
        self.run_to_wav(path, sample_rate, &effects)
    }
}

/// Run a command to completion; spawn failure or nonzero exit is an error.
fn run(tool: &'static str, cmd: &mut Command) -> Result<Output> {
    let output = cmd.output().map_err(|e| Error::ExternalTool {
        tool,
        status: "spawn failed".to_string(),
        stderr: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(Error::ExternalTool {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}
