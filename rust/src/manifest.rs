//! Manifest rows: `audio_path,transcript_path[,duration]`, no header.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ManifestEntry {
    pub audio_path: PathBuf,
    pub transcript_path: PathBuf,
    /// Seconds; 0 when the manifest has no duration column.
    pub duration: f64,
}

/// Read a manifest, keeping at most `max_items` rows.
pub fn load_manifest(path: &Path, max_items: Option<usize>) -> Result<Vec<ManifestEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let limit = max_items.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    for record in reader.records().take(limit) {
        let record = record?;
        let audio = record.get(0).unwrap_or_default();
        if audio.trim().is_empty() {
            continue;
        }
        let duration = match record.get(2).map(str::trim) {
            None | Some("") => 0.0,
            Some(value) => value.parse().map_err(|_| Error::Parse {
                what: "duration",
                value: value.to_string(),
            })?,
        };
        entries.push(ManifestEntry {
            audio_path: PathBuf::from(audio),
            transcript_path: PathBuf::from(record.get(1).unwrap_or_default()),
            duration,
        });
    }
    tracing::debug!(path = %path.display(), entries = entries.len(), "loaded manifest");
    Ok(entries)
}
