//! Per-sample difficulty records and the epoch subset selection built on them.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::ManifestEntry;

/// Error rate given to samples that have never been scored.
pub const DEFAULT_ERROR_RATE: f64 = 0.999;

#[derive(Clone, Debug, PartialEq)]
pub struct CurriculumRecord {
    pub wav: PathBuf,
    /// Reference transcript text.
    pub text: String,
    /// Model hypothesis.
    pub transcript: String,
    pub offsets: Option<Vec<u32>>,
    pub cer: f64,
    pub wer: f64,
}

impl CurriculumRecord {
    /// Unscored record: maximal difficulty.
    pub fn default_for(wav: &Path) -> Self {
        Self {
            wav: wav.to_path_buf(),
            text: String::new(),
            transcript: String::new(),
            offsets: None,
            cer: DEFAULT_ERROR_RATE,
            wer: DEFAULT_ERROR_RATE,
        }
    }
}

// On-disk row; offsets are space separated, empty for none.
#[derive(Serialize, Deserialize)]
struct Row {
    wav: String,
    text: String,
    transcript: String,
    offsets: String,
    cer: f64,
    wer: f64,
}

impl From<Row> for CurriculumRecord {
    fn from(row: Row) -> Self {
        let offsets = parse_offsets(&row.offsets);
        if offsets.is_none() && !row.offsets.trim().is_empty() {
            tracing::warn!(wav = %row.wav, offsets = %row.offsets, "unreadable offsets, dropping them");
        }
        Self {
            wav: PathBuf::from(row.wav),
            text: row.text,
            transcript: row.transcript,
            offsets,
            cer: row.cer,
            wer: row.wer,
        }
    }
}

/// Offsets written either space separated (`0 4 9`) or as a list (`[0, 4, 9]`).
/// `None` for an empty field, `None`, or anything unparseable.
fn parse_offsets(field: &str) -> Option<Vec<u32>> {
    let inner = field.trim();
    let inner = inner
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(inner);
    if inner.trim().is_empty() || inner.trim() == "None" {
        return None;
    }
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.parse().ok())
        .collect()
}

impl From<&CurriculumRecord> for Row {
    fn from(record: &CurriculumRecord) -> Self {
        let offsets = record
            .offsets
            .as_ref()
            .map(|o| o.iter().map(u32::to_string).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        Self {
            wav: record.wav.to_string_lossy().into_owned(),
            text: record.text.clone(),
            transcript: record.transcript.clone(),
            offsets,
            cer: record.cer,
            wer: record.wer,
        }
    }
}

/// Read a curriculum CSV (header `wav,text,transcript,offsets,cer,wer`), keyed by wav path.
pub fn load_curriculum(path: &Path) -> Result<HashMap<PathBuf, CurriculumRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = HashMap::new();
    for row in reader.deserialize::<Row>() {
        let record = CurriculumRecord::from(row?);
        records.insert(record.wav.clone(), record);
    }
    tracing::info!(path = %path.display(), records = records.len(), "loaded curriculum");
    Ok(records)
}

/// Write records with a header row, in the order given.
pub fn save_curriculum<'a, I>(path: &Path, records: I) -> Result<()>
where
    I: IntoIterator<Item = &'a CurriculumRecord>,
{
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(Row::from(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reference text and character error rate for a manifest entry.
pub type CurriculumInfo<'a> = dyn Fn(&ManifestEntry) -> Result<(String, f64)> + 'a;

/// Chooses the entries used for one epoch.
pub trait CurriculumPolicy: Send + Sync {
    /// Select at least `min_len` entries (or all of them, if fewer exist).
    /// Must be a deterministic function of `epoch` and the inputs.
    fn sample(
        &self,
        entries: &[ManifestEntry],
        info: &CurriculumInfo<'_>,
        epoch: u64,
        min_len: usize,
    ) -> Result<Vec<ManifestEntry>>;
}

/// Weighted sampling without replacement, weight = character error rate.
///
/// Every entry whose error is above `easy_threshold` counts toward the subset
/// size, so the subset shrinks as the model masters the data but never below
/// `min_len`.
#[derive(Clone, Debug)]
pub struct ErrorWeightedCurriculum {
    pub easy_threshold: f64,
    pub min_weight: f64,
}

impl Default for ErrorWeightedCurriculum {
    fn default() -> Self {
        Self {
            easy_threshold: 0.05,
            min_weight: 1e-3,
        }
    }
}

impl CurriculumPolicy for ErrorWeightedCurriculum {
    fn sample(
        &self,
        entries: &[ManifestEntry],
        info: &CurriculumInfo<'_>,
        epoch: u64,
        min_len: usize,
    ) -> Result<Vec<ManifestEntry>> {
        let mut rng = StdRng::seed_from_u64(epoch);
        let mut hard = 0;
        let mut keyed = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let (_, cer) = info(entry)?;
            if cer > self.easy_threshold {
                hard += 1;
            }
            // Efraimidis-Spirakis: the k largest u^(1/w) are a weighted sample
            let weight = cer.max(self.min_weight);
            let u: f64 = rng.gen();
            keyed.push((u.powf(1.0 / weight), i));
        }

        let k = hard.max(min_len).min(entries.len());
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut chosen: Vec<usize> = keyed[..k].iter().map(|(_, i)| *i).collect();
        chosen.sort_unstable();
        tracing::debug!(epoch, selected = k, total = entries.len(), "curriculum sample");
        Ok(chosen.into_iter().map(|i| entries[i].clone()).collect())
    }
}
