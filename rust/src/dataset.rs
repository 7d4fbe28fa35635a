//! Index-addressable training samples: features, label ids, and audio path.
//!
//! The active sample list changes between epochs (curriculum subsetting and a
//! seeded shuffle), so it sits behind a lock; everything else is read-only
//! after construction and can be shared across loader workers.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use crate::curriculum::{
    self, CurriculumPolicy, CurriculumRecord, ErrorWeightedCurriculum, DEFAULT_ERROR_RATE,
};
use crate::error::{Error, Result};
use crate::labels::{LabelEncoder, TranscriptCache};
use crate::manifest::{load_manifest, ManifestEntry};
use crate::parser::SpectrogramParser;

/// One dataset item.
#[derive(Clone, Debug)]
pub struct Sample {
    /// [161, frames]
    pub features: Array2<f32>,
    pub targets: Vec<u32>,
    pub path: PathBuf,
}

pub struct Dataset {
    parser: SpectrogramParser,
    labels: Arc<dyn LabelEncoder>,
    all_ids: Vec<ManifestEntry>,
    ids: RwLock<Vec<ManifestEntry>>,
    curriculum: RwLock<BTreeMap<PathBuf, CurriculumRecord>>,
    transcripts: TranscriptCache,
    policy: Box<dyn CurriculumPolicy>,
}

impl Dataset {
    /// Dataset over `entries` in manifest order. Without a curriculum file every
    /// entry starts at maximal difficulty.
    pub fn new(
        parser: SpectrogramParser,
        entries: Vec<ManifestEntry>,
        labels: Arc<dyn LabelEncoder>,
        curriculum_path: Option<&Path>,
    ) -> Result<Self> {
        let curriculum: BTreeMap<_, _> = match curriculum_path {
            Some(path) => curriculum::load_curriculum(path)?.into_iter().collect(),
            None => entries
                .iter()
                .map(|e| (e.audio_path.clone(), CurriculumRecord::default_for(&e.audio_path)))
                .collect(),
        };

        Ok(Self {
            parser,
            labels,
            ids: RwLock::new(entries.clone()),
            all_ids: entries,
            curriculum: RwLock::new(curriculum),
            transcripts: TranscriptCache::new(),
            policy: Box::new(ErrorWeightedCurriculum::default()),
        })
    }

    pub fn from_manifest(
        parser: SpectrogramParser,
        manifest: &Path,
        max_items: Option<usize>,
        labels: Arc<dyn LabelEncoder>,
        curriculum_path: Option<&Path>,
    ) -> Result<Self> {
        let entries = load_manifest(manifest, max_items)?;
        Self::new(parser, entries, labels, curriculum_path)
    }

    pub fn with_policy(mut self, policy: Box<dyn CurriculumPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn parser(&self) -> &SpectrogramParser {
        &self.parser
    }

    pub fn labels(&self) -> &dyn LabelEncoder {
        self.labels.as_ref()
    }

    /// Active sample count for the current epoch.
    pub fn len(&self) -> usize {
        self.ids.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Manifest entry at `index` in the active ordering.
    pub fn entry(&self, index: usize) -> Result<ManifestEntry> {
        let ids = self.ids.read().unwrap();
        ids.get(index).cloned().ok_or(Error::IndexOutOfRange {
            index,
            len: ids.len(),
        })
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        self.get_with_cancel(index, self.parser.interrupt())
    }

    /// As [`get`](Self::get), with cache writes aborted when `cancel` is raised.
    pub fn get_with_cancel(&self, index: usize, cancel: &AtomicBool) -> Result<Sample> {
        let entry = self.entry(index)?;
        let features = self.parser.parse_audio_with_cancel(&entry.audio_path, cancel)?;
        let targets = self.parse_transcript(&entry.transcript_path)?;
        Ok(Sample {
            features,
            targets: targets.as_ref().clone(),
            path: entry.audio_path,
        })
    }

    pub fn parse_transcript(&self, transcript_path: &Path) -> Result<Arc<Vec<u32>>> {
        self.transcripts.get_or_parse(transcript_path, self.labels.as_ref())
    }

    /// Transcript text as the label set sees it.
    pub fn get_reference_transcript(&self, transcript_path: &Path) -> Result<String> {
        let labels = self.parse_transcript(transcript_path)?;
        Ok(self.labels.render(&labels))
    }

    /// Reference text and character error rate. Entries missing from the
    /// curriculum read their transcript and count as maximally difficult.
    pub fn get_curriculum_info(&self, entry: &ManifestEntry) -> Result<(String, f64)> {
        if let Some(record) = self.curriculum.read().unwrap().get(&entry.audio_path) {
            return Ok((record.text.clone(), record.cer));
        }
        let text = self.get_reference_transcript(&entry.transcript_path)?;
        Ok((text, DEFAULT_ERROR_RATE))
    }

    /// Choose and order the samples for `epoch`. With `sample` the curriculum
    /// policy picks a subset of at least half the manifest; otherwise the full
    /// manifest is used. Both are shuffled with `epoch` as the seed.
    pub fn set_curriculum_epoch(&self, epoch: u64, sample: bool) -> Result<()> {
        let mut ids = if sample {
            let min_len = self.all_ids.len().div_ceil(2);
            self.policy
                .sample(&self.all_ids, &|e| self.get_curriculum_info(e), epoch, min_len)?
        } else {
            self.all_ids.clone()
        };
        ids.shuffle(&mut StdRng::seed_from_u64(epoch));

        tracing::info!(epoch, sample, len = ids.len(), "curriculum epoch");
        *self.ids.write().unwrap() = ids;
        Ok(())
    }

    pub fn update_curriculum(&self, record: CurriculumRecord) {
        self.curriculum
            .write()
            .unwrap()
            .insert(record.wav.clone(), record);
    }

    pub fn curriculum_record(&self, audio_path: &Path) -> Option<CurriculumRecord> {
        self.curriculum.read().unwrap().get(audio_path).cloned()
    }

    /// Persist all records, ordered by audio path.
    pub fn save_curriculum(&self, path: &Path) -> Result<()> {
        let curriculum = self.curriculum.read().unwrap();
        curriculum::save_curriculum(path, curriculum.values())
    }
}
