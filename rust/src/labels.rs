//! Transcript label encoding and the per-dataset transcript cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::Result;

/// Maps transcript text to label ids and back.
pub trait LabelEncoder: Send + Sync {
    fn parse(&self, text: &str) -> Vec<u32>;
    fn render(&self, labels: &[u32]) -> String;
}

/// One label per character of an alphabet. Alphabet and text are both
/// lowercased; characters outside the alphabet are dropped.
#[derive(Clone, Debug)]
pub struct CharLabels {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl CharLabels {
    pub fn new(alphabet: &str) -> Self {
        let chars: Vec<char> = alphabet.chars().flat_map(char::to_lowercase).collect();
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self { chars, index }
    }
}

impl LabelEncoder for CharLabels {
    fn parse(&self, text: &str) -> Vec<u32> {
        text.trim()
            .chars()
            .flat_map(char::to_lowercase)
            .filter_map(|c| self.index.get(&c).copied())
            .collect()
    }

    fn render(&self, labels: &[u32]) -> String {
        labels
            .iter()
            .filter_map(|&l| self.chars.get(l as usize))
            .collect()
    }
}

/// Parsed transcripts keyed by path. Transcript files are treated as immutable
/// for the lifetime of the cache.
#[derive(Default)]
pub struct TranscriptCache {
    entries: RwLock<HashMap<PathBuf, Arc<Vec<u32>>>>,
}

impl TranscriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `path` with `labels`, reading the file only the first time. An
    /// empty path is an empty transcript.
    pub fn get_or_parse(&self, path: &Path, labels: &dyn LabelEncoder) -> Result<Arc<Vec<u32>>> {
        if let Some(hit) = self.entries.read().unwrap().get(path) {
            return Ok(Arc::clone(hit));
        }

        let text = if path.as_os_str().is_empty() {
            String::new()
        } else {
            std::fs::read_to_string(path)?
        };
        let parsed = Arc::new(labels.parse(&text));

        let mut guard = self.entries.write().unwrap();
        let entry = guard.entry(path.to_path_buf()).or_insert(parsed);
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHABET: &str = "_' abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn test_char_labels() {
        let labels = CharLabels::new(ALPHABET);
        let ids = labels.parse("Hello, World\n");
        assert_eq!(labels.render(&ids), "hello world");
        assert_eq!(ids[0], 10);
    }

    #[test]
    fn test_transcripts_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, "abc").unwrap();

        let labels = CharLabels::new(ALPHABET);
        let cache = TranscriptCache::new();
        let first = cache.get_or_parse(&path, &labels).unwrap();

        // later edits are not observed
        std::fs::write(&path, "zzz").unwrap();
        let second = cache.get_or_parse(&path, &labels).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(labels.render(&second), "abc");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_empty_path_is_empty_transcript() {
        let labels = CharLabels::new(ALPHABET);
        let cache = TranscriptCache::new();
        assert!(cache.get_or_parse(Path::new(""), &labels).unwrap().is_empty());
    }

    #[test]
    fn test_caches_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, "abc").unwrap();
        let labels = CharLabels::new(ALPHABET);

        let a = TranscriptCache::new();
        a.get_or_parse(&path, &labels).unwrap();
        let b = TranscriptCache::new();
        assert!(b.is_empty());
    }
}
