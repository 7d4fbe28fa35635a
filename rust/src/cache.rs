//! Content-addressed on-disk spectrogram cache.
//!
//! Layout: `<root>/<hash[0:2]>/<basename>.<hash[2:9]>.<tempo>.<channel>.npy`,
//! where `hash` is the SHA-1 of the audio file's bytes. Entries hold the raw
//! (pre-normalization) magnitude spectrogram, [161, frames].
//!
//! Writers never coordinate. Each write goes to a uniquely named temporary
//! sibling and is renamed into place, so readers see either nothing or a
//! complete file and concurrent writers of one key end with the last rename.
//! This relies on every writer of a key producing the same array, which holds
//! because only the canonical (unaugmented) variant is stored.
//!
//! Entries at the older `<audio_path>-<tempo>-<channel>.npy` location are moved
//! into the sharded layout on first lookup. Only bare `f32` arrays can be read
//! back. Older files holding a pickled `{'spect': ...}` mapping fail to load,
//! count as a miss, and are replaced by the next store.

use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::augment::TempoVariant;
use crate::config::ChannelSelector;
use crate::error::{Error, Result};
use crate::spectrogram::FREQ_BINS;

/// Hex characters of the content hash kept in the key.
const HASH_LEN: usize = 9;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub hash: String,
    pub basename: String,
    pub tempo: TempoVariant,
    pub channel: ChannelSelector,
}

impl CacheKey {
    /// Hash the file's bytes; the path only contributes its basename.
    pub fn for_file(audio_path: &Path, tempo: TempoVariant, channel: ChannelSelector) -> io::Result<Self> {
        let bytes = fs::read(audio_path)?;
        let digest = hex::encode(Sha1::digest(&bytes));
        Ok(Self {
            hash: digest[..HASH_LEN].to_string(),
            basename: audio_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tempo,
            channel,
        })
    }

    /// Path relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        let filename = format!(
            "{}.{}.{}.{}.npy",
            self.basename,
            &self.hash[2..],
            self.tempo.name(),
            self.channel
        );
        Path::new(&self.hash[..2]).join(filename)
    }
}

/// Result of a cache lookup: where the entry lives and, on a hit, its contents.
#[derive(Debug)]
pub struct CacheLookup {
    pub key: CacheKey,
    pub path: PathBuf,
    pub spect: Option<Array2<f32>>,
}

#[derive(Clone, Debug)]
pub struct SpectrogramCache {
    root: PathBuf,
}

impl SpectrogramCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Flat per-file cache name used before entries were sharded by hash.
    pub fn legacy_path(audio_path: &Path, tempo: TempoVariant, channel: ChannelSelector) -> PathBuf {
        PathBuf::from(format!(
            "{}-{}-{}.npy",
            audio_path.display(),
            tempo.name(),
            channel
        ))
    }

    /// Look up the entry for `audio_path`. Unreadable entries are logged and
    /// reported as misses. Fails only if the audio file itself can't be read.
    pub fn load(
        &self,
        audio_path: &Path,
        tempo: TempoVariant,
        channel: ChannelSelector,
    ) -> Result<CacheLookup> {
        let key = CacheKey::for_file(audio_path, tempo, channel)?;
        let path = self.path_for(&key);

        let legacy = Self::legacy_path(audio_path, tempo, channel);
        if legacy.exists() && !path.exists() {
            migrate(&legacy, &path);
        }

        let spect = if path.exists() {
            match read_entry(&path) {
                Ok(spect) => Some(spect),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = ?e, "can't load cache file: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(CacheLookup { key, path, spect })
    }

    /// Persist `spect` for `key`. Non-canonical tempo variants are not
    /// stored; returns whether a file was written.
    ///
    /// If `cancel` is raised while writing, the temporary file is removed and
    /// [`Error::Interrupted`] is returned.
    pub fn store(&self, key: &CacheKey, spect: &Array2<f32>, cancel: &AtomicBool) -> Result<bool> {
        if !key.tempo.is_canonical() {
            return Ok(false);
        }
        let path = self.path_for(key);
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp.npy")
            .tempfile_in(parent)?;

        let written = {
            let mut writer = BufWriter::new(CancellableWriter {
                inner: tmp.as_file_mut(),
                cancel,
            });
            spect
                .write_npy(&mut writer)
                .map_err(Error::from)
                .and_then(|()| writer.flush().map_err(Error::from))
        };

        // Dropping `tmp` on any early return removes the partial file.
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Interrupted(path));
        }
        written?;

        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        tracing::debug!(path = %path.display(), "cached spectrogram");
        Ok(true)
    }
}

fn read_entry(path: &Path) -> Result<Array2<f32>> {
    let file = BufReader::new(File::open(path)?);
    let spect = Array2::<f32>::read_npy(file)?;
    if spect.nrows() != FREQ_BINS {
        return Err(Error::Parse {
            what: "cache entry frequency bins",
            value: spect.nrows().to_string(),
        });
    }
    Ok(spect)
}

/// Best-effort move of a legacy entry into the sharded layout.
fn migrate(from: &Path, to: &Path) {
    tracing::info!(from = %from.display(), to = %to.display(), "moving legacy cache file");
    let moved = to
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| {
            fs::rename(from, to).or_else(|_| {
                // rename can't cross filesystems
                fs::copy(from, to)?;
                fs::remove_file(from)
            })
        });
    if let Err(e) = moved {
        tracing::warn!(from = %from.display(), error = %e, "legacy cache migration failed");
    }
}

/// Fails every write once `cancel` is raised.
struct CancellableWriter<'a, W> {
    inner: W,
    cancel: &'a AtomicBool,
}

impl<W: Write> Write for CancellableWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::Relaxed) {
            // not ErrorKind::Interrupted: write_all retries those
            return Err(io::Error::other("cache write cancelled"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
