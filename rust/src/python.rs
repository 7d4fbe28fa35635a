//! Python bindings: a dataset handle and a batch iterator for the training loop.

use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::{PyIOError, PyIndexError, PyRuntimeError, PyValueError};
use pyo3::types::{PyDict, PyDictMethods};
use pyo3::{pyclass, pymethods, Bound, PyErr, PyRef, PyResult, Python};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collate::Batch;
use crate::config::AudioConfig;
use crate::curriculum::CurriculumRecord;
use crate::dataset::Dataset;
use crate::error::Error;
use crate::labels::CharLabels;
use crate::loader::{Fetch, Loader, LoaderConfig};
use crate::parser::SpectrogramParser;
use crate::sampler::{BucketingSampler, Partition};

fn to_py_err(e: Error) -> PyErr {
    match e {
        Error::IndexOutOfRange { .. } => PyIndexError::new_err(e.to_string()),
        Error::Config(_) | Error::Parse { .. } => PyValueError::new_err(e.to_string()),
        Error::Io(_) | Error::Csv(_) => PyIOError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

#[pyclass(name = "AudioDataset")]
pub struct PyAudioDataset {
    inner: Arc<Dataset>,
}

#[pymethods]
impl PyAudioDataset {
    #[new]
    #[pyo3(signature = (
        manifest,
        cache_dir,
        labels,
        config = None,
        normalize = None,
        augment = false,
        max_items = None,
        curriculum = None,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        manifest: PathBuf,
        cache_dir: PathBuf,
        labels: String,
        config: Option<PathBuf>,
        normalize: Option<String>,
        augment: bool,
        max_items: Option<usize>,
        curriculum: Option<PathBuf>,
    ) -> PyResult<Self> {
        let mut audio = match config {
            Some(path) => AudioConfig::from_json_file(&path).map_err(|e| to_py_err(e.into()))?,
            None => AudioConfig::default(),
        };
        if normalize.is_some() {
            audio.normalize = normalize;
        }
        audio.augment = augment;

        let parser = SpectrogramParser::new(&audio, cache_dir).map_err(to_py_err)?;
        let dataset = Dataset::from_manifest(
            parser,
            &manifest,
            max_items,
            Arc::new(CharLabels::new(&labels)),
            curriculum.as_deref(),
        )
        .map_err(to_py_err)?;

        Ok(Self {
            inner: Arc::new(dataset),
        })
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }

    /// (features [161, T], label ids, audio path)
    fn __getitem__<'py>(
        &self,
        py: Python<'py>,
        index: usize,
    ) -> PyResult<(Bound<'py, PyArray2<f32>>, Bound<'py, PyArray1<u32>>, String)> {
        let sample = py.detach(|| self.inner.get(index)).map_err(to_py_err)?;
        Ok((
            sample.features.into_pyarray(py),
            PyArray1::from_vec(py, sample.targets),
            sample.path.to_string_lossy().into_owned(),
        ))
    }

    fn parse_audio<'py>(&self, py: Python<'py>, path: PathBuf) -> PyResult<Bound<'py, PyArray2<f32>>> {
        let spect = py
            .detach(|| self.inner.parser().parse_audio(&path))
            .map_err(to_py_err)?;
        Ok(spect.into_pyarray(py))
    }

    #[pyo3(signature = (epoch, sample = false))]
    fn set_curriculum_epoch(&self, py: Python<'_>, epoch: u64, sample: bool) -> PyResult<()> {
        py.detach(|| self.inner.set_curriculum_epoch(epoch, sample))
            .map_err(to_py_err)
    }

    #[pyo3(signature = (audio_path, reference, transcript, offsets, cer, wer))]
    fn update_curriculum(
        &self,
        audio_path: PathBuf,
        reference: String,
        transcript: String,
        offsets: Option<Vec<u32>>,
        cer: f64,
        wer: f64,
    ) {
        self.inner.update_curriculum(CurriculumRecord {
            wav: audio_path,
            text: reference,
            transcript,
            offsets,
            cer,
            wer,
        });
    }

    fn save_curriculum(&self, path: PathBuf) -> PyResult<()> {
        self.inner.save_curriculum(&path).map_err(to_py_err)
    }

    fn get_reference_transcript(&self, transcript_path: PathBuf) -> PyResult<String> {
        self.inner
            .get_reference_transcript(&transcript_path)
            .map_err(to_py_err)
    }

    /// Cache counters: hits, misses, transforms, stores.
    fn cache_stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.inner.parser().stats();
        let dict = PyDict::new(py);
        dict.set_item("cache_hits", stats.cache_hits)?;
        dict.set_item("cache_misses", stats.cache_misses)?;
        dict.set_item("transforms", stats.transforms)?;
        dict.set_item("stores", stats.stores)?;
        Ok(dict)
    }
}

/// One epoch of padded batches from bucketed bins.
#[pyclass(name = "BatchLoader")]
pub struct PyBatchLoader {
    loader: Mutex<Loader>,
    len: usize,
}

#[pymethods]
impl PyBatchLoader {
    #[new]
    #[pyo3(signature = (
        dataset,
        batch_size = 20,
        epoch = 0,
        rank = 0,
        num_replicas = 1,
        n_workers = 4,
        prefetch = 8,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        dataset: PyRef<'_, PyAudioDataset>,
        batch_size: usize,
        epoch: u64,
        rank: usize,
        num_replicas: usize,
        n_workers: usize,
        prefetch: usize,
    ) -> PyResult<Self> {
        if batch_size == 0 {
            return Err(PyValueError::new_err("batch_size must be > 0"));
        }
        if num_replicas == 0 || rank >= num_replicas {
            return Err(PyValueError::new_err(format!(
                "rank {rank} out of range for {num_replicas} replicas"
            )));
        }
        if n_workers == 0 {
            return Err(PyValueError::new_err("n_workers must be > 0"));
        }

        let mut sampler = BucketingSampler::new(
            dataset.inner.len(),
            batch_size,
            Some(Partition { rank, num_replicas }),
        );
        sampler.shuffle(epoch);
        let bins = sampler.bins();
        let len = bins.len();

        let loader = Loader::spawn(
            Arc::clone(&dataset.inner),
            bins,
            LoaderConfig { n_workers, prefetch },
        );
        Ok(Self {
            loader: Mutex::new(loader),
            len,
        })
    }

    fn __len__(&self) -> usize {
        self.len
    }

    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__<'py>(&self, py: Python<'py>) -> PyResult<Option<Bound<'py, PyDict>>> {
        loop {
            // Release GIL for blocking operation
            let fetched = py.detach(|| match self.loader.lock() {
                Ok(mut loader) => loader.fetch(Duration::from_millis(100)),
                Err(_) => Fetch::Ready(Err(Error::WorkerDisconnected)),
            });

            match fetched {
                Fetch::Ready(result) => {
                    let batch = result.map_err(to_py_err)?;
                    return Ok(Some(assemble_batch(py, batch)?));
                }
                // Timeout - check for Python signals (Ctrl-C)
                Fetch::Waiting => py.check_signals()?,
                Fetch::Finished => return Ok(None),
            }
        }
    }
}

fn assemble_batch(py: Python<'_>, batch: Batch) -> PyResult<Bound<'_, PyDict>> {
    let target_lengths: Vec<i64> = batch.target_lengths.iter().map(|&n| n as i64).collect();
    let paths: Vec<String> = batch
        .paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let dict = PyDict::new(py);
    dict.set_item("inputs", batch.inputs.into_pyarray(py))?;
    dict.set_item("targets", PyArray1::from_vec(py, batch.targets))?;
    dict.set_item("input_fraction", batch.input_fraction.into_pyarray(py))?;
    dict.set_item("target_lengths", PyArray1::from_vec(py, target_lengths))?;
    dict.set_item("paths", paths)?;
    Ok(dict)
}
