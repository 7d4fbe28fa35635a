//! Multi-threaded batch loader.
//!
//! Architecture:
//! Feeder Thread -> Job Channel -> Worker Threads -> Result Channel -> Consumer
//!
//! - Feeder sends `(seq, bin)` jobs in sampler order
//! - Workers load every sample of a bin through the dataset and collate it
//! - Consumer reorders results by `seq`, so batches come out in sampler order
//!
//! Each loader owns its shutdown flag and passes it to the dataset as the
//! cancel signal for cache writes, so dropping one loader aborts only its own
//! work. Other loaders on the same dataset keep running.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::collate::{collate, Batch};
use crate::dataset::Dataset;
use crate::error::{Error, Result};

const POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct LoaderConfig {
    pub n_workers: usize,
    /// Jobs and finished batches that may be queued ahead of the consumer.
    pub prefetch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            n_workers: 4,
            prefetch: 8,
        }
    }
}

/// Result of waiting on the loader for a bounded time.
pub enum Fetch {
    Ready(Result<Batch>),
    Waiting,
    Finished,
}

pub struct Loader {
    results: Receiver<(usize, Result<Batch>)>,
    pending: BTreeMap<usize, Result<Batch>>,
    next: usize,
    total: usize,
    shutdown: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Loader {
    /// Start loading `bins` (lists of dataset indices), one batch per bin.
    pub fn spawn(dataset: Arc<Dataset>, bins: Vec<Vec<usize>>, config: LoaderConfig) -> Self {
        let n_workers = config.n_workers.max(1);
        let capacity = config.prefetch.max(1);
        let total = bins.len();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (job_tx, job_rx) = bounded::<(usize, Vec<usize>)>(capacity);
        let (result_tx, results) = bounded(capacity);

        let feeder = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || feeder_main(bins, job_tx, shutdown))
        };

        let workers = (0..n_workers)
            .map(|_| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let dataset = Arc::clone(&dataset);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || worker_main(dataset, job_rx, result_tx, shutdown))
            })
            .collect();

        tracing::debug!(batches = total, workers = n_workers, "loader started");
        Self {
            results,
            pending: BTreeMap::new(),
            next: 0,
            total,
            shutdown,
            feeder: Some(feeder),
            workers,
        }
    }

    /// Batches not yet returned.
    pub fn remaining(&self) -> usize {
        self.total - self.next
    }

    /// Wait up to `timeout` for the next batch in order.
    pub fn fetch(&mut self, timeout: Duration) -> Fetch {
        if self.next >= self.total {
            return Fetch::Finished;
        }
        loop {
            if let Some(result) = self.pending.remove(&self.next) {
                self.next += 1;
                return Fetch::Ready(result);
            }
            match self.results.recv_timeout(timeout) {
                Ok((seq, result)) => {
                    self.pending.insert(seq, result);
                }
                Err(RecvTimeoutError::Timeout) => return Fetch::Waiting,
                Err(RecvTimeoutError::Disconnected) => {
                    // every worker is gone with batches still missing
                    self.next = self.total;
                    return Fetch::Ready(Err(Error::WorkerDisconnected));
                }
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.feeder.take() {
            let _ = h.join();
        }
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
    }
}

impl Iterator for Loader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.fetch(POLL) {
                Fetch::Ready(result) => return Some(result),
                Fetch::Waiting => continue,
                Fetch::Finished => return None,
            }
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}

// --- Feeder Thread ---

fn feeder_main(bins: Vec<Vec<usize>>, job_tx: Sender<(usize, Vec<usize>)>, shutdown: Arc<AtomicBool>) {
    for job in bins.into_iter().enumerate() {
        if !send_until_shutdown(&job_tx, job, &shutdown) {
            return;
        }
    }
}

/// Send with retry on timeout, checking shutdown between attempts.
fn send_until_shutdown<T>(tx: &Sender<T>, mut item: T, shutdown: &AtomicBool) -> bool {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

// --- Worker Thread ---

fn worker_main(
    dataset: Arc<Dataset>,
    job_rx: Receiver<(usize, Vec<usize>)>,
    result_tx: Sender<(usize, Result<Batch>)>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (seq, bin) = match job_rx.recv_timeout(POLL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let result = bin
            .iter()
            .map(|&index| dataset.get_with_cancel(index, &shutdown))
            .collect::<Result<Vec<_>>>()
            .map(collate);

        match &result {
            Err(Error::Interrupted(_)) if shutdown.load(Ordering::Relaxed) => return,
            Err(e) => tracing::warn!(seq, error = %e, "failed to load batch"),
            Ok(_) => {}
        }

        if !send_until_shutdown(&result_tx, (seq, result), &shutdown) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{dataset, fixture};
    use crate::sampler::BucketingSampler;
    use std::path::PathBuf;

    #[test]
    fn test_batches_arrive_in_sampler_order() {
        let fixture = fixture(7);
        let ds = Arc::new(dataset(&fixture, None));
        let mut sampler = BucketingSampler::new(ds.len(), 2, None);
        sampler.shuffle(3);
        let bins = sampler.bins();

        let loader = Loader::spawn(
            Arc::clone(&ds),
            bins.clone(),
            LoaderConfig {
                n_workers: 3,
                prefetch: 2,
            },
        );
        let batches: Vec<Batch> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 4);

        for (batch, bin) in batches.iter().zip(&bins) {
            // longer clips have larger indices, and collate puts them first
            let mut expected: Vec<PathBuf> = bin
                .iter()
                .map(|&i| ds.entry(i).unwrap().audio_path)
                .collect();
            expected.sort_by(|a, b| b.cmp(a));
            assert_eq!(batch.paths, expected);
            assert_eq!(batch.inputs.dim().0, bin.len());
        }
    }

    #[test]
    fn test_failed_batch_does_not_stop_loader() {
        let fixture = fixture(4);
        std::fs::write(fixture.dir.path().join("2.wav"), b"not audio").unwrap();
        let ds = Arc::new(dataset(&fixture, None));
        let bins = BucketingSampler::new(ds.len(), 1, None).bins();

        let results: Vec<Result<Batch>> = Loader::spawn(ds, bins, LoaderConfig::default()).collect();
        assert_eq!(results.len(), 4);
        assert!(results[2].is_err());
        assert!(results.iter().enumerate().all(|(i, r)| i == 2 || r.is_ok()));
    }

    #[test]
    fn test_drop_mid_epoch_leaves_dataset_usable() {
        let fixture = fixture(6);
        let ds = Arc::new(dataset(&fixture, None));
        let bins = BucketingSampler::new(ds.len(), 1, None).bins();

        let mut loader = Loader::spawn(
            Arc::clone(&ds),
            bins,
            LoaderConfig {
                n_workers: 2,
                prefetch: 1,
            },
        );
        assert!(loader.next().unwrap().is_ok());
        assert_eq!(loader.remaining(), 5);
        drop(loader);

        assert!(!ds.parser().interrupt().load(Ordering::Relaxed));
        assert!(ds.get(5).is_ok());
    }

    #[test]
    fn test_dropping_one_loader_keeps_the_next_running() {
        let fixture = fixture(12);
        let ds = Arc::new(dataset(&fixture, None));
        let bins = BucketingSampler::new(ds.len(), 1, None).bins();
        let config = LoaderConfig {
            n_workers: 2,
            prefetch: 1,
        };

        // next epoch's loader is built before the previous one is released
        let mut previous = Loader::spawn(Arc::clone(&ds), bins.clone(), config);
        assert!(previous.next().unwrap().is_ok());
        let current = Loader::spawn(Arc::clone(&ds), bins, config);
        drop(previous);

        let results: Vec<Result<Batch>> = current.collect();
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_no_bins() {
        let fixture = fixture(1);
        let ds = Arc::new(dataset(&fixture, None));
        let mut loader = Loader::spawn(ds, Vec::new(), LoaderConfig::default());
        assert!(loader.next().is_none());
    }
}
