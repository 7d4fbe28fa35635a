//! Bucketing sampler: batches of neighbouring indices, shuffled per epoch.
//!
//! Indices are assumed to be sorted by duration upstream, so each contiguous
//! bin holds similarly sized samples. With a [`Partition`] the bin list is
//! padded by wrap-around to a multiple of the replica count and every replica
//! takes every Nth bin from its rank; all replicas derive the same permutation
//! from the epoch, so no coordination is needed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// This process's slice of a distributed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub rank: usize,
    pub num_replicas: usize,
}

impl Default for Partition {
    fn default() -> Self {
        Self {
            rank: 0,
            num_replicas: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BucketingSampler {
    base: Vec<Vec<usize>>,
    bins: Vec<Vec<usize>>,
    partition: Partition,
}

impl BucketingSampler {
    /// # Panics
    ///
    /// If `batch_size` or `num_replicas` is zero, or `rank >= num_replicas`.
    pub fn new(len: usize, batch_size: usize, partition: Option<Partition>) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        let partition = partition.unwrap_or_default();
        assert!(partition.num_replicas > 0, "num_replicas must be positive");
        assert!(
            partition.rank < partition.num_replicas,
            "rank {} out of range for {} replicas",
            partition.rank,
            partition.num_replicas
        );

        let ids: Vec<usize> = (0..len).collect();
        let base: Vec<Vec<usize>> = ids.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Self {
            bins: base.clone(),
            base,
            partition,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Bins in the current epoch order, before partitioning.
    pub fn all_bins(&self) -> &[Vec<usize>] {
        &self.bins
    }

    /// Reorder bins and the indices inside them for `epoch`. The result
    /// depends only on `epoch`, not on earlier calls.
    pub fn shuffle(&mut self, epoch: u64) {
        let mut rng = StdRng::seed_from_u64(epoch);
        let mut bins = self.base.clone();
        bins.shuffle(&mut rng);
        for bin in &mut bins {
            bin.shuffle(&mut rng);
        }
        self.bins = bins;
    }

    /// Bins this replica yields this epoch.
    pub fn bins(&self) -> Vec<Vec<usize>> {
        let Partition { rank, num_replicas } = self.partition;
        if self.bins.is_empty() {
            return Vec::new();
        }
        let total = self.len() * num_replicas;
        self.bins
            .iter()
            .cycle()
            .take(total)
            .skip(rank)
            .step_by(num_replicas)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Vec<usize>> {
        self.bins().into_iter()
    }

    /// Bins per replica per epoch.
    pub fn len(&self) -> usize {
        self.bins.len().div_ceil(self.partition.num_replicas)
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_contiguous_bins() {
        let sampler = BucketingSampler::new(10, 4, None);
        assert_eq!(
            sampler.bins(),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
        assert_eq!(sampler.len(), 3);
    }

    #[test]
    fn test_shuffle_keeps_bin_contents() {
        let mut sampler = BucketingSampler::new(20, 5, None);
        sampler.shuffle(11);
        let bins = sampler.bins();
        assert_eq!(bins.len(), 4);
        for bin in &bins {
            let lo = bin.iter().min().unwrap();
            let set: BTreeSet<usize> = bin.iter().copied().collect();
            let expected: BTreeSet<usize> = (*lo..lo + 5).collect();
            assert_eq!(set, expected);
            assert_eq!(lo % 5, 0);
        }
    }

    #[test]
    fn test_epoch_shuffle_is_deterministic() {
        let mut a = BucketingSampler::new(100, 4, None);
        let mut b = BucketingSampler::new(100, 4, None);
        a.shuffle(5);
        b.shuffle(5);
        assert_eq!(a.bins(), b.bins());

        b.shuffle(6);
        assert_ne!(a.bins(), b.bins());

        // not cumulative
        b.shuffle(5);
        assert_eq!(a.bins(), b.bins());
    }

    #[test]
    fn test_replicas_cover_every_bin() {
        // 10 bins over 3 replicas: padded to 12 with bins 0 and 1 repeated
        let replicas = 3;
        let mut seen = Vec::new();
        let mut reference = BucketingSampler::new(40, 4, None);
        reference.shuffle(9);

        for rank in 0..replicas {
            let mut sampler = BucketingSampler::new(
                40,
                4,
                Some(Partition {
                    rank,
                    num_replicas: replicas,
                }),
            );
            sampler.shuffle(9);
            assert_eq!(sampler.len(), 4);
            assert_eq!(sampler.bins().len(), 4);
            seen.extend(sampler.bins());
        }

        assert_eq!(seen.len(), 12);
        let mut expected = reference.all_bins().to_vec();
        expected.extend_from_slice(&reference.all_bins()[..2]);

        let mut seen_sorted = seen.clone();
        seen_sorted.sort();
        expected.sort();
        assert_eq!(seen_sorted, expected);

        let unique: BTreeSet<Vec<usize>> = seen.into_iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_rank_takes_every_nth_bin() {
        let sampler = BucketingSampler::new(
            10,
            2,
            Some(Partition {
                rank: 1,
                num_replicas: 2,
            }),
        );
        // five bins padded to six with the first one
        assert_eq!(sampler.bins(), vec![vec![2, 3], vec![6, 7], vec![0, 1]]);
    }

    #[test]
    fn test_empty() {
        let sampler = BucketingSampler::new(0, 4, Some(Partition { rank: 1, num_replicas: 2 }));
        assert!(sampler.is_empty());
        assert!(sampler.bins().is_empty());
    }
}
