//! # K-fold index generation
//!
//! Splits each dataset's example range into k (train, validation) pairs.
//! Validation blocks are contiguous over the (optionally seeded-shuffled)
//! index order, so the result is identical across runs.

use crate::dataset::Dataset;
use crate::error::{KariError, Result};

/// One cross-validation split of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    /// Training indices, ascending.
    pub train: Vec<usize>,
    /// Validation indices, ascending.
    pub valid: Vec<usize>,
}

/// Fold table indexed by dataset position, then fold number.
pub type FoldTable = Vec<Vec<Fold>>;

/// K-fold splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KFold {
    n_splits: usize,
    shuffle: bool,
    seed: u64,
}

impl KFold {
    /// Non-shuffled splitter.
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            shuffle: false,
            seed: 42,
        }
    }

    /// Permute the index range with a generator seeded from `seed` before splitting.
    pub fn shuffled(n_splits: usize, seed: u64) -> Self {
        Self {
            n_splits,
            shuffle: true,
            seed,
        }
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Splits `0..n_samples` into `n_splits` folds.
    ///
    /// The first `n_samples % n_splits` validation blocks hold one extra sample.
    pub fn split(&self, n_samples: usize) -> Result<Vec<Fold>> {
        let k = self.n_splits;
        if k < 2 || k > n_samples {
            return Err(KariError::InvalidFolds {
                k,
                samples: n_samples,
            });
        }

        let mut order: Vec<usize> = (0..n_samples).collect();
        if self.shuffle {
            let mut rng = oorandom::Rand32::new(self.seed);
            for i in (1..order.len()).rev() {
                let j = rng.rand_range(0..(i as u32 + 1)) as usize;
                order.swap(i, j);
            }
        }

        let base = n_samples / k;
        let extra = n_samples % k;
        let mut folds = Vec::with_capacity(k);
        let mut start = 0;
        for fold in 0..k {
            let size = base + usize::from(fold < extra);
            let end = start + size;

            let mut valid = order[start..end].to_vec();
            let mut train: Vec<usize> = order[..start]
                .iter()
                .chain(&order[end..])
                .copied()
                .collect();
            valid.sort_unstable();
            train.sort_unstable();

            folds.push(Fold { train, valid });
            start = end;
        }

        Ok(folds)
    }
}

/// Computes train/validation indices for every fold of every dataset.
pub fn train_valid_indices(splitter: &KFold, datasets: &[Dataset]) -> Result<FoldTable> {
    datasets
        .iter()
        .map(|ds| splitter.split(ds.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::toy_dataset;

    fn assert_partition(folds: &[Fold], n: usize) {
        let mut seen = vec![0usize; n];
        for fold in folds {
            for &i in &fold.valid {
                seen[i] += 1;
            }
            assert_eq!(fold.train.len() + fold.valid.len(), n);
            assert!(fold.train.iter().all(|i| !fold.valid.contains(i)));
        }
        assert!(seen.iter().all(|&c| c == 1), "coverage: {seen:?}");
    }

    #[test]
    fn validation_sets_partition_range() {
        for n in [10, 11, 57, 100] {
            for k in [2, 3, 5, 10] {
                let folds = KFold::new(k).split(n).unwrap();
                assert_eq!(folds.len(), k);
                assert_partition(&folds, n);
            }
        }
    }

    #[test]
    fn unshuffled_blocks_are_contiguous() {
        let folds = KFold::new(3).split(10).unwrap();
        assert_eq!(folds[0].valid, vec![0, 1, 2, 3]);
        assert_eq!(folds[1].valid, vec![4, 5, 6]);
        assert_eq!(folds[2].valid, vec![7, 8, 9]);
        assert_eq!(folds[1].train, vec![0, 1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn two_datasets_five_folds() {
        let datasets = vec![toy_dataset("a", 100, 6, 3), toy_dataset("b", 60, 6, 5)];
        let table = train_valid_indices(&KFold::new(5), &datasets).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table[0].len(), 5);
        assert_eq!(table[1].len(), 5);
        assert!(table[0].iter().all(|f| f.valid.len() == 20));
        assert!(table[1].iter().all(|f| f.valid.len() == 12));
        assert_partition(&table[0], 100);
        assert_partition(&table[1], 60);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let a = KFold::new(4).split(37).unwrap();
        let b = KFold::new(4).split(37).unwrap();
        assert_eq!(a, b);

        let a = KFold::shuffled(4, 42).split(37).unwrap();
        let b = KFold::shuffled(4, 42).split(37).unwrap();
        assert_eq!(a, b);
        assert_partition(&a, 37);
    }

    #[test]
    fn shuffle_changes_membership() {
        let plain = KFold::new(4).split(40).unwrap();
        let shuffled = KFold::shuffled(4, 7).split(40).unwrap();
        assert_ne!(plain, shuffled);
    }

    #[test]
    fn rejects_invalid_k() {
        assert!(matches!(
            KFold::new(1).split(10),
            Err(KariError::InvalidFolds { k: 1, samples: 10 })
        ));
        assert!(matches!(
            KFold::new(11).split(10),
            Err(KariError::InvalidFolds { k: 11, samples: 10 })
        ));
    }
}
