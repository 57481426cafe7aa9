//! # Repeated Stratified K-Fold Splitting
//!
//! Assigns every sample to one of `n_splits` test folds per repeat so that
//! each stratum (an outcome quantile bin) is spread as evenly as possible
//! across the folds. One seeded generator drives all repeats, so a given seed
//! always reproduces the same partitions.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FoldError {
    #[error("At least 2 splits are required, but {0} were requested.")]
    TooFewSplits(usize),
    #[error("At least 1 repeat is required.")]
    NoRepeats,
    #[error("Cannot split {samples} samples into {n_splits} folds.")]
    TooFewSamples { samples: usize, n_splits: usize },
    #[error(
        "Insufficient data: outcome bin {stratum} has only {members} samples, but stratified {n_splits}-fold splitting needs at least {n_splits} per bin."
    )]
    InsufficientStratum {
        stratum: usize,
        members: usize,
        n_splits: usize,
    },
}

/// One train/test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub fold: usize,
    pub repeat: usize,
    /// Ascending sample indices.
    pub train: Vec<usize>,
    /// Ascending sample indices.
    pub test: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatedStratifiedKFold {
    n_splits: usize,
    n_repeats: usize,
    seed: u64,
}

impl RepeatedStratifiedKFold {
    pub fn new(n_splits: usize, n_repeats: usize, seed: u64) -> Result<Self, FoldError> {
        if n_splits < 2 {
            return Err(FoldError::TooFewSplits(n_splits));
        }
        if n_repeats == 0 {
            return Err(FoldError::NoRepeats);
        }
        Ok(Self {
            n_splits,
            n_repeats,
            seed,
        })
    }

    /// Splits samples labelled by `strata`. Splits are ordered by repeat, then
    /// fold.
    pub fn split(&self, strata: &[usize]) -> Result<Vec<Split>, FoldError> {
        self.validate(strata)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut splits = Vec::with_capacity(self.n_splits * self.n_repeats);

        for repeat in 0..self.n_repeats {
            let test_folds = self.assign_test_folds(strata, &mut rng);
            for fold in 0..self.n_splits {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..strata.len()).partition(|&idx| test_folds[idx] == fold);
                splits.push(Split {
                    fold,
                    repeat,
                    train,
                    test,
                });
            }
        }
        Ok(splits)
    }

    fn validate(&self, strata: &[usize]) -> Result<(), FoldError> {
        if strata.len() < self.n_splits {
            return Err(FoldError::TooFewSamples {
                samples: strata.len(),
                n_splits: self.n_splits,
            });
        }
        for (&stratum, &members) in &stratum_counts(strata) {
            if members < self.n_splits {
                return Err(FoldError::InsufficientStratum {
                    stratum,
                    members,
                    n_splits: self.n_splits,
                });
            }
        }
        Ok(())
    }

    /// Samples sorted by stratum are dealt round-robin onto folds to decide
    /// how many of each stratum every fold receives; the fold labels within a
    /// stratum are then shuffled.
    fn assign_test_folds(&self, strata: &[usize], rng: &mut StdRng) -> Vec<usize> {
        let counts = stratum_counts(strata);
        let mut sorted: Vec<usize> = strata.to_vec();
        sorted.sort_unstable();

        let mut allocation: BTreeMap<usize, Vec<usize>> = counts
            .keys()
            .map(|&stratum| (stratum, vec![0; self.n_splits]))
            .collect();
        for (position, stratum) in sorted.iter().enumerate() {
            if let Some(per_fold) = allocation.get_mut(stratum) {
                per_fold[position % self.n_splits] += 1;
            }
        }

        let mut test_folds = vec![0usize; strata.len()];
        for (stratum, per_fold) in allocation {
            let mut labels: Vec<usize> = per_fold
                .iter()
                .enumerate()
                .flat_map(|(fold, &n)| std::iter::repeat_n(fold, n))
                .collect();
            labels.shuffle(rng);
            let members = strata
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s == stratum)
                .map(|(idx, _)| idx);
            for (idx, label) in members.zip(labels) {
                test_folds[idx] = label;
            }
        }
        test_folds
    }
}

fn stratum_counts(strata: &[usize]) -> BTreeMap<usize, usize> {
    let mut counts = BTreeMap::new();
    for &s in strata {
        *counts.entry(s).or_insert(0) += 1;
    }
    counts
}
