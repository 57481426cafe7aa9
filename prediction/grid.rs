//! Grid search over the kernel ridge regularization strength.

use super::folds::Split;
use super::regression::{KernelRidge, RegressionError, Regressor, correlation_score};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("The alpha grid is empty.")]
    EmptyGrid,
    #[error("Grid search needs at least one validation split.")]
    NoSplits,
    #[error(transparent)]
    Regression(#[from] RegressionError),
}

/// Outcome of a grid search, with the winning model refitted on all rows.
#[derive(Debug, Clone)]
pub struct GridSearch {
    pub best_alpha: f64,
    pub best_score: f64,
    /// Mean validation correlation per alpha, in grid order.
    pub mean_scores: Vec<f64>,
    pub model: KernelRidge,
}

/// Mean validation correlation of one alpha across `splits`.
fn mean_validation_score(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    splits: &[Split],
    alpha: f64,
) -> Result<f64, RegressionError> {
    let mut total = 0.0;
    for split in splits {
        let mut model = KernelRidge::new(alpha)?;
        model.fit(
            x.select(Axis(0), &split.train).view(),
            y.select(Axis(0), &split.train).view(),
        )?;
        total += correlation_score(
            &model,
            x.select(Axis(0), &split.test).view(),
            y.select(Axis(0), &split.test).view(),
        )?;
    }
    Ok(total / splits.len() as f64)
}

/// Index of the highest finite score; the first wins ties. NaN scores rank
/// last, and an all-NaN grid falls back to the first entry.
fn best_index(scores: &[f64]) -> usize {
    let mut best: Option<usize> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        if best.is_none_or(|b| score > scores[b]) {
            best = Some(idx);
        }
    }
    best.unwrap_or_else(|| {
        log::warn!("Every alpha produced an undefined validation correlation; using the first");
        0
    })
}

/// Scores every alpha on `splits` (in parallel), then refits the best alpha on
/// all rows of `x`.
pub fn search_alpha(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    splits: &[Split],
    alphas: &[f64],
) -> Result<GridSearch, GridError> {
    if alphas.is_empty() {
        return Err(GridError::EmptyGrid);
    }
    if splits.is_empty() {
        return Err(GridError::NoSplits);
    }

    let mean_scores = alphas
        .par_iter()
        .map(|&alpha| mean_validation_score(x, y, splits, alpha))
        .collect::<Result<Vec<f64>, _>>()?;

    let best = best_index(&mean_scores);
    let best_alpha = alphas[best];
    log::debug!(
        "Grid search chose alpha={best_alpha} (mean validation r={:.4})",
        mean_scores[best]
    );

    let mut model = KernelRidge::new(best_alpha)?;
    model.fit(x, y)?;
    Ok(GridSearch {
        best_alpha,
        best_score: mean_scores[best],
        mean_scores,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folds::RepeatedStratifiedKFold;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn ties_go_to_the_first_alpha_and_nan_ranks_last() {
        assert_eq!(best_index(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(best_index(&[f64::NAN, 0.1, 0.0]), 1);
        assert_eq!(best_index(&[f64::NAN, f64::NAN]), 0);
    }

    #[test]
    fn search_scores_every_alpha() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 60;
        let x = Array2::from_shape_fn((n, 3), |_| rng.gen_range(-1.0..1.0));
        let y: Array1<f64> = x.rows().into_iter().map(|r| r[0] - 0.5 * r[1]).collect();
        let strata: Vec<usize> = (0..n).map(|i| i % 4).collect();
        let splits = RepeatedStratifiedKFold::new(5, 1, 0)
            .unwrap()
            .split(&strata)
            .unwrap();

        let alphas = [1e-3, 0.1, 10.0];
        let result = search_alpha(x.view(), y.view(), &splits, &alphas).unwrap();
        assert_eq!(result.mean_scores.len(), 3);
        assert!(alphas.contains(&result.best_alpha));
        assert!(result.best_score > 0.3);
        assert_eq!(result.model.alpha(), result.best_alpha);
    }

    #[test]
    fn empty_grid_is_rejected() {
        let x = Array2::<f64>::zeros((4, 1));
        let y = Array1::<f64>::zeros(4);
        assert!(matches!(
            search_alpha(x.view(), y.view(), &[], &[]),
            Err(GridError::EmptyGrid)
        ));
    }
}
