//! # Repeated Stratified Cross-Validation
//!
//! Predicts an outcome from a feature matrix with two competing models:
//!
//! - Ordinary least squares with an intercept.
//! - Cosine-kernel ridge regression whose alpha is tuned by an inner
//!   stratified 5-fold grid search on the training partition only.
//!
//! Both are scored by the Pearson correlation between predictions and the
//! held-out outcome. Strata are quantile bins of the outcome, so every fold
//! sees the full outcome range.

use super::folds::{FoldError, RepeatedStratifiedKFold};
use super::grid::{GridError, search_alpha};
use super::progress::{CvProgressObserver, CvProgressStage};
use super::regression::{LinearRegression, RegressionError, Regressor, correlation_score};
use crate::shared::stats::{self, StatsError};
use crate::shared::tables::{self, TableError};
use itertools::Itertools;
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Kernel ridge regularization grid searched in every outer fold.
pub const DEFAULT_ALPHAS: [f64; 22] = [
    1e-5, 1e-4, 1e-3, 0.004, 0.007, 0.01, 0.04, 0.07, 0.1, 0.4, 0.7, 1.0, 1.5, 2.0, 2.5, 3.0,
    3.5, 4.0, 5.0, 10.0, 15.0, 20.0,
];

#[derive(Error, Debug)]
pub enum CvError {
    #[error("Feature matrix has {rows} rows but the outcome has {targets} values.")]
    LengthMismatch { rows: usize, targets: usize },
    #[error("Failed to stratify the outcome: {0}")]
    Stratification(#[from] StatsError),
    #[error(transparent)]
    Folds(#[from] FoldError),
    #[error("Kernel ridge grid search failed: {0}")]
    Grid(#[from] GridError),
    #[error("Linear regression failed: {0}")]
    Regression(#[from] RegressionError),
    #[error("Failed to persist cross-validation results: {0}")]
    Table(#[from] TableError),
}

/// Settings of one cross-validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CvConfig {
    pub n_splits: usize,
    pub n_repeats: usize,
    pub random_state: u64,
    pub alphas: Vec<f64>,
    pub inner_splits: usize,
    pub inner_random_state: u64,
    pub num_bins: usize,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            n_splits: 10,
            n_repeats: 1,
            random_state: 0,
            alphas: DEFAULT_ALPHAS.to_vec(),
            inner_splits: 5,
            inner_random_state: 0,
            num_bins: 8,
        }
    }
}

/// Test-partition scores of one outer split.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldScore {
    pub fold: usize,
    pub repeat: usize,
    pub linear: f64,
    pub kernel_ridge: f64,
    pub best_alpha: f64,
}

/// Runs the outer repeated stratified CV. Scores come back ordered by repeat,
/// then fold.
pub fn run_cv<P: CvProgressObserver>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &CvConfig,
    progress: &mut P,
) -> Result<Vec<FoldScore>, CvError> {
    if x.nrows() != y.len() {
        return Err(CvError::LengthMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    if config.alphas.is_empty() {
        return Err(GridError::EmptyGrid.into());
    }

    let outcome = y.to_vec();
    let strata = stats::quantile_bins(&outcome, config.num_bins)?;
    log_bin_counts(&strata);

    let outer = RepeatedStratifiedKFold::new(config.n_splits, config.n_repeats, config.random_state)?;
    let inner = RepeatedStratifiedKFold::new(config.inner_splits, 1, config.inner_random_state)?;
    let splits = outer.split(&strata)?;

    progress.on_stage_start(CvProgressStage::OuterSplits, splits.len());
    let mut scores = Vec::with_capacity(splits.len());
    for (completed, split) in splits.iter().enumerate() {
        let x_train = x.select(Axis(0), &split.train);
        let y_train = y.select(Axis(0), &split.train);
        let x_test = x.select(Axis(0), &split.test);
        let y_test = y.select(Axis(0), &split.test);

        let mut linear = LinearRegression::new();
        linear.fit(x_train.view(), y_train.view())?;
        let linear_corr = correlation_score(&linear, x_test.view(), y_test.view())?;

        let train_strata: Vec<usize> = split.train.iter().map(|&idx| strata[idx]).collect();
        let inner_splits = inner.split(&train_strata)?;
        let grid = search_alpha(x_train.view(), y_train.view(), &inner_splits, &config.alphas)?;
        let kernel_corr = correlation_score(&grid.model, x_test.view(), y_test.view())
            .map_err(GridError::from)?;

        log::debug!(
            "Repeat {} fold {}: LR r={:.4}, KRR r={:.4} (alpha={})",
            split.repeat,
            split.fold,
            linear_corr,
            kernel_corr,
            grid.best_alpha
        );
        scores.push(FoldScore {
            fold: split.fold,
            repeat: split.repeat,
            linear: linear_corr,
            kernel_ridge: kernel_corr,
            best_alpha: grid.best_alpha,
        });
        progress.on_stage_advance(CvProgressStage::OuterSplits, completed + 1);
    }
    progress.on_stage_finish(CvProgressStage::OuterSplits);

    log::info!(
        "Cross-validation finished: mean LR r={:.4}, mean KRR r={:.4} over {} splits",
        stats::mean(&scores.iter().map(|s| s.linear).collect::<Vec<_>>()),
        stats::mean(&scores.iter().map(|s| s.kernel_ridge).collect::<Vec<_>>()),
        scores.len()
    );
    Ok(scores)
}

fn log_bin_counts(strata: &[usize]) {
    let counts = strata
        .iter()
        .counts()
        .into_iter()
        .sorted()
        .map(|(bin, count)| format!("{bin}: {count}"))
        .join(", ");
    log::info!("Outcome bin sizes: {counts}");
}

/// Model that produced a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "LR")]
    LinearRegression,
    #[serde(rename = "KRR")]
    KernelRidge,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LinearRegression => "LR",
            Self::KernelRidge => "KRR",
        })
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LR" => Ok(Self::LinearRegression),
            "KRR" => Ok(Self::KernelRidge),
            other => Err(format!("unknown model '{other}' (expected LR or KRR)")),
        }
    }
}

/// One persisted cross-validation score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvResultRow {
    pub fold: usize,
    pub rep: usize,
    pub corr: f64,
    pub model: ModelKind,
    pub features: String,
    pub study: String,
    pub outcome: String,
    pub ext: String,
}

/// Labels copied onto every row of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLabels {
    pub features: String,
    pub study: String,
    pub outcome: String,
    pub ext: String,
}

/// All linear regression rows, then all kernel ridge rows.
pub fn result_rows(scores: &[FoldScore], labels: &ResultLabels) -> Vec<CvResultRow> {
    let row = |score: &FoldScore, model: ModelKind, corr: f64| CvResultRow {
        fold: score.fold,
        rep: score.repeat,
        corr,
        model,
        features: labels.features.clone(),
        study: labels.study.clone(),
        outcome: labels.outcome.clone(),
        ext: labels.ext.clone(),
    };
    scores
        .iter()
        .map(|s| row(s, ModelKind::LinearRegression, s.linear))
        .chain(
            scores
                .iter()
                .map(|s| row(s, ModelKind::KernelRidge, s.kernel_ridge)),
        )
        .collect()
}

/// Appends rows to the results table. Concurrent writers to the same file
/// are not coordinated.
pub fn append_results(path: &Path, rows: &[CvResultRow]) -> Result<(), CvError> {
    tables::append_rows(path, rows)?;
    log::info!("Appended {} rows to '{}'", rows.len(), path.display());
    Ok(())
}
