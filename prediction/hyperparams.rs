//! # Hyperparameter Selection from Logged Metrics
//!
//! Each finetuning configuration directory holds one subfolder per inner fold
//! with a per-epoch metric log and a prediction table. For every fold, the
//! configuration whose log reaches the lowest value of the chosen metric wins
//! and its prediction table is kept. The winners are stacked in fold order.

use crate::shared::tables::{self, TableError};
use polars::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_METRIC: &str = "val_mae";
pub const DEFAULT_PREDICTION_FILE: &str = "test_pred.csv";
pub const LOG_FILE: &str = "log.csv";
pub const SOURCE_COLUMN: &str = "src_path";

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("Required file not found: '{0}'")]
    MissingFile(PathBuf),
    #[error("At least one configuration directory is required.")]
    NoConfigurations,
    #[error("At least one inner folder is required.")]
    NoInnerFolders,
    #[error("Metric column '{metric}' was not found in '{path}'.")]
    MissingMetric { metric: String, path: PathBuf },
    #[error("Metric column '{metric}' in '{path}' holds values that are not numbers.")]
    NonNumericMetric { metric: String, path: PathBuf },
    #[error(
        "Prediction table '{path}' has columns [{found}] but earlier tables have [{expected}]."
    )]
    ColumnMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

/// Where to look and what to minimize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    pub config_paths: Vec<PathBuf>,
    pub inner_folders: Vec<String>,
    pub metric: String,
    pub prediction_file: String,
}

impl SearchConfig {
    pub fn new(config_paths: Vec<PathBuf>, inner_folders: Vec<String>) -> Self {
        Self {
            config_paths,
            inner_folders,
            metric: DEFAULT_METRIC.to_string(),
            prediction_file: DEFAULT_PREDICTION_FILE.to_string(),
        }
    }
}

/// Winning configuration of one inner fold.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub inner_folder: String,
    /// `<config>/<inner folder>`
    pub source: PathBuf,
    pub min_metric: f64,
    /// Zero-based row of the log where the minimum was first reached.
    pub best_epoch: usize,
}

/// Winning predictions of every fold plus the selection summary.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub selections: Vec<Selection>,
    pub predictions: DataFrame,
}

fn require_file(path: PathBuf) -> Result<PathBuf, SelectionError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(SelectionError::MissingFile(path))
    }
}

fn metric_values(log_path: &Path, metric: &str) -> Result<Vec<Option<f64>>, SelectionError> {
    let df = tables::read_frame(log_path)?;
    if !df.get_column_names().iter().any(|c| c.as_str() == metric) {
        return Err(SelectionError::MissingMetric {
            metric: metric.to_string(),
            path: log_path.to_path_buf(),
        });
    }
    let original = df.column(metric)?;
    let casted = original.cast(&DataType::Float64)?;
    // Empty cells stay missing; anything else that fails to parse is an error.
    if casted.null_count() > original.null_count() {
        return Err(SelectionError::NonNumericMetric {
            metric: metric.to_string(),
            path: log_path.to_path_buf(),
        });
    }
    Ok(casted.f64()?.into_iter().collect())
}

/// Minimum of `metric` across the epochs of a log, with the first epoch that
/// reaches it. Null and NaN entries are skipped; `None` when nothing finite
/// remains.
pub fn min_logged_metric(
    log_path: &Path,
    metric: &str,
) -> Result<Option<(f64, usize)>, SelectionError> {
    let values = metric_values(log_path, metric)?;
    let mut best: Option<(f64, usize)> = None;
    for (epoch, value) in values.into_iter().enumerate() {
        let Some(value) = value.filter(|v| !v.is_nan()) else {
            continue;
        };
        if best.is_none_or(|(current, _)| value < current) {
            best = Some((value, epoch));
        }
    }
    Ok(best)
}

/// Runs the selection. Every configuration is checked for its log and
/// prediction file before anything is read.
pub fn search_hyperparameters(config: &SearchConfig) -> Result<SearchOutcome, SelectionError> {
    if config.config_paths.is_empty() {
        return Err(SelectionError::NoConfigurations);
    }
    if config.inner_folders.is_empty() {
        return Err(SelectionError::NoInnerFolders);
    }

    for folder in &config.inner_folders {
        for root in &config.config_paths {
            let dir = root.join(folder);
            require_file(dir.join(LOG_FILE))?;
            require_file(dir.join(&config.prediction_file))?;
        }
    }

    let mut selections = Vec::with_capacity(config.inner_folders.len());
    let mut predictions: Option<DataFrame> = None;

    for folder in &config.inner_folders {
        let mut reference = f64::INFINITY;
        let mut winner: Option<(PathBuf, usize)> = None;
        for root in &config.config_paths {
            let dir = root.join(folder);
            match min_logged_metric(&dir.join(LOG_FILE), &config.metric)? {
                Some((value, epoch)) if value < reference => {
                    reference = value;
                    winner = Some((dir, epoch));
                }
                Some(_) => {}
                None => log::debug!(
                    "No finite '{}' values logged in '{}'",
                    config.metric,
                    dir.display()
                ),
            }
        }

        let Some((source, best_epoch)) = winner else {
            log::warn!(
                "No configuration logged a finite '{}' for '{}'; the fold contributes no predictions",
                config.metric,
                folder
            );
            continue;
        };

        let table = load_prediction(&source.join(&config.prediction_file), &source)?;
        predictions = Some(match predictions {
            None => table,
            Some(mut stacked) => {
                check_columns(&stacked, &table, &source.join(&config.prediction_file))?;
                stacked.vstack_mut(&table)?;
                stacked
            }
        });

        log::info!(
            "{}: selected '{}' ({}={:.4} at epoch {})",
            folder,
            source.display(),
            config.metric,
            reference,
            best_epoch
        );
        selections.push(Selection {
            inner_folder: folder.clone(),
            source,
            min_metric: reference,
            best_epoch,
        });
    }

    Ok(SearchOutcome {
        selections,
        predictions: predictions.unwrap_or_else(DataFrame::empty),
    })
}

fn load_prediction(path: &Path, source: &Path) -> Result<DataFrame, SelectionError> {
    let mut table = tables::read_text_frame(path)?;
    let source_text = source.display().to_string();
    let column = Series::new(SOURCE_COLUMN.into(), vec![source_text; table.height()]);
    table.with_column(column)?;
    Ok(table)
}

fn check_columns(
    stacked: &DataFrame,
    table: &DataFrame,
    path: &Path,
) -> Result<(), SelectionError> {
    let names = |df: &DataFrame| -> Vec<String> {
        df.get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    };
    let expected = names(stacked);
    let found = names(table);
    if expected != found {
        return Err(SelectionError::ColumnMismatch {
            path: path.to_path_buf(),
            expected: expected.join(", "),
            found: found.join(", "),
        });
    }
    Ok(())
}

/// Writes the stacked predictions, creating parent directories.
pub fn write_predictions(path: &Path, outcome: &mut SearchOutcome) -> Result<(), SelectionError> {
    tables::write_frame(path, &mut outcome.predictions)?;
    log::info!(
        "Wrote {} selected predictions to '{}'",
        outcome.predictions.height(),
        path.display()
    );
    Ok(())
}

/// Training and validation metric per epoch of one finetuning run.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningCurve {
    pub training: Vec<Option<f64>>,
    pub validation: Vec<Option<f64>>,
}

#[derive(Debug, Serialize)]
struct CurvePoint {
    epoch: usize,
    training: Option<f64>,
    validation: Option<f64>,
}

impl LearningCurve {
    pub fn load(
        log_path: &Path,
        training_metric: &str,
        validation_metric: &str,
    ) -> Result<Self, SelectionError> {
        require_file(log_path.to_path_buf())?;
        Ok(Self {
            training: metric_values(log_path, training_metric)?,
            validation: metric_values(log_path, validation_metric)?,
        })
    }

    pub fn epochs(&self) -> usize {
        self.training.len()
    }

    /// First epoch with the lowest finite validation value.
    pub fn best_epoch(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (epoch, value) in self.validation.iter().enumerate() {
            let Some(value) = value.filter(|v| !v.is_nan()) else {
                continue;
            };
            if best.is_none_or(|(_, current)| value < current) {
                best = Some((epoch, value));
            }
        }
        best
    }

    pub fn write(&self, path: &Path) -> Result<(), SelectionError> {
        let points: Vec<CurvePoint> = self
            .training
            .iter()
            .zip(&self.validation)
            .enumerate()
            .map(|(epoch, (&training, &validation))| CurvePoint {
                epoch,
                training,
                validation,
            })
            .collect();
        tables::write_rows(path, &points)?;
        Ok(())
    }
}
