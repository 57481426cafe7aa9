//! # Cohort Data Loading and Validation
//!
//! Reads the per-study analysis table (one row per subject, sample id in the
//! first column) and turns the requested feature columns and outcome into
//! `ndarray` structures for cross-validation.
//!
//! - Feature Sets: the columns are derived from a `FeatureSet`, which names
//!   the demographic covariates and which brain-age-gap features to include.
//! - User-Centric Errors: missing columns, nulls, non-numeric and non-finite
//!   values are reported through `DataError` with the offending column.

use crate::shared::tables::{self, TableError};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("Failed to read the data file: {0}")]
    Table(#[from] TableError),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to a number. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Complete data is required."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The input file contains no data rows.")]
    NoRows,
    #[error("At least one feature column is required.")]
    NoFeatures,
}

/// Which predictors enter the model: demographic covariates plus, optionally,
/// baseline and change brain-age gaps for one extension (`pretrained`,
/// `finetuned`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    pub covariates: Vec<String>,
    pub baseline_bag: bool,
    pub change_bag: bool,
    pub extension: String,
}

impl FeatureSet {
    pub fn baseline_column(&self) -> String {
        format!("bl_BAG_{}", self.extension)
    }

    pub fn change_column(&self) -> String {
        format!("ch_BAG_{}", self.extension)
    }

    /// Column names in model order: covariates, then baseline, then change.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = self.covariates.clone();
        if self.baseline_bag {
            columns.push(self.baseline_column());
        }
        if self.change_bag {
            columns.push(self.change_column());
        }
        columns
    }

    /// Human-readable label recorded with every result row.
    pub fn describe(&self) -> String {
        let mut label = String::from("demographics");
        if self.baseline_bag {
            label.push_str(" + baseline BAG");
        }
        if self.change_bag {
            label.push_str(" + change in BAG");
        }
        label
    }

    /// The BAG variable that names the study's data table.
    pub fn table_variable(&self) -> String {
        if self.change_bag {
            self.change_column()
        } else {
            self.baseline_column()
        }
    }
}

/// Conventional location of a study table:
/// `<dir>/<study>_<bag variable>_VS_<outcome>.csv`.
pub fn default_data_file(dir: &Path, study: &str, features: &FeatureSet, outcome: &str) -> PathBuf {
    dir.join(format!(
        "{study}_{}_VS_{outcome}.csv",
        features.table_variable()
    ))
}

/// Validated predictors and outcome.
#[derive(Debug, Clone)]
pub struct CohortData {
    pub ids: Vec<String>,
    pub feature_names: Vec<String>,
    /// Shape: [n_samples, n_features].
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

pub fn load_cohort(
    path: &Path,
    features: &FeatureSet,
    outcome: &str,
) -> Result<CohortData, DataError> {
    let feature_names = features.columns();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatures);
    }

    log::info!("Loading cohort data from '{}'", path.display());
    let df = tables::read_frame(path)?;

    if df.height() == 0 {
        return Err(DataError::NoRows);
    }

    let column_names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    for required in feature_names.iter().map(String::as_str).chain([outcome]) {
        if !column_names.iter().any(|c| c == required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let ids = match column_names.first() {
        Some(first) => extract_ids(&df, first)?,
        None => return Err(DataError::NoRows),
    };

    let n = df.height();
    let mut x = Array2::zeros((n, feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        let values = extract_numeric_column(&df, name)?;
        for (i, v) in values.into_iter().enumerate() {
            x[[i, j]] = v;
        }
    }
    let y = Array1::from(extract_numeric_column(&df, outcome)?);

    log::info!(
        "Loaded {} samples with features [{}] and outcome '{}'",
        n,
        feature_names.join(", "),
        outcome
    );
    Ok(CohortData {
        ids,
        feature_names,
        x,
        y,
    })
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        found_type: format!("{:?}", series.dtype()),
    };
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_ids(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let series = df.column(column_name)?;
    Ok((0..df.height())
        .map(|i| match series.get(i) {
            Ok(AnyValue::Null) | Err(_) => (i + 1).to_string(),
            Ok(AnyValue::String(text)) => text.to_string(),
            Ok(value) => value.to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn features(baseline: bool, change: bool) -> FeatureSet {
        FeatureSet {
            covariates: vec!["chron_age".into(), "sex".into()],
            baseline_bag: baseline,
            change_bag: change,
            extension: "finetuned".into(),
        }
    }

    #[test]
    fn feature_sets_name_their_columns() {
        let all = features(true, true);
        assert_eq!(
            all.columns(),
            vec!["chron_age", "sex", "bl_BAG_finetuned", "ch_BAG_finetuned"]
        );
        assert_eq!(all.describe(), "demographics + baseline BAG + change in BAG");
        assert_eq!(features(false, false).describe(), "demographics");
        assert_eq!(features(true, false).table_variable(), "bl_BAG_finetuned");
        assert_eq!(
            default_data_file(Path::new("frames"), "EDIS", &all, "future_ch_ef"),
            PathBuf::from("frames/EDIS_ch_BAG_finetuned_VS_future_ch_ef.csv")
        );
    }

    #[test]
    fn loads_selected_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.csv");
        fs::write(
            &path,
            ",chron_age,sex,bl_BAG_finetuned,score\n\
             s1,70.0,0,1.5,0.2\n\
             s2,65.5,1,-2.0,0.4\n\
             s3,80.0,1,0.0,-0.1\n",
        )
        .unwrap();

        let data = load_cohort(&path, &features(true, false), "score").unwrap();
        assert_eq!(data.ids, vec!["s1", "s2", "s3"]);
        assert_eq!(data.x.dim(), (3, 3));
        assert_eq!(data.x[[1, 0]], 65.5);
        assert_eq!(data.x[[1, 2]], -2.0);
        assert_eq!(data.y.to_vec(), vec![0.2, 0.4, -0.1]);
    }

    #[test]
    fn missing_and_null_columns_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.csv");
        fs::write(&path, "id,chron_age,sex,score\na,70,,1\nb,71,1,2\n").unwrap();

        let err = load_cohort(&path, &features(true, false), "score").unwrap_err();
        assert!(matches!(err, DataError::ColumnNotFound(ref c) if c == "bl_BAG_finetuned"));

        let err = load_cohort(&path, &features(false, false), "score").unwrap_err();
        assert!(matches!(err, DataError::MissingValuesFound(ref c) if c == "sex"));
    }

    #[test]
    fn text_columns_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.csv");
        fs::write(&path, "id,chron_age,sex,score\na,70,F,1\nb,71,M,2\n").unwrap();
        let err = load_cohort(&path, &features(false, false), "score").unwrap_err();
        assert!(matches!(err, DataError::ColumnWrongType { .. }));
    }
}
