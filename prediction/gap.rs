//! Brain-age gap derivation from a prediction table (`age`, `prediction`).

use crate::shared::stats;
use crate::shared::tables::{self, TableError};
use polars::prelude::*;
use std::path::Path;
use thiserror::Error;

pub const AGE_COLUMN: &str = "age";
pub const PREDICTION_COLUMN: &str = "prediction";
pub const GAP_COLUMN: &str = "bag";

#[derive(Error, Debug)]
pub enum GapError {
    #[error("Column '{column}' was not found in '{path}'.")]
    ColumnNotFound { column: String, path: String },
    #[error("Column '{0}' contains missing or non-numeric values.")]
    InvalidValues(String),
    #[error("The prediction table contains no rows.")]
    NoRows,
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

/// Agreement between predicted and chronological age.
#[derive(Debug, Clone, PartialEq)]
pub struct GapSummary {
    pub samples: usize,
    pub mean_absolute_error: f64,
    pub correlation: f64,
    pub mean_gap: f64,
}

fn numeric_column(df: &DataFrame, name: &str, path: &Path) -> Result<Vec<f64>, GapError> {
    if !df.get_column_names().iter().any(|c| c.as_str() == name) {
        return Err(GapError::ColumnNotFound {
            column: name.to_string(),
            path: path.display().to_string(),
        });
    }
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    if casted.null_count() > 0 {
        return Err(GapError::InvalidValues(name.to_string()));
    }
    Ok(casted.f64()?.into_no_null_iter().collect())
}

/// Adds `bag = prediction - age` to the table at `input`, writes it to
/// `output` and summarizes the fit.
pub fn derive_gap(input: &Path, output: &Path) -> Result<GapSummary, GapError> {
    let mut df = tables::read_frame(input)?;
    if df.height() == 0 {
        return Err(GapError::NoRows);
    }
    let age = numeric_column(&df, AGE_COLUMN, input)?;
    let prediction = numeric_column(&df, PREDICTION_COLUMN, input)?;

    let gap: Vec<f64> = prediction.iter().zip(&age).map(|(p, a)| p - a).collect();
    let summary = GapSummary {
        samples: gap.len(),
        mean_absolute_error: stats::mean(&gap.iter().map(|g| g.abs()).collect::<Vec<_>>()),
        correlation: stats::pearson(&age, &prediction),
        mean_gap: stats::mean(&gap),
    };

    df.with_column(Series::new(GAP_COLUMN.into(), gap))?;
    tables::write_frame(output, &mut df)?;

    log::info!(
        "{} samples: MAE={:.3}, r(age, prediction)={:.3}, mean BAG={:.3}",
        summary.samples,
        summary.mean_absolute_error,
        summary.correlation,
        summary.mean_gap
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::fs;

    #[test]
    fn gap_is_prediction_minus_age() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("test_pred.csv");
        fs::write(
            &input,
            "id,age,prediction\nsub-01,70.0,72.5\nsub-02,60.0,58.0\nsub-03,80.0,81.0\n",
        )
        .unwrap();
        let output = dir.path().join("out").join("bag.csv");

        let summary = derive_gap(&input, &output).unwrap();
        assert_eq!(summary.samples, 3);
        assert_abs_diff_eq!(summary.mean_absolute_error, 5.5 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean_gap, 0.5 / 3.0, epsilon = 1e-12);
        assert!(summary.correlation > 0.9);

        let written = tables::read_frame(&output).unwrap();
        let bag: Vec<f64> = written
            .column(GAP_COLUMN)
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(bag, vec![2.5, -2.0, 1.0]);
    }

    #[test]
    fn missing_prediction_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("pred.csv");
        fs::write(&input, "id,age\na,1.0\n").unwrap();
        let err = derive_gap(&input, &dir.path().join("o.csv")).unwrap_err();
        assert!(matches!(err, GapError::ColumnNotFound { ref column, .. } if column == "prediction"));
    }
}
