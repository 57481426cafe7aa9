//! Regression models compared in cross-validation: ordinary least squares
//! with an intercept, and cosine-kernel ridge regression.

use crate::shared::stats;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{LeastSquaresSvd, Solve, error::LinalgError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("Model must be fitted before it can predict.")]
    NotFitted,
    #[error("Design matrix has {rows} rows but the outcome has {targets} values.")]
    LengthMismatch { rows: usize, targets: usize },
    #[error("Model was fitted on {expected} features but received {found}.")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("Cannot fit a model without samples.")]
    NoSamples,
    #[error("Regularization strength must be positive and finite, but was {0}.")]
    InvalidAlpha(f64),
    #[error("Linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),
}

/// A model that can be fitted to a design matrix and predict new rows.
pub trait Regressor {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), RegressionError>;
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, RegressionError>;
}

/// Pearson correlation between the model's predictions for `x` and `y`.
pub fn correlation_score<R: Regressor + ?Sized>(
    model: &R,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> Result<f64, RegressionError> {
    let predicted = model.predict(x)?;
    Ok(stats::pearson(&predicted.to_vec(), &y.to_vec()))
}

fn check_fit_inputs(x: &ArrayView2<f64>, y: &ArrayView1<f64>) -> Result<(), RegressionError> {
    if x.nrows() != y.len() {
        return Err(RegressionError::LengthMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    if x.nrows() == 0 {
        return Err(RegressionError::NoSamples);
    }
    Ok(())
}

/// Ordinary least squares with an intercept, solved on centered data through
/// the SVD so that collinear designs still yield the minimum-norm solution.
#[derive(Debug, Clone, Default)]
pub struct LinearRegression {
    fitted: Option<LinearFit>,
}

#[derive(Debug, Clone)]
struct LinearFit {
    coefficients: Array1<f64>,
    intercept: f64,
}

impl LinearRegression {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Regressor for LinearRegression {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), RegressionError> {
        check_fit_inputs(&x, &y)?;
        let x_mean = x.mean_axis(Axis(0)).ok_or(RegressionError::NoSamples)?;
        let y_mean = y.mean().ok_or(RegressionError::NoSamples)?;
        let x_centered = &x - &x_mean;
        let y_centered = &y - y_mean;

        let solution = x_centered.least_squares(&y_centered)?.solution;
        let intercept = y_mean - x_mean.dot(&solution);
        self.fitted = Some(LinearFit {
            coefficients: solution,
            intercept,
        });
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, RegressionError> {
        let fit = self.fitted.as_ref().ok_or(RegressionError::NotFitted)?;
        if x.ncols() != fit.coefficients.len() {
            return Err(RegressionError::FeatureMismatch {
                expected: fit.coefficients.len(),
                found: x.ncols(),
            });
        }
        Ok(x.dot(&fit.coefficients) + fit.intercept)
    }
}

/// L2-normalizes every row, so that a plain dot product of two prepared rows
/// is their cosine similarity. Zero rows stay zero.
fn normalize_rows(x: ArrayView2<f64>) -> Array2<f64> {
    let mut normalized = x.to_owned();
    for mut row in normalized.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    normalized
}

/// Cosine-kernel ridge regression without intercept. Fitting solves
/// `(K + alpha * I) c = y` for the dual coefficients `c`.
#[derive(Debug, Clone)]
pub struct KernelRidge {
    alpha: f64,
    fitted: Option<KernelFit>,
}

#[derive(Debug, Clone)]
struct KernelFit {
    support: Array2<f64>,
    dual: Array1<f64>,
}

impl KernelRidge {
    pub fn new(alpha: f64) -> Result<Self, RegressionError> {
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(RegressionError::InvalidAlpha(alpha));
        }
        Ok(Self {
            alpha,
            fitted: None,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Regressor for KernelRidge {
    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), RegressionError> {
        check_fit_inputs(&x, &y)?;
        let support = normalize_rows(x);
        let mut gram = support.dot(&support.t());
        for i in 0..gram.nrows() {
            gram[[i, i]] += self.alpha;
        }

        let dual = match gram.solve(&y.to_owned()) {
            Ok(dual) => dual,
            Err(err) => {
                log::warn!(
                    "Kernel system is singular at alpha={} ({err}); using least squares",
                    self.alpha
                );
                gram.least_squares(&y.to_owned())?.solution
            }
        };
        self.fitted = Some(KernelFit { support, dual });
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, RegressionError> {
        let fit = self.fitted.as_ref().ok_or(RegressionError::NotFitted)?;
        if x.ncols() != fit.support.ncols() {
            return Err(RegressionError::FeatureMismatch {
                expected: fit.support.ncols(),
                found: x.ncols(),
            });
        }
        let prepared = normalize_rows(x);
        Ok(prepared.dot(&fit.support.t()).dot(&fit.dual))
    }
}
