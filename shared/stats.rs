//! # Shared Statistical Primitives
//!
//! Small numerical helpers used by both workflows: percentiles with linear
//! interpolation, Pearson correlation, and quantile binning of a continuous
//! outcome into strata.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Percentile must lie in [0, 100], but was {0}.")]
    PercentileOutOfRange(f64),
    #[error("Cannot compute a percentile of an empty set of values.")]
    EmptyInput,
    #[error("Non-finite value found at position {0}; quantile binning requires finite data.")]
    NonFiniteValue(usize),
    #[error(
        "Outcome cannot be binned: only {distinct_edges} distinct quantile edge(s) were found among {num_values} values."
    )]
    DegenerateBins {
        distinct_edges: usize,
        num_values: usize,
    },
    #[error("Number of quantile bins must be at least 1.")]
    ZeroBins,
}

/// Linear-interpolated percentile of `values`, ignoring non-finite entries.
pub fn percentile(values: &[f64], q: f64) -> Result<f64, StatsError> {
    if !(0.0..=100.0).contains(&q) {
        return Err(StatsError::PercentileOutOfRange(q));
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    sorted.sort_by(f64::total_cmp);
    Ok(interpolate_sorted(&sorted, q / 100.0))
}

/// Quantile of already sorted, finite data at fraction `p` in [0, 1].
fn interpolate_sorted(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Pearson correlation coefficient. Returns NaN when either input has zero
/// variance or the inputs are shorter than two elements.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return f64::NAN;
    }
    let mean_a = mean(a);
    let mean_b = mean(b);
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        return f64::NAN;
    }
    (cov / denom).clamp(-1.0, 1.0)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by `n`).
pub fn population_variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Discretizes `values` into at most `num_bins` quantile bins.
///
/// Edges are linear-interpolated quantiles at `0, 1/num_bins, ..., 1`.
/// Duplicate edges are dropped, so tied data yields fewer bins. Intervals are
/// right-closed and the lowest edge belongs to the first bin. Returns the bin
/// index of every value.
pub fn quantile_bins(values: &[f64], num_bins: usize) -> Result<Vec<usize>, StatsError> {
    if num_bins == 0 {
        return Err(StatsError::ZeroBins);
    }
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(StatsError::NonFiniteValue(idx));
    }
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut edges: Vec<f64> = (0..=num_bins)
        .map(|i| interpolate_sorted(&sorted, i as f64 / num_bins as f64))
        .collect();
    edges.dedup();

    if edges.len() < 2 {
        return Err(StatsError::DegenerateBins {
            distinct_edges: edges.len(),
            num_values: values.len(),
        });
    }

    let last_bin = edges.len() - 2;
    Ok(values
        .iter()
        .map(|&v| {
            // First edge >= v closes the interval containing v.
            let closing = edges[1..].partition_point(|&edge| edge < v);
            closing.min(last_bin)
        })
        .collect())
}
