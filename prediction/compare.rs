//! # Comparison of Cross-Validated Feature Sets
//!
//! Tests whether adding brain-age-gap features changes the held-out
//! correlation, per outcome, with the corrected resampled t-test (Nadeau and
//! Bengio). Folds of repeated k-fold share training data, so the plain
//! variance of the paired differences is inflated by `1/K + n_test/n_train`,
//! approximated here by `1 / max(fold)`.

use super::crossval::{CvResultRow, ModelKind};
use crate::shared::stats;
use crate::shared::tables::{self, TableError};
use itertools::Itertools;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Feature sets in the order they are compared.
pub const FEATURE_ORDER: [&str; 3] = [
    "demographics",
    "demographics + baseline BAG",
    "demographics + baseline BAG + change in BAG",
];

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("Failed to read CV results from '{path}': {source}")]
    Read { path: String, source: csv::Error },
    #[error("No CV results remain after filtering by extension, model and repeat.")]
    NoRows,
    #[error("Fold indices never exceed 0, so the training/test ratio is undefined.")]
    SingleFold,
    #[error(
        "Outcome '{outcome}': '{a}' and '{b}' have {pairs} paired folds, but at least 2 are required."
    )]
    TooFewPairs {
        outcome: String,
        a: String,
        b: String,
        pairs: usize,
    },
    #[error("Outcome '{outcome}': '{a}' and '{b}' were not evaluated on the same folds.")]
    Unpaired {
        outcome: String,
        a: String,
        b: String,
    },
    #[error("Outcome '{outcome}', features '{features}': fold {fold} of repeat {rep} appears twice.")]
    DuplicateFold {
        outcome: String,
        features: String,
        rep: usize,
        fold: usize,
    },
    #[error("Student's t distribution could not be built: {0}")]
    Distribution(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Multiple-comparison correction applied across every tested pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    #[default]
    BenjaminiHochberg,
    Bonferroni,
    None,
}

impl FromStr for Correction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bh" | "benjamini-hochberg" => Ok(Self::BenjaminiHochberg),
            "bonferroni" => Ok(Self::Bonferroni),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unsupported correction '{s}' (expected BH, bonferroni or none)"
            )),
        }
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BenjaminiHochberg => "BH",
            Self::Bonferroni => "bonferroni",
            Self::None => "none",
        })
    }
}

impl Correction {
    /// Adjusted p-values in input order. NaN entries stay NaN and do not
    /// count towards the number of tests.
    pub fn adjust(self, p_values: &[f64]) -> Vec<f64> {
        let tested: Vec<usize> = (0..p_values.len())
            .filter(|&i| !p_values[i].is_nan())
            .collect();
        let m = tested.len() as f64;
        let mut adjusted = p_values.to_vec();
        match self {
            Self::None => {}
            Self::Bonferroni => {
                for &i in &tested {
                    adjusted[i] = (p_values[i] * m).min(1.0);
                }
            }
            Self::BenjaminiHochberg => {
                let ranked: Vec<usize> = tested
                    .iter()
                    .copied()
                    .sorted_by(|&a, &b| p_values[a].total_cmp(&p_values[b]))
                    .collect();
                let mut running = 1.0f64;
                for (rank, &i) in ranked.iter().enumerate().rev() {
                    running = running.min(p_values[i] * m / (rank + 1) as f64);
                    adjusted[i] = running;
                }
            }
        }
        adjusted
    }
}

/// Significance stars for a p-value.
pub fn star_label(p: f64) -> &'static str {
    match p {
        p if p <= 1e-4 => "****",
        p if p <= 1e-3 => "***",
        p if p <= 1e-2 => "**",
        p if p <= 0.05 => "*",
        _ => "ns",
    }
}

/// Reader-facing name of a known cognitive outcome.
pub fn outcome_display_name(outcome: &str) -> Option<&'static str> {
    Some(match outcome {
        "future_ch_global_cog" => "Global Cognition",
        "future_ch_ef" => "Executive Function",
        "future_ch_vm" => "Verbal Memory",
        "future_ch_vsm" => "Visual Memory",
        "future_ch_attn" => "Attention",
        "future_ch_proc_speed" => "Processing Speed",
        "nepsy_naming" => "Naming",
        "nepsy_inhibition" => "Inhibition",
        "nepsy_switching" => "Switching",
        "wcst_tess" => "WCST",
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TTest {
    pub t: f64,
    pub p: f64,
}

/// Corrected resampled t-test of `b - a`. `portion` is the test/train size
/// ratio; the variance is the population variance of the differences.
pub fn corrected_resampled_ttest(a: &[f64], b: &[f64], portion: f64) -> Result<TTest, CompareError> {
    let differences: Vec<f64> = b.iter().zip(a).map(|(y, x)| y - x).collect();
    let k = differences.len();
    if k < 2 || a.len() != b.len() {
        return Err(CompareError::TooFewPairs {
            outcome: String::new(),
            a: String::new(),
            b: String::new(),
            pairs: k,
        });
    }

    let corrected_variance =
        (1.0 / k as f64 + portion) * stats::population_variance(&differences);
    let t = stats::mean(&differences) / corrected_variance.sqrt();
    let p = if t.is_nan() {
        f64::NAN
    } else if t.is_infinite() {
        0.0
    } else {
        let dist = StudentsT::new(0.0, 1.0, (k - 1) as f64)
            .map_err(|e| CompareError::Distribution(e.to_string()))?;
        2.0 * dist.cdf(-t.abs())
    };
    Ok(TTest { t, p })
}

/// Which stored results take part.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareConfig {
    pub files: Vec<PathBuf>,
    pub ext: String,
    pub model: ModelKind,
    pub n_repeats: usize,
    pub correction: Correction,
}

/// One tested pair of feature sets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub outcome: String,
    pub label: String,
    pub features_a: String,
    pub features_b: String,
    pub pairs: usize,
    pub mean_a: f64,
    pub mean_b: f64,
    pub t: f64,
    pub p: f64,
    pub p_adjusted: f64,
    pub stars: &'static str,
}

/// Reads result files and keeps rows with `rep < n_repeats` and the requested
/// extension and model.
pub fn load_results(config: &CompareConfig) -> Result<Vec<CvResultRow>, CompareError> {
    let mut rows = Vec::new();
    for path in &config.files {
        let read_error = |source| CompareError::Read {
            path: path.display().to_string(),
            source,
        };
        let mut reader = csv::Reader::from_path(path).map_err(read_error)?;
        for record in reader.deserialize::<CvResultRow>() {
            let row = record.map_err(read_error)?;
            if row.rep < config.n_repeats && row.ext == config.ext && row.model == config.model {
                rows.push(row);
            }
        }
    }
    if rows.is_empty() {
        return Err(CompareError::NoRows);
    }
    log::info!("Loaded {} CV results from {} files", rows.len(), config.files.len());
    Ok(rows)
}

type FoldScores = BTreeMap<(usize, usize), f64>;

fn group_scores(rows: &[CvResultRow]) -> Result<BTreeMap<(String, String), FoldScores>, CompareError> {
    let mut groups: BTreeMap<(String, String), FoldScores> = BTreeMap::new();
    for row in rows {
        let scores = groups
            .entry((row.outcome.clone(), row.features.clone()))
            .or_default();
        if scores.insert((row.rep, row.fold), row.corr).is_some() {
            return Err(CompareError::DuplicateFold {
                outcome: row.outcome.clone(),
                features: row.features.clone(),
                rep: row.rep,
                fold: row.fold,
            });
        }
    }
    Ok(groups)
}

/// Adjacent feature sets, plus first against third.
fn feature_pairs(present: &[&'static str]) -> Vec<(&'static str, &'static str)> {
    let mut pairs: Vec<_> = present.iter().copied().tuple_windows().collect();
    if present.len() > 2 {
        pairs.push((present[0], present[2]));
    }
    pairs
}

/// Tests every feature-set pair of every outcome (outcomes sorted) and
/// corrects the p-values jointly.
pub fn compare_feature_sets(
    rows: &[CvResultRow],
    correction: Correction,
) -> Result<Vec<Comparison>, CompareError> {
    let max_fold = rows.iter().map(|r| r.fold).max().ok_or(CompareError::NoRows)?;
    if max_fold == 0 {
        return Err(CompareError::SingleFold);
    }
    let portion = 1.0 / max_fold as f64;
    let groups = group_scores(rows)?;

    let present: Vec<&'static str> = FEATURE_ORDER
        .iter()
        .copied()
        .filter(|features| rows.iter().any(|r| r.features == *features))
        .collect();
    let outcomes: Vec<&String> = rows.iter().map(|r| &r.outcome).unique().sorted().collect();

    let mut comparisons = Vec::new();
    for outcome in outcomes {
        for (a, b) in feature_pairs(&present) {
            let empty = FoldScores::new();
            let scores_a = groups.get(&(outcome.clone(), a.to_string())).unwrap_or(&empty);
            let scores_b = groups.get(&(outcome.clone(), b.to_string())).unwrap_or(&empty);
            if !scores_a.keys().eq(scores_b.keys()) {
                return Err(CompareError::Unpaired {
                    outcome: outcome.clone(),
                    a: a.to_string(),
                    b: b.to_string(),
                });
            }
            let values_a: Vec<f64> = scores_a.values().copied().collect();
            let values_b: Vec<f64> = scores_b.values().copied().collect();
            let test = corrected_resampled_ttest(&values_a, &values_b, portion).map_err(|err| {
                match err {
                    CompareError::TooFewPairs { pairs, .. } => CompareError::TooFewPairs {
                        outcome: outcome.clone(),
                        a: a.to_string(),
                        b: b.to_string(),
                        pairs,
                    },
                    other => other,
                }
            })?;
            comparisons.push(Comparison {
                outcome: outcome.clone(),
                label: outcome_display_name(outcome)
                    .map_or_else(|| outcome.clone(), str::to_string),
                features_a: a.to_string(),
                features_b: b.to_string(),
                pairs: values_a.len(),
                mean_a: stats::mean(&values_a),
                mean_b: stats::mean(&values_b),
                t: test.t,
                p: test.p,
                p_adjusted: test.p,
                stars: "ns",
            });
        }
    }

    let raw: Vec<f64> = comparisons.iter().map(|c| c.p).collect();
    for (comparison, adjusted) in comparisons.iter_mut().zip(correction.adjust(&raw)) {
        comparison.p_adjusted = adjusted;
        comparison.stars = star_label(adjusted);
    }
    log::info!(
        "Tested {} feature-set pairs with {} correction",
        comparisons.len(),
        correction
    );
    Ok(comparisons)
}

pub fn write_comparisons(path: &Path, comparisons: &[Comparison]) -> Result<(), CompareError> {
    tables::write_rows(path, comparisons)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn row(outcome: &str, features: &str, rep: usize, fold: usize, corr: f64) -> CvResultRow {
        CvResultRow {
            fold,
            rep,
            corr,
            model: ModelKind::KernelRidge,
            features: features.into(),
            study: "EDIS".into(),
            outcome: outcome.into(),
            ext: "finetuned".into(),
        }
    }

    #[test]
    fn ttest_matches_hand_computation() {
        let a = [0.1, 0.2, 0.3, 0.4];
        let b = [0.2, 0.4, 0.3, 0.6];
        let test = corrected_resampled_ttest(&a, &b, 1.0 / 3.0).unwrap();
        // d = [0.1, 0.2, 0.0, 0.2], mean 0.125, population variance 0.006875
        let expected_t = 0.125 / ((0.25 + 1.0 / 3.0) * 0.006875f64).sqrt();
        assert_abs_diff_eq!(test.t, expected_t, epsilon = 1e-12);
        assert!(test.p > 0.0 && test.p < 0.2);
    }

    #[test]
    fn ttest_needs_two_pairs() {
        assert!(matches!(
            corrected_resampled_ttest(&[0.1], &[0.2], 0.5),
            Err(CompareError::TooFewPairs { pairs: 1, .. })
        ));
    }

    #[test]
    fn corrections_adjust_p_values() {
        let p = [0.01, 0.04, 0.03, f64::NAN];
        let bonferroni = Correction::Bonferroni.adjust(&p);
        assert_abs_diff_eq!(bonferroni[0], 0.03, epsilon = 1e-12);
        assert_abs_diff_eq!(bonferroni[1], 0.12, epsilon = 1e-12);
        assert!(bonferroni[3].is_nan());

        let bh = Correction::BenjaminiHochberg.adjust(&p);
        assert_abs_diff_eq!(bh[0], 0.03, epsilon = 1e-12);
        assert_abs_diff_eq!(bh[1], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(bh[2], 0.04, epsilon = 1e-12);
        assert_eq!(Correction::None.adjust(&p)[1], 0.04);
        assert_eq!("bh".parse::<Correction>(), Ok(Correction::BenjaminiHochberg));
        assert!("holm".parse::<Correction>().is_err());
    }

    #[test]
    fn stars_follow_thresholds() {
        assert_eq!(star_label(5e-5), "****");
        assert_eq!(star_label(1e-3), "***");
        assert_eq!(star_label(0.004), "**");
        assert_eq!(star_label(0.05), "*");
        assert_eq!(star_label(0.2), "ns");
        assert_eq!(star_label(f64::NAN), "ns");
    }

    #[test]
    fn three_feature_sets_yield_three_pairs_per_outcome() {
        let mut rows = Vec::new();
        for outcome in ["future_ch_vm", "future_ch_ef"] {
            for (offset, features) in FEATURE_ORDER.iter().enumerate() {
                for fold in 0..5 {
                    let corr = 0.1 * offset as f64 + 0.01 * fold as f64 * (offset + 1) as f64;
                    rows.push(row(outcome, features, 0, fold, corr));
                }
            }
        }
        let comparisons = compare_feature_sets(&rows, Correction::BenjaminiHochberg).unwrap();
        assert_eq!(comparisons.len(), 6);
        assert_eq!(comparisons[0].outcome, "future_ch_ef");
        assert_eq!(comparisons[0].label, "Executive Function");
        assert_eq!(comparisons[0].features_a, FEATURE_ORDER[0]);
        assert_eq!(comparisons[0].features_b, FEATURE_ORDER[1]);
        assert_eq!(comparisons[2].features_a, FEATURE_ORDER[0]);
        assert_eq!(comparisons[2].features_b, FEATURE_ORDER[2]);
        assert!(comparisons.iter().all(|c| c.pairs == 5 && c.mean_b > c.mean_a));
    }

    #[test]
    fn unpaired_folds_are_rejected() {
        let rows = vec![
            row("score", FEATURE_ORDER[0], 0, 0, 0.1),
            row("score", FEATURE_ORDER[0], 0, 1, 0.2),
            row("score", FEATURE_ORDER[1], 0, 0, 0.3),
            row("score", FEATURE_ORDER[1], 0, 2, 0.4),
        ];
        assert!(matches!(
            compare_feature_sets(&rows, Correction::None),
            Err(CompareError::Unpaired { .. })
        ));
    }

    #[test]
    fn results_are_filtered_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.csv");
        let mut rows = vec![
            row("score", FEATURE_ORDER[0], 0, 0, 0.1),
            row("score", FEATURE_ORDER[0], 1, 0, 0.2),
        ];
        let mut other = row("score", FEATURE_ORDER[0], 0, 1, 0.3);
        other.model = ModelKind::LinearRegression;
        rows.push(other);
        tables::write_rows(&path, &rows).unwrap();

        let config = CompareConfig {
            files: vec![path],
            ext: "finetuned".into(),
            model: ModelKind::KernelRidge,
            n_repeats: 1,
            correction: Correction::default(),
        };
        let loaded = load_results(&config).unwrap();
        assert_eq!(loaded, vec![rows[0].clone()]);
    }

    #[test]
    fn repeat_count_keeps_leading_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cv.csv");
        let rows: Vec<CvResultRow> = (0..3)
            .map(|rep| row("score", FEATURE_ORDER[0], rep, 0, 0.1 * (rep + 1) as f64))
            .collect();
        tables::write_rows(&path, &rows).unwrap();

        let config = CompareConfig {
            files: vec![path],
            ext: "finetuned".into(),
            model: ModelKind::KernelRidge,
            n_repeats: 2,
            correction: Correction::default(),
        };
        let reps: Vec<usize> = load_results(&config).unwrap().iter().map(|r| r.rep).collect();
        assert_eq!(reps, vec![0, 1]);
    }
}
