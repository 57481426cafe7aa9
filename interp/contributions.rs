//! # Feature Contribution Aggregation
//!
//! Reduces a voxel-wise statistical map to a handful of named anatomical
//! contribution scores:
//!
//! 1. The map is thresholded at a percentile computed inside the brain mask,
//!    keeping only its strongest voxels.
//! 2. Each atlas is summarized in a single pass into per-label sums and
//!    counts.
//! 3. Every feature (one region, or a union of regions matched by name
//!    fragment) combines the statistics of its labels into a mean.
//! 4. The features of all atlases are ranked and normalized to relative
//!    contributions.

use super::atlas::{Atlas, AtlasError, AtlasSource, LabelTable};
use crate::shared::stats::{self, StatsError};
use crate::shared::tables::{self, TableError};
use crate::shared::volume::{self, Volume, VolumeError};
use ndarray::{Array3, Zip};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContributionError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Atlas(#[from] AtlasError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("{what} has shape {found:?}, but the map has shape {expected:?}.")]
    ShapeMismatch {
        what: String,
        found: [usize; 3],
        expected: [usize; 3],
    },
    #[error("The brain mask selects no voxels.")]
    EmptyMask,
    #[error(
        "Feature contributions sum to {0}; relative contributions cannot be computed. Try a lower percentile threshold."
    )]
    DegenerateTotal(f64),
}

/// A feature is either one region, matched by exact name, or a union of
/// regions, each matched by name fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureSpec {
    SingleRegion(String),
    RegionUnion(Vec<String>),
}

impl FeatureSpec {
    /// Display name. Unions of several regions abbreviate each region to its
    /// first three characters: `["Putamen", "Caudate"]` becomes `Put+Cau`.
    pub fn name(&self) -> String {
        match self {
            Self::SingleRegion(name) => name.clone(),
            Self::RegionUnion(regions) if regions.len() > 1 => regions
                .iter()
                .map(|r| r.chars().take(3).collect::<String>())
                .collect::<Vec<_>>()
                .join("+"),
            Self::RegionUnion(regions) => regions.join("+"),
        }
    }

    /// Label numbers belonging to this feature.
    pub fn label_numbers(&self, table: &LabelTable) -> Vec<i64> {
        match self {
            Self::SingleRegion(name) => table.numbers_named(name),
            Self::RegionUnion(regions) => {
                let mut numbers: Vec<i64> = regions
                    .iter()
                    .flat_map(|r| table.numbers_containing(r))
                    .collect();
                numbers.sort_unstable();
                numbers.dedup();
                numbers
            }
        }
    }
}

impl fmt::Display for FeatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Mean map value over one feature's voxels.
#[derive(Debug, Clone)]
pub struct FeatureContribution {
    pub feature: String,
    pub contribution: f64,
    pub is_white_matter: bool,
    /// Voxels carrying one of the feature's labels.
    pub voxel_count: usize,
}

/// A map after percentile thresholding.
#[derive(Debug, Clone)]
pub struct ThresholdedMap {
    pub values: Array3<f64>,
    pub threshold: f64,
    /// Mask voxels at or above the threshold.
    pub retained_in_mask: usize,
}

/// Zeroes every map value below the `percentile` of the finite map values
/// inside `mask`.
pub fn threshold_map(
    map: &Array3<f64>,
    mask: &Array3<bool>,
    percentile: f64,
) -> Result<ThresholdedMap, ContributionError> {
    check_shape("Brain mask", mask.dim(), map.dim())?;

    let in_mask: Vec<f64> = Zip::from(map)
        .and(mask)
        .fold(Vec::new(), |mut acc, &v, &inside| {
            if inside {
                acc.push(v);
            }
            acc
        });
    if in_mask.is_empty() {
        return Err(ContributionError::EmptyMask);
    }

    let threshold = stats::percentile(&in_mask, percentile)?;
    let values = map.mapv(|v| if v < threshold { 0.0 } else { v });
    let retained_in_mask = in_mask.iter().filter(|&&v| v >= threshold).count();
    log::info!(
        "Percentile {percentile} threshold = {threshold:.6}; {retained_in_mask} of {} mask voxels retained",
        in_mask.len()
    );

    Ok(ThresholdedMap {
        values,
        threshold,
        retained_in_mask,
    })
}

fn check_shape(
    what: &str,
    found: (usize, usize, usize),
    expected: (usize, usize, usize),
) -> Result<(), ContributionError> {
    if found != expected {
        return Err(ContributionError::ShapeMismatch {
            what: what.to_string(),
            found: [found.0, found.1, found.2],
            expected: [expected.0, expected.1, expected.2],
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct LabelStats {
    sum: f64,
    finite: usize,
    voxels: usize,
}

impl LabelStats {
    fn merge(&mut self, other: LabelStats) {
        self.sum += other.sum;
        self.finite += other.finite;
        self.voxels += other.voxels;
    }
}

fn accumulate_label_stats(map: &Array3<f64>, labels: &Array3<i64>) -> HashMap<i64, LabelStats> {
    Zip::from(labels).and(map).par_fold(
        HashMap::new,
        |mut acc: HashMap<i64, LabelStats>, &label, &value| {
            let entry = acc.entry(label).or_default();
            entry.voxels += 1;
            if !value.is_nan() {
                entry.sum += value;
                entry.finite += 1;
            }
            acc
        },
        |mut left, right| {
            for (label, stats) in right {
                left.entry(label).or_default().merge(stats);
            }
            left
        },
    )
}

/// Mean map value of every feature over the atlas. Features with no
/// non-NaN voxels get NaN.
pub fn aggregate(
    map: &Array3<f64>,
    atlas: &Atlas,
    features: &[FeatureSpec],
) -> Result<Vec<FeatureContribution>, ContributionError> {
    check_shape(&format!("Atlas '{}'", atlas.name), atlas.labels.dim(), map.dim())?;
    let per_label = accumulate_label_stats(map, &atlas.labels);

    Ok(features
        .iter()
        .map(|feature| {
            let mut combined = LabelStats::default();
            for number in feature.label_numbers(&atlas.table) {
                if let Some(stats) = per_label.get(&number) {
                    combined.merge(*stats);
                }
            }
            let contribution = if combined.finite == 0 {
                f64::NAN
            } else {
                combined.sum / combined.finite as f64
            };
            if combined.voxels == 0 {
                log::warn!(
                    "Feature '{}' matches no voxels in atlas '{}'",
                    feature,
                    atlas.name
                );
            }
            FeatureContribution {
                feature: feature.name(),
                contribution,
                is_white_matter: atlas.is_white_matter,
                voxel_count: combined.voxels,
            }
        })
        .collect())
}

/// One row of the final report.
#[derive(Debug, Clone, Serialize)]
pub struct RankedContribution {
    pub feature: String,
    pub contribution: f64,
    pub relative: f64,
    pub tissue: &'static str,
    pub voxels: usize,
}

/// Sorts by descending contribution (NaN last) and divides by the total of
/// the finite contributions.
pub fn rank_and_normalize(
    contributions: Vec<FeatureContribution>,
) -> Result<Vec<RankedContribution>, ContributionError> {
    let total: f64 = contributions
        .iter()
        .map(|c| c.contribution)
        .filter(|v| v.is_finite())
        .sum();
    if total == 0.0 || !total.is_finite() {
        return Err(ContributionError::DegenerateTotal(total));
    }

    let mut sorted = contributions;
    sorted.sort_by(|a, b| match (a.contribution.is_nan(), b.contribution.is_nan()) {
        (false, false) => b.contribution.total_cmp(&a.contribution),
        (nan_a, nan_b) => nan_a.cmp(&nan_b),
    });

    Ok(sorted
        .into_iter()
        .map(|c| RankedContribution {
            relative: c.contribution / total,
            tissue: if c.is_white_matter {
                "white matter"
            } else {
                "gray matter"
            },
            feature: c.feature,
            contribution: c.contribution,
            voxels: c.voxel_count,
        })
        .collect())
}

/// An atlas on disk together with the features to extract from it. `None`
/// features means every distinct region name of the label table.
#[derive(Debug, Clone)]
pub struct AtlasPlan {
    pub source: AtlasSource,
    pub features: Option<Vec<FeatureSpec>>,
}

#[derive(Debug, Clone)]
pub struct ContributionConfig {
    pub map_file: PathBuf,
    pub brain_mask_file: PathBuf,
    pub percentile_threshold: f64,
    pub atlases: Vec<AtlasPlan>,
}

/// Loads the inputs named by `config` and produces the ranked report.
pub fn calculate_feature_contributions(
    config: &ContributionConfig,
) -> Result<Vec<RankedContribution>, ContributionError> {
    let map = volume::load_volume(&config.map_file)?;
    let mask = volume::load_volume(&config.brain_mask_file)?.to_mask();
    let thresholded = threshold_map(&map.data, &mask, config.percentile_threshold)?;

    let reference = Volume::new(thresholded.values, map.affine);
    let mut all = Vec::new();
    for plan in &config.atlases {
        let atlas = plan.source.load(&reference)?;
        let features = plan.features.clone().unwrap_or_else(|| {
            atlas
                .table
                .unique_names()
                .into_iter()
                .map(FeatureSpec::SingleRegion)
                .collect()
        });
        log::info!(
            "Aggregating {} features over atlas '{}'",
            features.len(),
            atlas.name
        );
        all.extend(aggregate(&reference.data, &atlas, &features)?);
    }

    rank_and_normalize(all)
}

pub fn write_report(path: &Path, report: &[RankedContribution]) -> Result<(), ContributionError> {
    tables::write_rows(path, report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::atlas::LabelEntry;
    use approx::assert_abs_diff_eq;

    fn table(entries: &[(i64, &str)]) -> LabelTable {
        LabelTable::new(
            entries
                .iter()
                .map(|&(number, name)| LabelEntry {
                    number,
                    name: name.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn union_names_abbreviate_each_region() {
        let union = FeatureSpec::RegionUnion(vec!["Putamen".into(), "Caudate".into()]);
        assert_eq!(union.name(), "Put+Cau");
        let single_union = FeatureSpec::RegionUnion(vec!["Thal".into()]);
        assert_eq!(single_union.name(), "Thal");
        assert_eq!(FeatureSpec::SingleRegion("Default".into()).name(), "Default");
    }

    #[test]
    fn union_labels_match_fragments_once() {
        let t = table(&[(1, "Putamen_L"), (2, "Putamen_R"), (3, "Caudate_L"), (4, "Pallidum_L")]);
        let union = FeatureSpec::RegionUnion(vec!["Putamen".into(), "Caudate".into(), "Put".into()]);
        assert_eq!(union.label_numbers(&t), vec![1, 2, 3]);
    }

    #[test]
    fn threshold_keeps_top_decile_of_mask() {
        let map = Array3::from_shape_fn((10, 10, 10), |(i, j, k)| (i * 100 + j * 10 + k) as f64);
        let mask = Array3::from_shape_fn((10, 10, 10), |(i, _, _)| i < 5);
        let result = threshold_map(&map, &mask, 90.0).unwrap();

        assert_eq!(result.retained_in_mask, 50);
        let zeroed_in_mask = Zip::from(&result.values)
            .and(&mask)
            .fold(0, |acc, &v, &m| acc + usize::from(m && v == 0.0));
        assert_eq!(zeroed_in_mask, 450);
        // Voxels outside the mask above the threshold survive.
        assert_eq!(result.values[[9, 9, 9]], 999.0);
    }

    #[test]
    fn empty_mask_is_rejected() {
        let map = Array3::zeros((2, 2, 2));
        let mask = Array3::from_elem((2, 2, 2), false);
        assert!(matches!(
            threshold_map(&map, &mask, 90.0),
            Err(ContributionError::EmptyMask)
        ));
    }

    #[test]
    fn aggregate_ignores_nan_and_reports_missing_regions() {
        let map = Array3::from_shape_vec((1, 1, 4), vec![1.0, 3.0, f64::NAN, 10.0]).unwrap();
        let labels = Array3::from_shape_vec((1, 1, 4), vec![1, 1, 1, 2]).unwrap();
        let atlas = Atlas {
            name: "toy".into(),
            labels,
            table: table(&[(1, "A"), (2, "B"), (3, "C")]),
            is_white_matter: true,
        };
        let features = vec![
            FeatureSpec::SingleRegion("A".into()),
            FeatureSpec::SingleRegion("C".into()),
        ];
        let result = aggregate(&map, &atlas, &features).unwrap();
        assert_abs_diff_eq!(result[0].contribution, 2.0);
        assert_eq!(result[0].voxel_count, 3);
        assert!(result[1].contribution.is_nan());
        assert!(result.iter().all(|c| c.is_white_matter));
    }

    #[test]
    fn ranking_sorts_descending_and_normalizes() {
        let make = |feature: &str, contribution: f64| FeatureContribution {
            feature: feature.into(),
            contribution,
            is_white_matter: false,
            voxel_count: 1,
        };
        let ranked = rank_and_normalize(vec![
            make("low", 1.0),
            make("missing", f64::NAN),
            make("high", 3.0),
        ])
        .unwrap();
        let names: Vec<&str> = ranked.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(names, vec!["high", "low", "missing"]);
        let total: f64 = ranked.iter().map(|r| r.relative).filter(|v| v.is_finite()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ranked[0].relative, 0.75);
    }

    #[test]
    fn all_zero_contributions_are_degenerate() {
        let zero = FeatureContribution {
            feature: "z".into(),
            contribution: 0.0,
            is_white_matter: false,
            voxel_count: 4,
        };
        assert!(matches!(
            rank_and_normalize(vec![zero]),
            Err(ContributionError::DegenerateTotal(_))
        ));
    }
}
