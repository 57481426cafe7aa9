//! TOML description of the atlases used for contribution analysis.
//!
//! ```toml
//! [[atlas]]
//! name = "subcortical"
//! volume = "AAL3v1_1mm.nii"
//! labels = "AAL3v1_1mm.nii.txt"
//! resample = true
//! features = [["Hippocampus", "Amygdala"], ["Putamen", "Caudate"], ["Thal"]]
//!
//! [atlas.format]
//! delimiter = "space"
//!
//! [[atlas]]
//! name = "white matter"
//! volume = "WM_48_ROIs_1mm.nii.gz"
//! labels = "WM_labels.xlsx"
//! white_matter = true
//!
//! [atlas.format]
//! sheet = "ROI_48"
//! skip_rows = 1
//! has_header = true
//! name_column = "Abbreviation"
//! number_token = { index = 0 }
//! ```

use super::atlas::{AtlasSource, Column, Delimiter, LabelFormat, Token};
use super::contributions::{AtlasPlan, FeatureSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML manifest: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Manifest declares no atlases.")]
    NoAtlases,
    #[error("Atlas '{0}' lists an empty region union.")]
    EmptyUnion(String),
}

/// One feature as written in the manifest: a string selects one region by
/// exact name, an array selects a union of regions by name fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureEntry {
    Single(String),
    Union(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasEntry {
    pub name: String,
    pub volume: PathBuf,
    pub labels: PathBuf,
    #[serde(default)]
    pub format: LabelFormat,
    #[serde(default)]
    pub resample: bool,
    #[serde(default)]
    pub white_matter: bool,
    #[serde(default)]
    pub features: Option<Vec<FeatureEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "atlas")]
    pub atlases: Vec<AtlasEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut manifest: Manifest = toml::from_str(&text)?;
        if let Some(base) = path.parent() {
            manifest.rebase(base);
        }
        Ok(manifest)
    }

    /// Prefixes relative atlas paths with `base`.
    fn rebase(&mut self, base: &Path) {
        for atlas in &mut self.atlases {
            if atlas.volume.is_relative() {
                atlas.volume = base.join(&atlas.volume);
            }
            if atlas.labels.is_relative() {
                atlas.labels = base.join(&atlas.labels);
            }
        }
    }

    /// The study's three parcellations as distributed in one directory:
    /// Schaefer cortical networks, AAL3 subcortical nuclei (resampled to the
    /// map grid), and the 48 white matter tracts.
    pub fn study_default(parcellations: &Path) -> Self {
        let at = |file: &str| parcellations.join(file);
        let token = |index| {
            Some(Token {
                separator: "_".to_string(),
                index,
            })
        };
        let union = |regions: &[&str]| {
            FeatureEntry::Union(regions.iter().map(|r| r.to_string()).collect())
        };

        Manifest {
            atlases: vec![
                AtlasEntry {
                    name: "cortical".to_string(),
                    volume: at("Schaefer2018_400Parcels_7Networks_order_FSLMNI152_1mm.nii.gz"),
                    labels: at("Schaefer2018_400Parcels_7Networks_order.txt"),
                    format: LabelFormat {
                        name_token: token(2),
                        ..LabelFormat::default()
                    },
                    resample: false,
                    white_matter: false,
                    features: None,
                },
                AtlasEntry {
                    name: "subcortical".to_string(),
                    volume: at("AAL3v1_1mm.nii"),
                    labels: at("AAL3v1_1mm.nii.txt"),
                    format: LabelFormat {
                        delimiter: Delimiter::Space,
                        ..LabelFormat::default()
                    },
                    resample: true,
                    white_matter: false,
                    features: Some(vec![
                        union(&["Hippocampus", "Amygdala"]),
                        union(&["Putamen", "Caudate"]),
                        union(&["Thal"]),
                    ]),
                },
                AtlasEntry {
                    name: "white matter".to_string(),
                    volume: at("WM_48_ROIs_1mm.nii.gz"),
                    labels: at("WM_labels.xlsx"),
                    format: LabelFormat {
                        sheet: Some("ROI_48".to_string()),
                        skip_rows: 1,
                        has_header: true,
                        number_column: Column::Index(0),
                        name_column: Column::Name("Abbreviation".to_string()),
                        number_token: token(0),
                        ..LabelFormat::default()
                    },
                    resample: false,
                    white_matter: true,
                    features: None,
                },
            ],
        }
    }

    /// Converts the manifest into loadable atlas plans.
    pub fn into_plans(self) -> Result<Vec<AtlasPlan>, ManifestError> {
        if self.atlases.is_empty() {
            return Err(ManifestError::NoAtlases);
        }
        self.atlases
            .into_iter()
            .map(|entry| {
                let features = entry
                    .features
                    .map(|list| {
                        list.into_iter()
                            .map(|feature| match feature {
                                FeatureEntry::Single(name) => Ok(FeatureSpec::SingleRegion(name)),
                                FeatureEntry::Union(regions) if regions.is_empty() => {
                                    Err(ManifestError::EmptyUnion(entry.name.clone()))
                                }
                                FeatureEntry::Union(regions) => {
                                    Ok(FeatureSpec::RegionUnion(regions))
                                }
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;
                Ok(AtlasPlan {
                    source: AtlasSource {
                        name: entry.name,
                        volume: entry.volume,
                        labels: entry.labels,
                        format: entry.format,
                        resample: entry.resample,
                        is_white_matter: entry.white_matter,
                    },
                    features,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_feature_lists_and_rebases_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atlases.toml");
        fs::write(
            &path,
            r#"
[[atlas]]
name = "subcortical"
volume = "aal.nii"
labels = "aal.txt"
resample = true
features = ["Thalamus_L", ["Putamen", "Caudate"]]

[atlas.format]
delimiter = "space"

[[atlas]]
name = "tracts"
volume = "/abs/wm.nii.gz"
labels = "wm.xlsx"
white_matter = true

[atlas.format]
sheet = "ROI_48"
skip_rows = 1
has_header = true
name_column = "Abbreviation"
number_token = { index = 0 }
"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.atlases.len(), 2);
        assert_eq!(manifest.atlases[0].volume, dir.path().join("aal.nii"));
        assert_eq!(manifest.atlases[1].volume, PathBuf::from("/abs/wm.nii.gz"));
        assert_eq!(manifest.atlases[0].format.delimiter, Delimiter::Space);
        assert_eq!(
            manifest.atlases[1].format.name_column,
            Column::Name("Abbreviation".into())
        );
        assert_eq!(manifest.atlases[1].format.sheet.as_deref(), Some("ROI_48"));
        assert_eq!(manifest.atlases[0].format.skip_rows, 0);

        let plans = manifest.into_plans().unwrap();
        assert_eq!(
            plans[0].features,
            Some(vec![
                FeatureSpec::SingleRegion("Thalamus_L".into()),
                FeatureSpec::RegionUnion(vec!["Putamen".into(), "Caudate".into()]),
            ])
        );
        assert!(plans[1].features.is_none());
        assert!(plans[1].source.is_white_matter);
    }

    #[test]
    fn study_default_resamples_only_subcortical_atlas() {
        let manifest = Manifest::study_default(Path::new("/atlases"));
        let resampled: Vec<bool> = manifest.atlases.iter().map(|a| a.resample).collect();
        assert_eq!(resampled, vec![false, true, false]);
        let white_matter = &manifest.atlases[2];
        assert!(white_matter.labels.ends_with("WM_labels.xlsx"));
        assert_eq!(white_matter.format.sheet.as_deref(), Some("ROI_48"));
        assert_eq!(white_matter.format.skip_rows, 1);
        let plans = manifest.into_plans().unwrap();
        let names: Vec<String> = plans[1]
            .features
            .as_ref()
            .unwrap()
            .iter()
            .map(FeatureSpec::name)
            .collect();
        assert_eq!(names, vec!["Hip+Amy", "Put+Cau", "Thal"]);
    }

    #[test]
    fn empty_union_is_rejected() {
        let manifest: Manifest = toml::from_str(
            r#"
[[atlas]]
name = "bad"
volume = "a.nii"
labels = "a.txt"
features = [[]]
"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.into_plans(),
            Err(ManifestError::EmptyUnion(_))
        ));
    }
}
