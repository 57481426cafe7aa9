//! Extraction and thresholding of 2D slices for map display.

use crate::shared::stats::{self, StatsError};
use ndarray::{Array2, Array3, Axis, s};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SliceError {
    #[error("Slice '{0}' is not supported; expected an axis code x, y or z followed by an index, e.g. z68.")]
    UnsupportedSlice(String),
    #[error("Slice {spec} is outside the volume ({size} voxels along that axis).")]
    OutOfBounds { spec: SliceSpec, size: usize },
    #[error("Cannot pad a slice of height {height} down to {target}.")]
    NegativePadding { height: usize, target: usize },
    #[error("Map has shape {map:?}, but the template has shape {template:?}.")]
    ShapeMismatch {
        map: (usize, usize, usize),
        template: (usize, usize, usize),
    },
    #[error("Map has shape {map:?}, but the mask has shape {mask:?}.")]
    MaskShapeMismatch {
        map: (usize, usize, usize),
        mask: (usize, usize, usize),
    },
    #[error("Percentile thresholds require a brain mask.")]
    MaskRequired,
    #[error("Lower threshold {lower} exceeds upper threshold {upper}.")]
    InvertedThresholds { lower: f64, upper: f64 },
    #[error(transparent)]
    Stats(#[from] StatsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceAxis {
    X,
    Y,
    Z,
}

impl SliceAxis {
    fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }

    fn code(self) -> char {
        match self {
            Self::X => 'x',
            Self::Y => 'y',
            Self::Z => 'z',
        }
    }
}

/// An axis and a voxel index along it, written `z68` or `z:68`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    pub axis: SliceAxis,
    pub index: usize,
}

impl fmt::Display for SliceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.axis.code(), self.index)
    }
}

impl FromStr for SliceSpec {
    type Err = SliceError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let unsupported = || SliceError::UnsupportedSlice(text.to_string());
        let mut chars = text.trim().chars();
        let axis = match chars.next().map(|c| c.to_ascii_lowercase()) {
            Some('x') => SliceAxis::X,
            Some('y') => SliceAxis::Y,
            Some('z') => SliceAxis::Z,
            _ => return Err(unsupported()),
        };
        let rest = chars.as_str();
        let digits = rest.strip_prefix(':').unwrap_or(rest);
        let index = digits.parse::<usize>().map_err(|_| unsupported())?;
        Ok(Self { axis, index })
    }
}

/// How the display window is chosen.
#[derive(Debug, Clone)]
pub enum Thresholds {
    Absolute { lower: f64, upper: f64 },
    /// Percentiles of the map values inside the mask.
    Percentile {
        lower: f64,
        upper: f64,
        mask: Option<Array3<bool>>,
    },
}

/// Resolves the display window to absolute map values.
pub fn resolve_thresholds(
    map: &Array3<f64>,
    thresholds: &Thresholds,
) -> Result<(f64, f64), SliceError> {
    let (lower, upper) = match thresholds {
        Thresholds::Absolute { lower, upper } => (*lower, *upper),
        Thresholds::Percentile { lower, upper, mask } => {
            let mask = mask.as_ref().ok_or(SliceError::MaskRequired)?;
            if mask.dim() != map.dim() {
                return Err(SliceError::MaskShapeMismatch {
                    map: map.dim(),
                    mask: mask.dim(),
                });
            }
            let inside: Vec<f64> = map
                .iter()
                .zip(mask.iter())
                .filter(|&(_, &m)| m)
                .map(|(&v, _)| v)
                .collect();
            (
                stats::percentile(&inside, *lower)?,
                stats::percentile(&inside, *upper)?,
            )
        }
    };
    if lower > upper {
        return Err(SliceError::InvertedThresholds { lower, upper });
    }
    Ok((lower, upper))
}

/// A template slice with its thresholded overlay. Overlay NaN is transparent.
#[derive(Debug, Clone)]
pub struct PreparedSlice {
    pub spec: SliceSpec,
    pub template: Array2<f64>,
    pub overlay: Array2<f64>,
    pub lower: f64,
    pub upper: f64,
}

/// Cuts the slice out of both volumes and applies the display window.
/// Sagittal and coronal slices are resized to the axial frame.
pub fn prepare_slice(
    map: &Array3<f64>,
    template: &Array3<f64>,
    spec: SliceSpec,
    lower: f64,
    upper: f64,
) -> Result<PreparedSlice, SliceError> {
    if map.dim() != template.dim() {
        return Err(SliceError::ShapeMismatch {
            map: map.dim(),
            template: template.dim(),
        });
    }
    let size = map.len_of(Axis(spec.axis.index()));
    if spec.index >= size {
        return Err(SliceError::OutOfBounds { spec, size });
    }

    let cut = |volume: &Array3<f64>| volume.index_axis(Axis(spec.axis.index()), spec.index).to_owned();
    let mut overlay = cut(map).mapv(|v| {
        if v < lower {
            f64::NAN
        } else if v > upper {
            upper
        } else {
            v
        }
    });
    let mut background = cut(template);

    if spec.axis != SliceAxis::Z {
        let (width, height) = overlay.dim();
        overlay = reshape_slice(&overlay, height, width)?;
        background = reshape_slice(&background, height, width)?;
    }

    Ok(PreparedSlice {
        spec,
        template: background,
        overlay,
        lower,
        upper,
    })
}

/// Nearest-neighbour zoom by `new_width / width`, then symmetric zero padding
/// of the second axis up to `new_height` (extra row at the end).
pub fn reshape_slice(
    slice: &Array2<f64>,
    new_width: usize,
    new_height: usize,
) -> Result<Array2<f64>, SliceError> {
    let (width, height) = slice.dim();
    let factor = new_width as f64 / width as f64;
    let zoomed = zoom_nearest(slice, factor);

    let zoomed_height = zoomed.ncols();
    if zoomed_height > new_height {
        return Err(SliceError::NegativePadding {
            height: zoomed_height,
            target: new_height,
        });
    }
    let pad = new_height - zoomed_height;
    let before = pad / 2;
    let mut padded = Array2::zeros((zoomed.nrows(), new_height));
    padded
        .slice_mut(s![.., before..before + zoomed_height])
        .assign(&zoomed);
    Ok(padded)
}

/// Output sizes are `round(n * factor)`; output index `o` samples input
/// index `round(o * (n - 1) / (m - 1))`.
fn zoom_nearest(slice: &Array2<f64>, factor: f64) -> Array2<f64> {
    let (rows, cols) = slice.dim();
    let out_rows = ((rows as f64 * factor).round() as usize).max(1);
    let out_cols = ((cols as f64 * factor).round() as usize).max(1);
    let source_index = |out: usize, out_len: usize, in_len: usize| {
        if out_len <= 1 {
            0
        } else {
            let scale = (in_len - 1) as f64 / (out_len - 1) as f64;
            ((out as f64 * scale).round() as usize).min(in_len - 1)
        }
    };
    Array2::from_shape_fn((out_rows, out_cols), |(r, c)| {
        slice[[
            source_index(r, out_rows, rows),
            source_index(c, out_cols, cols),
        ]]
    })
}
