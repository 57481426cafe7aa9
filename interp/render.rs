//! PNG rendering of prepared slices: grayscale template with a colored map
//! overlay, drawn in radiological orientation.

use super::slices::{self, PreparedSlice, SliceError, SliceSpec, Thresholds};
use crate::shared::volume::{self, VolumeError};
use image::{ImageError, Rgba, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Colormap '{0}' is not supported; choose inferno, hot or gray.")]
    UnsupportedColormap(String),
    #[error("Failed to write image: {0}")]
    Image(#[from] ImageError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Slice(#[from] SliceError),
    #[error("Failed to create output directory '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    Inferno,
    Hot,
    Gray,
}

impl FromStr for Colormap {
    type Err = RenderError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "inferno" => Ok(Self::Inferno),
            "hot" => Ok(Self::Hot),
            "gray" | "grey" => Ok(Self::Gray),
            _ => Err(RenderError::UnsupportedColormap(name.to_string())),
        }
    }
}

/// Control points of the inferno map at 0, 1/4, 1/2, 3/4 and 1.
const INFERNO: [[f64; 3]; 5] = [
    [0.0, 0.0, 4.0],
    [87.0, 16.0, 110.0],
    [188.0, 55.0, 84.0],
    [249.0, 142.0, 9.0],
    [252.0, 255.0, 164.0],
];

impl Colormap {
    /// RGB color for `t` in [0, 1].
    pub fn color(self, t: f64) -> [u8; 3] {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Gray => {
                let v = (t * 255.0).round() as u8;
                [v, v, v]
            }
            Self::Hot => {
                let channel = |start: f64| (((t - start) * 3.0).clamp(0.0, 1.0) * 255.0).round() as u8;
                [channel(0.0), channel(1.0 / 3.0), channel(2.0 / 3.0)]
            }
            Self::Inferno => {
                let position = t * (INFERNO.len() - 1) as f64;
                let lower = (position.floor() as usize).min(INFERNO.len() - 2);
                let frac = position - lower as f64;
                let mut rgb = [0u8; 3];
                for (c, out) in rgb.iter_mut().enumerate() {
                    let a = INFERNO[lower][c];
                    let b = INFERNO[lower + 1][c];
                    *out = (a + (b - a) * frac).round() as u8;
                }
                rgb
            }
        }
    }
}

fn finite_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

/// Draws the slice transposed with the origin at the bottom and the first
/// axis inverted. Pixels with neither template signal nor overlay are
/// transparent.
pub fn render_slice(slice: &PreparedSlice, colormap: Colormap) -> RgbaImage {
    let (width, height) = slice.overlay.dim();
    let (t_min, t_max) = finite_range(slice.template.iter().copied());
    let t_span = if t_max > t_min { t_max - t_min } else { 1.0 };
    let o_span = if slice.upper > slice.lower {
        slice.upper - slice.lower
    } else {
        1.0
    };

    RgbaImage::from_fn(width as u32, height as u32, |px, py| {
        let i = width - 1 - px as usize;
        let j = height - 1 - py as usize;
        let value = slice.overlay[[i, j]];
        if !value.is_nan() {
            let [r, g, b] = colormap.color((value - slice.lower) / o_span);
            return Rgba([r, g, b, 255]);
        }
        let background = slice.template[[i, j]];
        if !background.is_finite() || background == 0.0 {
            return Rgba([0, 0, 0, 0]);
        }
        let v = (((background - t_min) / t_span) * 255.0).round() as u8;
        Rgba([v, v, v, 255])
    })
}

/// A vertical color bar, highest value at the top.
pub fn render_colorbar(colormap: Colormap, width: u32, height: u32) -> RgbaImage {
    let steps = height.saturating_sub(1).max(1) as f64;
    RgbaImage::from_fn(width, height, |_, y| {
        let [r, g, b] = colormap.color(1.0 - y as f64 / steps);
        Rgba([r, g, b, 255])
    })
}

pub fn save_png(image: &RgbaImage, path: &Path) -> Result<(), RenderError> {
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

pub const COLORBAR_WIDTH: u32 = 24;
pub const COLORBAR_HEIGHT: u32 = 256;

/// Inputs of one slice display run.
#[derive(Debug, Clone)]
pub struct SliceConfig {
    pub map_file: PathBuf,
    pub template_file: PathBuf,
    pub out_dir: PathBuf,
    pub slices: Vec<SliceSpec>,
    pub lower: f64,
    pub upper: f64,
    /// Brain mask used when the thresholds are percentiles.
    pub percentile_mask: Option<PathBuf>,
    pub percentile_thresholds: bool,
    pub colormap: Colormap,
    pub colorbar: bool,
}

impl SliceConfig {
    pub fn default_slices() -> Vec<SliceSpec> {
        use super::slices::SliceAxis::{X, Z};
        [(X, 97), (Z, 68), (Z, 89), (Z, 135)]
            .into_iter()
            .map(|(axis, index)| SliceSpec { axis, index })
            .collect()
    }
}

/// File name stem of a map: everything before the first `.`.
fn map_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

/// Renders every requested slice and returns the written PNG paths.
pub fn display_map_slices(config: &SliceConfig) -> Result<Vec<PathBuf>, RenderError> {
    let map = volume::load_volume(&config.map_file)?;
    let template = volume::load_volume(&config.template_file)?;
    fs::create_dir_all(&config.out_dir).map_err(|source| RenderError::Io {
        path: config.out_dir.display().to_string(),
        source,
    })?;

    let thresholds = if config.percentile_thresholds {
        let mask = match &config.percentile_mask {
            Some(path) => Some(volume::load_volume(path)?.to_mask()),
            None => None,
        };
        Thresholds::Percentile {
            lower: config.lower,
            upper: config.upper,
            mask,
        }
    } else {
        Thresholds::Absolute {
            lower: config.lower,
            upper: config.upper,
        }
    };
    let (lower, upper) = slices::resolve_thresholds(&map.data, &thresholds)?;
    log::info!("Display window for '{}': [{lower:.4}, {upper:.4}]", config.map_file.display());

    let stem = map_stem(&config.map_file);
    let mut written = Vec::with_capacity(config.slices.len());
    for &spec in &config.slices {
        let prepared = slices::prepare_slice(&map.data, &template.data, spec, lower, upper)?;
        let out_file = config.out_dir.join(format!("{stem}_{spec}.png"));
        save_png(&render_slice(&prepared, config.colormap), &out_file)?;
        written.push(out_file);

        if config.colorbar {
            let bar_file = config.out_dir.join(format!("{stem}_{spec}_colorbar.png"));
            save_png(
                &render_colorbar(config.colormap, COLORBAR_WIDTH, COLORBAR_HEIGHT),
                &bar_file,
            )?;
            written.push(bar_file);
        }
    }
    Ok(written)
}
