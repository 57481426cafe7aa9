//! # Volume Loading and Resampling
//!
//! Reads NIfTI images into dense `Array3<f64>` volumes together with their
//! voxel-to-world affine, and resamples label volumes onto another grid with
//! nearest-neighbour lookup.

use ndarray::{Array2, Array3, ShapeBuilder, array};
use ndarray_linalg::Inverse;
use nifti::{NiftiHeader, NiftiObject, NiftiVolume, ReaderOptions};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Failed to read NIfTI file '{path}': {source}")]
    Nifti {
        path: String,
        source: nifti::NiftiError,
    },
    #[error("Image '{path}' has dimensions {dims:?}; a 3D volume was expected.")]
    NotThreeDimensional { path: String, dims: Vec<usize> },
    #[error("Voxel data does not match the declared shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Affine transform is not invertible: {0}")]
    SingularAffine(#[from] ndarray_linalg::error::LinalgError),
}

/// A dense 3D image on a grid described by a 4x4 voxel-to-world affine.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f64>,
    pub affine: Array2<f64>,
}

impl Volume {
    pub fn new(data: Array3<f64>, affine: Array2<f64>) -> Self {
        Self { data, affine }
    }

    pub fn shape(&self) -> [usize; 3] {
        let (nx, ny, nz) = self.data.dim();
        [nx, ny, nz]
    }

    /// Voxels with a value strictly greater than zero.
    pub fn to_mask(&self) -> Array3<bool> {
        self.data.mapv(|v| v > 0.0)
    }

    /// Rounds voxel values to integer labels.
    pub fn to_labels(&self) -> Array3<i64> {
        self.data
            .mapv(|v| if v.is_finite() { v.round() as i64 } else { 0 })
    }
}

/// Loads a `.nii` or `.nii.gz` image. Trailing singleton dimensions beyond the
/// third are dropped; any other dimensionality is rejected.
pub fn load_volume(path: &Path) -> Result<Volume, VolumeError> {
    let nifti_err = |source| VolumeError::Nifti {
        path: path.display().to_string(),
        source,
    };

    log::debug!("Loading volume '{}'", path.display());
    let object = ReaderOptions::new().read_file(path).map_err(nifti_err)?;
    let affine = header_affine(object.header());
    let volume = object.into_volume();
    let dims: Vec<usize> = volume.dim().iter().map(|&d| d as usize).collect();

    if dims.len() < 3 || dims[3..].iter().any(|&d| d != 1) {
        return Err(VolumeError::NotThreeDimensional {
            path: path.display().to_string(),
            dims,
        });
    }

    let (nx, ny, nz) = (dims[0], dims[1], dims[2]);
    let mut values: Vec<f64> = volume.into_nifti_typed_data().map_err(nifti_err)?;
    values.truncate(nx * ny * nz);
    // NIfTI stores the first axis fastest, which is Fortran order.
    let data = Array3::from_shape_vec((nx, ny, nz).f(), values)?;
    Ok(Volume { data, affine })
}

/// Voxel-to-world transform: the sform when set, else the qform, else the
/// voxel sizes alone.
fn header_affine(header: &NiftiHeader) -> Array2<f64> {
    if header.sform_code > 0 {
        let row = |r: [f32; 4]| r.map(f64::from);
        let (x, y, z) = (row(header.srow_x), row(header.srow_y), row(header.srow_z));
        return array![
            [x[0], x[1], x[2], x[3]],
            [y[0], y[1], y[2], y[3]],
            [z[0], z[1], z[2], z[3]],
            [0.0, 0.0, 0.0, 1.0]
        ];
    }

    let pixdim = header.pixdim.map(f64::from);
    if header.qform_code > 0 {
        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (dx, dy, dz) = (pixdim[1], pixdim[2], pixdim[3] * qfac);
        let rotation = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
        ];
        let offsets = [
            f64::from(header.quatern_x),
            f64::from(header.quatern_y),
            f64::from(header.quatern_z),
        ];
        let mut affine = Array2::eye(4);
        for r in 0..3 {
            affine[[r, 0]] = rotation[r][0] * dx;
            affine[[r, 1]] = rotation[r][1] * dy;
            affine[[r, 2]] = rotation[r][2] * dz;
            affine[[r, 3]] = offsets[r];
        }
        return affine;
    }

    let mut affine = Array2::eye(4);
    for axis in 0..3 {
        let size = pixdim[axis + 1];
        affine[[axis, axis]] = if size > 0.0 { size } else { 1.0 };
    }
    affine
}

/// Resamples `source` onto the grid of `shape` and `affine` by nearest
/// neighbour. Target voxels that map outside the source get 0.
pub fn resample_nearest(
    source: &Volume,
    shape: [usize; 3],
    affine: &Array2<f64>,
) -> Result<Volume, VolumeError> {
    if source.shape() == shape && &source.affine == affine {
        return Ok(source.clone());
    }

    // target voxel -> world -> source voxel
    let to_source = source.affine.inv()?.dot(affine);
    let [sx, sy, sz] = source.shape();
    let data = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
        let voxel = [i as f64, j as f64, k as f64, 1.0];
        let mut mapped = [0.0f64; 3];
        for (r, slot) in mapped.iter_mut().enumerate() {
            *slot = (0..4).map(|c| to_source[[r, c]] * voxel[c]).sum::<f64>().round();
        }
        let inside = mapped
            .iter()
            .zip([sx, sy, sz])
            .all(|(&m, n)| m >= 0.0 && m < n as f64);
        if inside {
            source.data[[mapped[0] as usize, mapped[1] as usize, mapped[2] as usize]]
        } else {
            0.0
        }
    });

    Ok(Volume::new(data, affine.clone()))
}
