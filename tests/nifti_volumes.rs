use approx::assert_abs_diff_eq;
use brainage::interp::atlas::{AtlasSource, Delimiter, LabelFormat};
use brainage::interp::contributions::{
    AtlasPlan, ContributionConfig, FeatureSpec, calculate_feature_contributions,
};
use brainage::interp::render::{Colormap, RenderError, SliceConfig, display_map_slices};
use brainage::interp::slices::{SliceError, SliceSpec};
use brainage::shared::volume::{VolumeError, load_volume};
use ndarray::{Array2, Array3, array};
use std::fs;
use std::path::Path;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;
const FLOAT64: i16 = 64;

/// Where a fixture's voxel-to-world transform is stored.
enum Orientation {
    Sform([[f32; 4]; 3]),
    /// Identity rotation with voxel sizes, offsets and qfac.
    Qform {
        voxel_size: [f32; 3],
        offset: [f32; 3],
        qfac: f32,
    },
}

fn put_i16(buf: &mut [u8], at: usize, value: i16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_f32(buf: &mut [u8], at: usize, value: f32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Writes a single-file little-endian NIfTI-1 image of 64-bit floats.
/// `values` are in file order, first axis fastest.
fn write_nifti(path: &Path, dims: &[usize], values: &[f64], orientation: &Orientation) {
    assert_eq!(dims.iter().product::<usize>(), values.len());
    let mut bytes = vec![0u8; DATA_OFFSET];
    bytes[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    put_i16(&mut bytes, 40, dims.len() as i16);
    for slot in 1..8 {
        let extent = dims.get(slot - 1).copied().unwrap_or(1);
        put_i16(&mut bytes, 40 + 2 * slot, extent as i16);
    }
    put_i16(&mut bytes, 70, FLOAT64);
    put_i16(&mut bytes, 72, 64);
    for slot in 0..8 {
        put_f32(&mut bytes, 76 + 4 * slot, 1.0);
    }
    put_f32(&mut bytes, 108, DATA_OFFSET as f32);
    put_f32(&mut bytes, 112, 1.0);
    put_f32(&mut bytes, 116, 0.0);

    match orientation {
        Orientation::Sform(rows) => {
            put_i16(&mut bytes, 254, 1);
            for (r, row) in rows.iter().enumerate() {
                for (c, &value) in row.iter().enumerate() {
                    put_f32(&mut bytes, 280 + 16 * r + 4 * c, value);
                }
            }
        }
        Orientation::Qform {
            voxel_size,
            offset,
            qfac,
        } => {
            put_i16(&mut bytes, 252, 1);
            put_f32(&mut bytes, 76, *qfac);
            for axis in 0..3 {
                put_f32(&mut bytes, 80 + 4 * axis, voxel_size[axis]);
                put_f32(&mut bytes, 268 + 4 * axis, offset[axis]);
            }
        }
    }
    bytes[344..348].copy_from_slice(b"n+1\0");

    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    fs::write(path, bytes).expect("write NIfTI fixture");
}

/// Saves a 3D volume in NIfTI voxel order.
fn write_volume(path: &Path, data: &Array3<f64>, orientation: &Orientation) {
    let (nx, ny, nz) = data.dim();
    let values: Vec<f64> = data.t().iter().copied().collect();
    write_nifti(path, &[nx, ny, nz], &values, orientation);
}

fn scaled(size: f32) -> Orientation {
    Orientation::Sform([
        [size, 0.0, 0.0, 0.0],
        [0.0, size, 0.0, 0.0],
        [0.0, 0.0, size, 0.0],
    ])
}

#[test]
fn voxel_layout_and_sform_survive_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.nii");
    let expected = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (100 * i + 10 * j + k) as f64);
    let sform = Orientation::Sform([
        [2.0, 0.0, 0.0, -3.0],
        [0.0, 2.5, 0.0, -4.0],
        [0.0, 0.0, 3.0, -5.0],
    ]);
    write_volume(&path, &expected, &sform);

    let volume = load_volume(&path).expect("load volume");
    assert_eq!(volume.shape(), [3, 4, 5]);
    assert_eq!(volume.data[[2, 0, 0]], 200.0);
    assert_eq!(volume.data[[0, 3, 0]], 30.0);
    assert_eq!(volume.data[[0, 0, 4]], 4.0);
    assert_eq!(volume.data, expected);
    assert_eq!(
        volume.affine,
        array![
            [2.0, 0.0, 0.0, -3.0],
            [0.0, 2.5, 0.0, -4.0],
            [0.0, 0.0, 3.0, -5.0],
            [0.0, 0.0, 0.0, 1.0]
        ]
    );
}

#[test]
fn qform_supplies_the_affine_without_sform() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qform.nii");
    let qform = Orientation::Qform {
        voxel_size: [1.5, 2.0, 2.5],
        offset: [10.0, 20.0, 30.0],
        qfac: -1.0,
    };
    write_volume(&path, &Array3::zeros((2, 2, 2)), &qform);

    let affine = load_volume(&path).expect("load volume").affine;
    let expected: Array2<f64> = array![
        [1.5, 0.0, 0.0, 10.0],
        [0.0, 2.0, 0.0, 20.0],
        [0.0, 0.0, -2.5, 30.0],
        [0.0, 0.0, 0.0, 1.0]
    ];
    for (found, wanted) in affine.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*found, *wanted, epsilon = 1e-12);
    }
}

#[test]
fn trailing_dimensions_must_be_singletons() {
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f64> = (0..8).map(f64::from).collect();

    let single = dir.path().join("single_frame.nii");
    write_nifti(&single, &[2, 2, 2, 1], &values, &scaled(1.0));
    assert_eq!(load_volume(&single).expect("load volume").shape(), [2, 2, 2]);

    let series = dir.path().join("series.nii");
    write_nifti(&series, &[2, 2, 1, 2], &values, &scaled(1.0));
    match load_volume(&series) {
        Err(VolumeError::NotThreeDimensional { dims, .. }) => assert_eq!(dims, vec![2, 2, 1, 2]),
        other => panic!("expected a dimensionality error, got {other:?}"),
    }
}

/// A 6 mm cube whose values grow along x: 1 at x = 0 up to 6 at x = 5.
fn write_gradient_map(path: &Path) {
    let map = Array3::from_shape_fn((6, 6, 6), |(x, _, _)| (x + 1) as f64);
    write_volume(path, &map, &scaled(1.0));
}

#[test]
fn contributions_from_files_with_resampled_atlas() {
    let dir = tempfile::tempdir().unwrap();
    let at = |name: &str| dir.path().join(name);

    write_gradient_map(&at("map.nii"));
    write_volume(&at("mask.nii"), &Array3::ones((6, 6, 6)), &scaled(1.0));

    let hemispheres = Array3::from_shape_fn((6, 6, 6), |(x, _, _)| if x < 3 { 1.0 } else { 2.0 });
    write_volume(&at("cortical.nii"), &hemispheres, &scaled(1.0));
    fs::write(at("cortical.txt"), "1\tLeft\n2\tRight\n").unwrap();

    // 2 mm grid: map voxel x samples atlas voxel round(x / 2), so x = 5
    // falls outside the three atlas planes along x.
    let nuclei = Array3::from_shape_fn((3, 4, 4), |(i, _, _)| (7 + i) as f64);
    write_volume(&at("subcortical.nii"), &nuclei, &scaled(2.0));
    fs::write(at("subcortical.txt"), "7 Thal_L\n8 Putamen_L\n9 Caudate_L\n").unwrap();

    let config = ContributionConfig {
        map_file: at("map.nii"),
        brain_mask_file: at("mask.nii"),
        percentile_threshold: 0.0,
        atlases: vec![
            AtlasPlan {
                source: AtlasSource {
                    name: "cortical".to_string(),
                    volume: at("cortical.nii"),
                    labels: at("cortical.txt"),
                    format: LabelFormat::default(),
                    resample: false,
                    is_white_matter: false,
                },
                features: None,
            },
            AtlasPlan {
                source: AtlasSource {
                    name: "subcortical".to_string(),
                    volume: at("subcortical.nii"),
                    labels: at("subcortical.txt"),
                    format: LabelFormat {
                        delimiter: Delimiter::Space,
                        ..LabelFormat::default()
                    },
                    resample: true,
                    is_white_matter: false,
                },
                features: Some(vec![
                    FeatureSpec::RegionUnion(vec!["Putamen".to_string(), "Caudate".to_string()]),
                    FeatureSpec::RegionUnion(vec!["Thal".to_string()]),
                ]),
            },
        ],
    };

    let report = calculate_feature_contributions(&config).expect("contributions");
    let features: Vec<&str> = report.iter().map(|r| r.feature.as_str()).collect();
    assert_eq!(features, vec!["Right", "Put+Cau", "Left", "Thal"]);

    // Right covers x = 3..5, Put+Cau x = 1..4, Left x = 0..2, Thal x = 0.
    let contributions: Vec<f64> = report.iter().map(|r| r.contribution).collect();
    for (found, wanted) in contributions.iter().zip([5.0, 3.5, 2.0, 1.0]) {
        assert_abs_diff_eq!(*found, wanted, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(report[0].relative, 5.0 / 11.5, epsilon = 1e-12);
    assert_eq!(report[1].voxels, 4 * 36);
    assert_eq!(report[3].voxels, 36);
}

fn slice_config(dir: &Path) -> SliceConfig {
    SliceConfig {
        map_file: dir.join("map.nii"),
        template_file: dir.join("template.nii"),
        out_dir: dir.join("slices"),
        slices: vec![
            "z2".parse::<SliceSpec>().unwrap(),
            "x:1".parse::<SliceSpec>().unwrap(),
        ],
        lower: 2.0,
        upper: 5.0,
        percentile_mask: None,
        percentile_thresholds: false,
        colormap: Colormap::Hot,
        colorbar: true,
    }
}

#[test]
fn slices_are_rendered_from_files() {
    let dir = tempfile::tempdir().unwrap();
    write_gradient_map(&dir.path().join("map.nii"));
    write_volume(
        &dir.path().join("template.nii"),
        &Array3::from_elem((6, 6, 6), 100.0),
        &scaled(1.0),
    );

    let written = display_map_slices(&slice_config(dir.path())).expect("render slices");
    let names: Vec<String> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "map_z2.png",
            "map_z2_colorbar.png",
            "map_x1.png",
            "map_x1_colorbar.png"
        ]
    );
    assert_eq!(image::image_dimensions(&written[0]).unwrap(), (6, 6));
    assert_eq!(image::image_dimensions(&written[2]).unwrap(), (6, 6));
}

#[test]
fn percentile_slices_reject_mask_on_another_grid() {
    let dir = tempfile::tempdir().unwrap();
    write_gradient_map(&dir.path().join("map.nii"));
    write_volume(
        &dir.path().join("template.nii"),
        &Array3::ones((6, 6, 6)),
        &scaled(1.0),
    );
    let mask = dir.path().join("mask.nii");
    write_volume(&mask, &Array3::ones((3, 3, 3)), &scaled(2.0));

    let config = SliceConfig {
        lower: 90.0,
        upper: 99.0,
        percentile_mask: Some(mask),
        percentile_thresholds: true,
        ..slice_config(dir.path())
    };
    assert!(matches!(
        display_map_slices(&config),
        Err(RenderError::Slice(SliceError::MaskShapeMismatch { .. }))
    ));
}
