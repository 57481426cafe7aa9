//! Interpretation of voxel maps: feature contributions over parcellations and
//! slice display.

pub mod atlas;
pub mod contributions;
pub mod manifest;
pub mod render;
pub mod slices;
