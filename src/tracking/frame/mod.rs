//! Frame-level building blocks: camera model and keypoint grid.

pub mod camera;
pub mod grid;

pub use camera::CameraModel;
pub use grid::FeatureGrid;
