//! Feature extraction: FAST keypoints on a scale pyramid with binary descriptors.

pub mod brief;
pub mod extractor;
pub mod fast;
pub mod keypoint;
pub mod pyramid;
pub mod quadtree;

pub use extractor::{
    ExtractedFeatures, ExtractorConfig, ExtractorType, FeatureExtractor, KeypointExtractor,
    EDGE_THRESHOLD,
};
pub use keypoint::{Descriptor, KeyPoint, DESCRIPTOR_BYTES};
pub use pyramid::ScalePyramid;
