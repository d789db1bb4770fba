//! Session configuration, loaded from YAML.
//!
//! Every section has defaults matching the usual ORB-SLAM monocular settings,
//! so a config file only needs the fields it changes:
//!
//! ```yaml
//! camera: { fx: 458.654, fy: 457.296, cx: 367.215, cy: 248.375, width: 752, height: 480 }
//! extractor: { type: FAST-ORBS-2000 }
//! vocabulary_path: vocab/ORBvoc.txt
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::features::ExtractorConfig;
use crate::tracking::frame::CameraModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub camera: CameraModel,
    pub extractor: ExtractorConfig,
    pub tracking: TrackingConfig,
    pub local_mapping: LocalMappingConfig,
    pub relocalization: RelocalizationConfig,
    /// DBoW2 text vocabulary. Not needed when the session is built with an
    /// in-memory vocabulary.
    pub vocabulary_path: Option<PathBuf>,
    /// Vocabulary levels above the leaves used to group features for BoW matching.
    pub bow_levels_up: usize,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            camera: CameraModel::default(),
            extractor: ExtractorConfig::default(),
            tracking: TrackingConfig::default(),
            local_mapping: LocalMappingConfig::default(),
            relocalization: RelocalizationConfig::default(),
            vocabulary_path: None,
            bow_levels_up: DEFAULT_BOW_LEVELS_UP,
        }
    }
}

impl SlamConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SlamConfig = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tracker cannot run with. The camera is checked
    /// separately since a sequence may supply its own calibration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bow_levels_up == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bow_levels_up",
                reason: "must be at least 1".into(),
            });
        }
        if self.tracking.lost_after_failures == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracking.lost_after_failures",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Build a default config around a calibration.
    pub fn with_camera(camera: CameraModel) -> Self {
        Self {
            camera,
            ..Self::default()
        }
    }
}

const DEFAULT_BOW_LEVELS_UP: usize = 4;

/// Thresholds of the tracking state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Fewer keypoints than this make the frame untrackable.
    pub min_features: usize,
    /// Reference frames for initialization need more than this many keypoints.
    pub init_min_features: usize,
    /// Matches required between the two initialization frames.
    pub init_min_matches: usize,
    /// Triangulated points required to accept a two-view reconstruction.
    pub init_min_triangulated: usize,
    pub init_min_parallax_deg: f64,
    pub init_ransac_iterations: usize,
    /// Search window (pixels) for initialization matching.
    pub init_search_window: f64,
    /// Seed of the initialization RANSAC sampler.
    pub init_seed: u64,
    /// Inliers needed after tracking the local map.
    pub min_inliers: usize,
    /// Inliers needed in the frames right after a relocalization.
    pub min_inliers_after_reloc: usize,
    /// Base search radius (pixels) for frame-to-frame projection matching.
    pub projection_radius: f64,
    pub kf_min_frames: u64,
    pub kf_max_frames: u64,
    /// A keyframe is needed once tracked points fall below this fraction of
    /// the reference keyframe's points.
    pub kf_tracked_ratio: f64,
    /// Consecutive failed frames before an initialized tracker reports Lost.
    /// The frames in between keep the motion model prediction as their pose
    /// and track no points. 1 loses tracking on the first failure.
    pub lost_after_failures: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_features: 50,
            init_min_features: 100,
            init_min_matches: 100,
            init_min_triangulated: 50,
            init_min_parallax_deg: 1.0,
            init_ransac_iterations: 200,
            init_search_window: 100.0,
            init_seed: 0,
            min_inliers: 30,
            min_inliers_after_reloc: 50,
            projection_radius: 15.0,
            kf_min_frames: 0,
            kf_max_frames: 30,
            kf_tracked_ratio: 0.9,
            lost_after_failures: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingConfig {
    pub ba_max_iterations: usize,
    /// Covisible keyframes searched for triangulation partners.
    pub triangulation_neighbors: usize,
    /// Covisible keyframes fused with the new keyframe.
    pub fusion_neighbors: usize,
    /// Map points with a lower found/visible ratio are culled.
    pub min_found_ratio: f64,
    /// Fraction of redundant points that makes a keyframe redundant.
    pub kf_redundancy_ratio: f64,
    /// Other observers needed for a point to count as redundant.
    pub redundant_observers: usize,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            ba_max_iterations: 10,
            triangulation_neighbors: 20,
            fusion_neighbors: 20,
            min_found_ratio: 0.25,
            kf_redundancy_ratio: 0.9,
            redundant_observers: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocalizationConfig {
    /// BoW matches needed before a candidate is tried with PnP.
    pub min_bow_matches: usize,
    /// Inliers needed to accept a relocalized pose.
    pub min_inliers: usize,
    pub ransac_iterations: usize,
    pub ransac_seed: u64,
}

impl Default for RelocalizationConfig {
    fn default() -> Self {
        Self {
            min_bow_matches: 15,
            min_inliers: 50,
            ransac_iterations: 300,
            ransac_seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::ExtractorType;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
camera:
  fx: 300.0
  fy: 300.0
  cx: 160.0
  cy: 120.0
  width: 320
  height: 240
extractor:
  type: FAST-BRIEF-2000
tracking:
  min_inliers: 40
"#;
        let config = SlamConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.camera.fx, 300.0);
        assert_eq!(config.camera.k1, 0.0);
        assert_eq!(
            config.extractor.extractor_type,
            ExtractorType::FastBrief { n_features: 2000 }
        );
        assert_eq!(config.extractor.num_levels, 8);
        assert_eq!(config.tracking.min_inliers, 40);
        assert_eq!(config.tracking.min_features, 50);
        assert_eq!(config.relocalization.min_inliers, 50);
        assert_eq!(config.bow_levels_up, 4);
        assert!(config.vocabulary_path.is_none());
    }

    #[test]
    fn test_zero_bow_levels_up_is_rejected() {
        let err = SlamConfig::from_yaml_str("bow_levels_up: 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field: "bow_levels_up", .. }
        ));
        assert_eq!(SlamConfig::from_yaml_str("bow_levels_up: 2").unwrap().bow_levels_up, 2);
        assert_eq!(SlamConfig::from_yaml_str("{}").unwrap().bow_levels_up, 4);
        assert!(SlamConfig::from_yaml_str("tracking: { lost_after_failures: 0 }").is_err());
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(matches!(
            SlamConfig::from_yaml_str("camera: [1, 2"),
            Err(ConfigError::Yaml(_))
        ));
        assert!(matches!(
            SlamConfig::from_yaml_file("/nonexistent/slam.yaml"),
            Err(ConfigError::Io(_))
        ));
    }
}
