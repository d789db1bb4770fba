//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: the undistorted features of one
//! image, a provisional pose, a Bag-of-Words vector computed on demand and
//! temporary associations to `MapPoint`s. Frames are not part of the map;
//! the promoted ones are copied into a [`KeyFrame`](crate::atlas::KeyFrame).

use image::GrayImage;
use nalgebra::Vector3;

use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::features::{Descriptor, ExtractedFeatures, FeatureExtractor, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::tracking::frame::{CameraModel, FeatureGrid};
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

/// Where a MapPoint lands in a Frame, as computed by [`Frame::is_in_frustum`].
#[derive(Debug, Clone, Copy)]
pub struct FrustumProjection {
    pub u: f64,
    pub v: f64,
    /// Predicted pyramid level.
    pub level: usize,
    /// Cosine between the viewing ray and the point's mean viewing direction.
    pub view_cos: f64,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Undistorted keypoints, level-0 coordinates.
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Feature index → MapPoint matched by tracking.
    pub map_points: Vec<Option<MapPointId>>,
    /// Set by pose optimization for matches rejected by the χ² test.
    pub outliers: Vec<bool>,

    /// T_wc, once estimated.
    pub pose: Option<SE3>,

    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    grid: FeatureGrid,

    pub bow_vector: Option<BowVector>,
    pub feature_vector: Option<FeatureVector>,

    /// KeyFrame this frame was tracked against.
    pub reference_kf: Option<KeyFrameId>,
}

impl Frame {
    /// Extract features from `image` and undistort them.
    pub fn new(
        id: u64,
        timestamp: f64,
        image: &GrayImage,
        extractor: &FeatureExtractor,
        camera: CameraModel,
    ) -> Self {
        let features = extractor.extract(image);
        Self::from_features(id, timestamp, features, extractor.pyramid().clone(), camera)
    }

    /// Build from already-extracted (distorted) features.
    pub fn from_features(
        id: u64,
        timestamp: f64,
        features: ExtractedFeatures,
        pyramid: ScalePyramid,
        camera: CameraModel,
    ) -> Self {
        let ExtractedFeatures {
            mut keypoints,
            descriptors,
        } = features;
        if camera.has_distortion() {
            for kp in keypoints.iter_mut() {
                let (u, v) = camera.undistort_point(kp.x as f64, kp.y as f64);
                kp.x = u as f32;
                kp.y = v as f32;
            }
        }
        let n = keypoints.len();
        let grid = FeatureGrid::new(&keypoints, camera.width as f64, camera.height as f64);
        Self {
            id,
            timestamp,
            keypoints,
            descriptors,
            map_points: vec![None; n],
            outliers: vec![false; n],
            pose: None,
            camera,
            pyramid,
            grid,
            bow_vector: None,
            feature_vector: None,
            reference_kf: None,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn has_enough_features(&self, min: usize) -> bool {
        self.keypoints.len() >= min
    }

    /// Number of matched, non-outlier MapPoints.
    pub fn num_tracked(&self) -> usize {
        self.map_points
            .iter()
            .zip(&self.outliers)
            .filter(|(mp, out)| mp.is_some() && !**out)
            .count()
    }

    /// Drop every MapPoint association and outlier flag.
    pub fn clear_matches(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    pub fn get_features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        self.grid
            .get_features_in_area(&self.keypoints, u, v, radius, min_level, max_level)
    }

    /// World-to-camera transform, if the pose is known.
    pub fn pose_cw(&self) -> Option<SE3> {
        self.pose.map(|p| p.inverse())
    }

    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose.map(|p| p.translation)
    }

    /// Project `mp` with the current pose and check it is worth searching for.
    ///
    /// Rejects points behind the camera, outside the image, outside the
    /// point's scale-invariance range, or seen at an angle wider than
    /// `acos(viewing_cos_limit)` from its mean viewing direction.
    pub fn is_in_frustum(&self, mp: &MapPoint, viewing_cos_limit: f64) -> Option<FrustumProjection> {
        let pose = self.pose?;
        let p_cam = pose.inverse().transform_point(&mp.position);
        let (u, v) = self.camera.project(&p_cam)?;
        if !self.camera.is_in_image(u, v) {
            return None;
        }

        let po = mp.position - pose.translation;
        let distance = po.norm();
        if !mp.is_in_distance_range(distance) {
            return None;
        }
        let view_cos = po.dot(&mp.normal) / distance;
        if view_cos < viewing_cos_limit {
            return None;
        }

        Some(FrustumProjection {
            u,
            v,
            level: mp.predict_scale(distance, &self.pyramid),
            view_cos,
            distance,
        })
    }

    /// Compute the BoW vectors once.
    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary, levels_up: usize) {
        if self.bow_vector.is_some() {
            return;
        }
        let (bow, feat) = vocabulary.transform(&self.descriptors, levels_up);
        self.bow_vector = Some(bow);
        self.feature_vector = Some(feat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrameId;
    use crate::features::ExtractorConfig;
    use crate::test_support::{blank, test_camera, textured_image, HEIGHT, WIDTH};

    fn point_at(position: Vector3<f64>) -> MapPoint {
        let mut mp = MapPoint::new(MapPointId::new(0), position, Descriptor::zeros(), KeyFrameId::new(0));
        mp.normal = position.normalize();
        mp.min_distance = 0.5;
        mp.max_distance = 10.0;
        mp
    }

    #[test]
    fn test_frame_from_image() {
        let extractor = FeatureExtractor::new(&ExtractorConfig::default());
        let img = textured_image(WIDTH, HEIGHT, 3);
        let frame = Frame::new(0, 0.0, &img, &extractor, test_camera());
        assert!(frame.has_enough_features(100));
        assert_eq!(frame.map_points.len(), frame.num_features());
        assert_eq!(frame.num_tracked(), 0);

        let blank_frame = Frame::new(1, 0.1, &blank(), &extractor, test_camera());
        assert!(!blank_frame.has_enough_features(50));
    }

    #[test]
    fn test_is_in_frustum() {
        let mut frame = Frame::from_features(
            0,
            0.0,
            ExtractedFeatures::default(),
            ScalePyramid::new(1.2, 8),
            test_camera(),
        );
        let mp = point_at(Vector3::new(0.0, 0.0, 2.0));
        assert!(frame.is_in_frustum(&mp, 0.5).is_none(), "no pose yet");

        frame.pose = Some(SE3::identity());
        let proj = frame.is_in_frustum(&mp, 0.5).unwrap();
        assert!((proj.u - 160.0).abs() < 1e-9);
        assert!((proj.v - 120.0).abs() < 1e-9);
        assert!((proj.distance - 2.0).abs() < 1e-9);

        let behind = point_at(Vector3::new(0.0, 0.0, -2.0));
        assert!(frame.is_in_frustum(&behind, 0.5).is_none());

        let far = point_at(Vector3::new(0.0, 0.0, 50.0));
        assert!(frame.is_in_frustum(&far, 0.5).is_none());

        let mut oblique = point_at(Vector3::new(0.0, 0.0, 2.0));
        oblique.normal = Vector3::new(1.0, 0.0, 0.0);
        assert!(frame.is_in_frustum(&oblique, 0.5).is_none());
    }

    #[test]
    fn test_undistortion_applied() {
        let mut camera = test_camera();
        camera.k1 = -0.2;
        let (du, dv) = camera.distort_point(300.0, 200.0);
        let features = ExtractedFeatures {
            keypoints: vec![KeyPoint::new(du as f32, dv as f32, 0)],
            descriptors: vec![Descriptor::zeros()],
        };
        let frame = Frame::from_features(0, 0.0, features, ScalePyramid::new(1.2, 8), camera);
        assert!((frame.keypoints[0].x - 300.0).abs() < 0.05);
        assert!((frame.keypoints[0].y - 200.0).abs() < 0.05);
    }
}
