//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Visual features (undistorted keypoints and descriptors, immutable)
//! - Pose estimate (SE3 transform)
//! - Graph relationships (covisibility, spanning tree)
//!
//! The covisibility graph connects KeyFrames that share MapPoint observations,
//! while the spanning tree gives every KeyFrame except the root a parent, which
//! relocalization and culling use as a fallback neighbourhood.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;

use crate::features::{Descriptor, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::tracking::frame::{CameraModel, FeatureGrid};
use crate::tracking::Frame;
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

/// Minimum shared MapPoints for a covisibility edge to count as a connection.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Id of the Frame this KeyFrame was promoted from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    pub camera: CameraModel,
    pub pyramid: ScalePyramid,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,

    /// One descriptor per keypoint.
    pub descriptors: Vec<Descriptor>,

    grid: FeatureGrid,

    /// Bag-of-Words representation used for place recognition.
    pub bow_vector: Option<BowVector>,

    /// Feature indices grouped by vocabulary node for accelerated matching.
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    /// None for the root KeyFrame.
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: BTreeSet<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    /// Protects the KeyFrame from culling while relocalization uses it.
    pub not_erase: bool,
    pub is_bad: bool,
}

impl KeyFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: KeyFrameId,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        camera: CameraModel,
        pyramid: ScalePyramid,
    ) -> Self {
        let num_features = keypoints.len();
        let grid = FeatureGrid::new(&keypoints, camera.width as f64, camera.height as f64);
        Self {
            id,
            frame_id,
            timestamp,
            pose,
            camera,
            pyramid,
            keypoints,
            descriptors,
            grid,
            bow_vector: None,
            feature_vector: None,
            map_point_ids: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: BTreeSet::new(),
            not_erase: false,
            is_bad: false,
        }
    }

    /// Promote a tracked Frame. MapPoint slots start empty; the Map fills
    /// them through `associate`.
    pub fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        let mut kf = Self::new(
            id,
            frame.id,
            frame.timestamp,
            frame.pose.unwrap_or_default(),
            frame.keypoints.clone(),
            frame.descriptors.clone(),
            frame.camera,
            frame.pyramid.clone(),
        );
        kf.bow_vector = frame.bow_vector.clone();
        kf.feature_vector = frame.feature_vector.clone();
        kf
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if feature_idx >= self.map_point_ids.len() {
            return None;
        }
        self.map_point_ids[feature_idx].replace(mp_id)
    }

    /// Remove the association for a feature.
    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        if feature_idx >= self.map_point_ids.len() {
            return None;
        }
        self.map_point_ids[feature_idx].take()
    }

    /// All associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Set the covisibility weight with another KeyFrame. A weight of zero
    /// removes the edge.
    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        if weight == 0 {
            self.covisibility_weights.remove(&kf_id);
        } else {
            self.covisibility_weights.insert(kf_id, weight);
        }
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// Raw shared-point counts with every KeyFrame sharing at least one point.
    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    pub(crate) fn replace_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
    }

    /// Connected KeyFrames, best first.
    ///
    /// Edges with at least [`COVISIBILITY_THRESHOLD`] shared points count as
    /// connections. When there are none, the single best neighbour is kept.
    pub fn ordered_connections(&self) -> Vec<(KeyFrameId, usize)> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let above = ordered
            .iter()
            .take_while(|(_, w)| *w >= COVISIBILITY_THRESHOLD)
            .count();
        ordered.truncate(above.max(1));
        ordered
    }

    /// The N best connected KeyFrames (most shared points first).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_connections()
            .into_iter()
            .take(n)
            .map(|(id, _)| id)
            .collect()
    }

    /// Connected KeyFrames with at least `min_weight` shared points.
    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_connections()
            .into_iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────────

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Feature indices within `radius` of `(u, v)` on levels `min_level..=max_level`.
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

    /// Median depth of the given world points in this camera.
    pub fn median_depth(&self, points: impl Iterator<Item = Vector3<f64>>) -> Option<f64> {
        let pose_cw = self.pose_cw();
        let mut depths: Vec<f64> = points.map(|p| pose_cw.transform_point(&p).z).collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / 2])
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent_id", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_camera;

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let keypoints = (0..num_features)
            .map(|i| KeyPoint::new(10.0 + i as f32 * 3.0, 20.0, 0))
            .collect();
        KeyFrame::new(
            KeyFrameId::new(id),
            id,
            id as f64,
            SE3::identity(),
            keypoints,
            vec![Descriptor::zeros(); num_features],
            test_camera(),
            ScalePyramid::new(1.2, 8),
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);
        assert_eq!(kf.set_map_point(99, MapPointId::new(1)), None);
    }

    #[test]
    fn test_connections_apply_threshold() {
        let mut kf = create_keyframe_with_features(1, 0);
        kf.set_covisibility(KeyFrameId::new(2), 50);
        kf.set_covisibility(KeyFrameId::new(3), 100);
        kf.set_covisibility(KeyFrameId::new(4), 10);

        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(4)), 10);
        assert_eq!(
            kf.get_best_covisibles(5),
            vec![KeyFrameId::new(3), KeyFrameId::new(2)]
        );
        assert_eq!(kf.get_covisibles_above_weight(60), vec![KeyFrameId::new(3)]);

        // Only weak edges: the best one is still a connection.
        let mut weak = create_keyframe_with_features(5, 0);
        weak.set_covisibility(KeyFrameId::new(6), 3);
        weak.set_covisibility(KeyFrameId::new(7), 8);
        assert_eq!(weak.get_best_covisibles(5), vec![KeyFrameId::new(7)]);

        weak.set_covisibility(KeyFrameId::new(7), 0);
        assert_eq!(weak.get_best_covisibles(5), vec![KeyFrameId::new(6)]);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_keyframe_with_features(1, 0);
        kf.set_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);
        assert!(kf.get_best_covisibles(3).is_empty());
    }

    #[test]
    fn test_features_in_area() {
        let kf = create_keyframe_with_features(1, 10);
        // Keypoints at x = 10, 13, 16, ... on y = 20.
        let mut idx = kf.get_features_in_area(13.0, 20.0, 3.5, None, None);
        idx.sort();
        assert_eq!(idx, vec![0, 1, 2]);
    }
}
