//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! MapPoints are the fundamental 3D structure elements in the map.
//! Each MapPoint tracks which KeyFrames observe it, maintains quality
//! metrics for culling decisions, and stores viewing geometry constraints.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::features::{Descriptor, ScalePyramid};

use super::types::{KeyFrameId, MapPointId};

const SCALE_EPSILON: f64 = 1e-6;

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observation with the least average
    /// distance to all the others.
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: BTreeMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance bounds.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Number of times this point was visible in a frame (in frustum).
    pub visible_count: u32,

    /// Number of times this point was successfully matched/found.
    pub found_count: u32,

    /// KeyFrame that created this MapPoint.
    pub first_kf_id: KeyFrameId,

    /// Reference KeyFrame for scale statistics. Starts as `first_kf_id` and
    /// is reassigned when that keyframe is erased.
    pub ref_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: BTreeMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            first_kf_id,
            ref_kf_id: first_kf_id,
            is_bad: false,
        }
    }

    /// Register an observation. Returns false (and changes nothing) if the
    /// KeyFrame already observes this point.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> bool {
        if self.observations.contains_key(&kf_id) {
            return false;
        }
        self.observations.insert(kf_id, feature_idx);
        true
    }

    /// Remove an observation. The point turns bad when none are left.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        let removed = self.observations.remove(&kf_id).is_some();
        if self.observations.is_empty() {
            self.is_bad = true;
        }
        removed
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    /// found_count / visible_count.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Recompute the mean viewing direction and distance bounds.
    ///
    /// `observer_centers` are the camera centers of all observing KeyFrames.
    /// The bounds come from the reference KeyFrame: `max = dist * scale(level)`
    /// at the level the reference observes the point, `min = max / max_scale`.
    pub fn update_normal_and_depth(
        &mut self,
        observer_centers: impl Iterator<Item = Vector3<f64>>,
        ref_center: &Vector3<f64>,
        ref_level: usize,
        pyramid: &ScalePyramid,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut n = 0;
        for center in observer_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }
        if n > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let dist = (self.position - ref_center).norm();
        self.max_distance = dist * pyramid.scale(ref_level);
        self.min_distance = self.max_distance / pyramid.max_scale();
    }

    /// Pyramid level at which the point should appear from `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> usize {
        if distance <= 0.0 || !self.max_distance.is_finite() {
            return 0;
        }
        let ratio = self.max_distance / distance;
        // Exact level boundaries must not round up to the next level.
        let level = (ratio.ln() / pyramid.log_scale_factor - SCALE_EPSILON).ceil();
        if level < 0.0 {
            0
        } else {
            (level as usize).min(pyramid.num_levels - 1)
        }
    }

    /// Pick the observation descriptor with the least average distance to the others.
    pub fn compute_distinctive_descriptor(&mut self, observed: &[Descriptor]) {
        let mut best_total = u32::MAX;
        let mut best_idx = None;
        for (i, d) in observed.iter().enumerate() {
            // Same count for every candidate, so the sum orders like the mean.
            let total: u32 = observed.iter().map(|other| d.distance(other)).sum();
            if total < best_total {
                best_total = total;
                best_idx = Some(i);
            }
        }
        if let Some(i) = best_idx {
            self.descriptor = observed[i];
        }
    }

    /// Whether a viewing distance is inside the (slightly widened) scale bounds.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .field("ref_kf_id", &self.ref_kf_id)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(0.0, 0.0, 4.0),
            Descriptor::zeros(),
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_add_observation_is_idempotent() {
        let mut mp = create_test_mappoint();

        assert!(mp.add_observation(KeyFrameId::new(1), 5));
        assert!(!mp.add_observation(KeyFrameId::new(1), 5));
        assert!(!mp.add_observation(KeyFrameId::new(1), 9));
        assert_eq!(mp.num_observations(), 1);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));
    }

    #[test]
    fn test_last_erase_marks_bad() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.is_bad);
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert!(mp.erase_observation(KeyFrameId::new(2)));
        assert!(mp.is_bad);
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = create_test_mappoint();
        assert_eq!(mp.found_ratio(), 1.0);

        mp.increase_visible(2);
        assert!((mp.found_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normal_depth_and_scale_prediction() {
        let pyramid = ScalePyramid::new(1.2, 8);
        let mut mp = create_test_mappoint();
        let centers = vec![Vector3::new(-1.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];

        // Reference at the origin looks at the point from level 2.
        mp.update_normal_and_depth(centers.into_iter(), &Vector3::zeros(), 2, &pyramid);
        assert_relative_eq!(mp.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(mp.max_distance, 4.0 * 1.44, epsilon = 1e-12);
        assert_relative_eq!(mp.min_distance, 4.0 * 1.44 / pyramid.max_scale(), epsilon = 1e-12);

        // At the reference distance the point is predicted at the reference level.
        assert_eq!(mp.predict_scale(4.0, &pyramid), 2);
        // Much closer: clamps to the coarsest level.
        assert_eq!(mp.predict_scale(0.01, &pyramid), 7);
        // Farther than max distance: finest level.
        assert_eq!(mp.predict_scale(100.0, &pyramid), 0);
    }

    #[test]
    fn test_scale_prediction_at_level_boundaries() {
        let pyramid = ScalePyramid::new(1.2, 8);
        let mut mp = create_test_mappoint();
        mp.update_normal_and_depth(std::iter::empty::<Vector3<f64>>(), &Vector3::zeros(), 7, &pyramid);
        for level in 0..8 {
            let distance = mp.max_distance / pyramid.scale(level);
            assert_eq!(mp.predict_scale(distance, &pyramid), level);
            // Slightly closer than the boundary belongs to the next level.
            assert_eq!(mp.predict_scale(distance * 0.99, &pyramid), (level + 1).min(7));
        }
    }

    fn prefix_descriptor(bits: usize) -> Descriptor {
        let mut d = Descriptor::zeros();
        for i in 0..bits {
            d.set_bit(i);
        }
        d
    }

    #[test]
    fn test_distinctive_descriptor_minimizes_mean_distance() {
        let mut mp = create_test_mappoint();
        // Distances are differences of bit counts. Mean distances rank the
        // 8-bit descriptor first, median distances would pick the 4-bit one.
        let observed: Vec<Descriptor> = [0, 4, 8, 16, 20].into_iter().map(prefix_descriptor).collect();
        mp.compute_distinctive_descriptor(&observed);
        assert_eq!(mp.descriptor, prefix_descriptor(8));

        let c = prefix_descriptor(40);
        mp.compute_distinctive_descriptor(&[c]);
        assert_eq!(mp.descriptor, c);

        mp.compute_distinctive_descriptor(&[]);
        assert_eq!(mp.descriptor, c);
    }
}
