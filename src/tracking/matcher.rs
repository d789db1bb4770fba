//! Descriptor matching guided by geometry.
//!
//! Every search restricts candidates spatially (projection window, epipolar
//! line or BoW node) before comparing Hamming distances, then filters with a
//! nearest-neighbour ratio and, where the two views should agree on
//! in-plane rotation, a rotation-consistency histogram.

use std::collections::HashSet;

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::features::{Descriptor, KeyPoint};
use crate::tracking::tracking_frame::{Frame, FrustumProjection};

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold.
pub const TH_LOW: u32 = 50;
pub const HISTO_LENGTH: usize = 30;

/// χ² (1 DOF, 95%) epipolar line threshold.
const CHI2_EPIPOLAR: f64 = 3.84;
/// χ² (2 DOF, 95%) reprojection threshold used for fusion.
const CHI2_FUSE: f64 = 5.99;

/// Histogram of keypoint orientation differences.
///
/// Matches outside the three dominant bins are rejected; the second and
/// third bins only count when they hold at least 10% of the first.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn add(&mut self, kp_a: &KeyPoint, kp_b: &KeyPoint, idx: usize) {
        let mut rot = kp_a.angle - kp_b.angle;
        if rot < 0.0 {
            rot += 360.0;
        }
        let bin = (rot * HISTO_LENGTH as f32 / 360.0).round() as usize % HISTO_LENGTH;
        self.bins[bin].push(idx);
    }

    fn top_three(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by(|a, b| self.bins[*b].len().cmp(&self.bins[*a].len()).then(a.cmp(b)));
        let max = self.bins[order[0]].len();
        let mut keep = vec![order[0]];
        for &bin in &order[1..3] {
            let n = self.bins[bin].len();
            if n == 0 || (n as f64) < 0.1 * max as f64 {
                break;
            }
            keep.push(bin);
        }
        keep
    }

    /// Indices that fell outside the dominant bins.
    fn outliers(&self) -> Vec<usize> {
        let keep = self.top_three();
        (0..HISTO_LENGTH)
            .filter(|b| !keep.contains(b))
            .flat_map(|b| self.bins[b].iter().copied())
            .collect()
    }
}

/// Best and second best distances among a candidate set.
#[derive(Debug, Clone, Copy)]
struct BestTwo {
    best: u32,
    best_idx: Option<usize>,
    best_level: usize,
    second: u32,
    second_level: usize,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best: u32::MAX,
            best_idx: None,
            best_level: 0,
            second: u32::MAX,
            second_level: 0,
        }
    }

    fn push(&mut self, dist: u32, idx: usize, level: usize) {
        if dist < self.best {
            self.second = self.best;
            self.second_level = self.best_level;
            self.best = dist;
            self.best_idx = Some(idx);
            self.best_level = level;
        } else if dist < self.second {
            self.second = dist;
            self.second_level = level;
        }
    }

    fn passes_ratio(&self, ratio: f64) -> bool {
        (self.best as f64) < ratio * self.second as f64
    }
}

pub struct OrbMatcher {
    nn_ratio: f64,
    check_orientation: bool,
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    /// Match the previous frame's tracked points into `current` (constant
    /// velocity tracking). `current.pose` must hold the predicted pose.
    ///
    /// The window is `th` pixels scaled by the previous keypoint's octave,
    /// searched on the neighbouring octaves.
    pub fn search_by_projection_from_last(&self, current: &mut Frame, last: &Frame, map: &Map, th: f64) -> usize {
        let Some(pose_cw) = current.pose_cw() else {
            return 0;
        };
        let mut histogram = RotationHistogram::new();
        let mut matches = 0;

        for (i, mp_id) in last.map_points.iter().enumerate() {
            let Some(mp_id) = *mp_id else {
                continue;
            };
            if last.outliers[i] {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            let Some((u, v)) = current.camera.project(&pose_cw.transform_point(&mp.position)) else {
                continue;
            };
            if !current.camera.is_in_image(u, v) {
                continue;
            }

            let last_octave = last.keypoints[i].octave;
            let radius = th * current.pyramid.scale(last_octave);
            let candidates = current.get_features_in_area(
                u,
                v,
                radius,
                Some(last_octave.saturating_sub(1)),
                Some(last_octave + 1),
            );

            let mut best = BestTwo::new();
            for idx in candidates {
                if current.map_points[idx].is_some() {
                    continue;
                }
                best.push(mp.descriptor.distance(&current.descriptors[idx]), idx, 0);
            }
            if let Some(idx) = best.best_idx.filter(|_| best.best <= TH_HIGH) {
                current.map_points[idx] = Some(mp_id);
                current.outliers[idx] = false;
                matches += 1;
                if self.check_orientation {
                    histogram.add(&last.keypoints[i], &current.keypoints[idx], idx);
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.outliers() {
                current.map_points[idx] = None;
                matches -= 1;
            }
        }
        matches
    }

    /// Match projected local map points into `frame`.
    ///
    /// The window is `th` pixels, widened for points seen at an angle and
    /// scaled by the predicted level.
    pub fn search_by_projection_local(
        &self,
        frame: &mut Frame,
        map: &Map,
        candidates: &[(MapPointId, FrustumProjection)],
        th: f64,
    ) -> usize {
        let mut matches = 0;
        for (mp_id, proj) in candidates {
            let Some(mp) = map.get_map_point(*mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            let r = if proj.view_cos > 0.998 { 2.5 } else { 4.0 };
            let radius = r * th * frame.pyramid.scale(proj.level);
            let indices = frame.get_features_in_area(
                proj.u,
                proj.v,
                radius,
                Some(proj.level.saturating_sub(1)),
                Some(proj.level),
            );

            let mut best = BestTwo::new();
            for idx in indices {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = mp.descriptor.distance(&frame.descriptors[idx]);
                best.push(dist, idx, frame.keypoints[idx].octave);
            }
            let Some(idx) = best.best_idx else {
                continue;
            };
            if best.best > TH_HIGH {
                continue;
            }
            if best.best_level == best.second_level && !best.passes_ratio(self.nn_ratio) {
                continue;
            }
            frame.map_points[idx] = Some(*mp_id);
            frame.outliers[idx] = false;
            matches += 1;
        }
        matches
    }

    /// Match a keyframe's map points to a frame's features through shared
    /// vocabulary nodes.
    ///
    /// Returns the per-feature matches for `frame`; the frame is not modified.
    /// Both sides need their feature vectors computed.
    pub fn search_by_bow(&self, kf: &KeyFrame, frame: &Frame, map: &Map) -> (usize, Vec<Option<MapPointId>>) {
        let mut matches: Vec<Option<MapPointId>> = vec![None; frame.num_features()];
        let (Some(kf_fv), Some(frame_fv)) = (kf.feature_vector.as_ref(), frame.feature_vector.as_ref()) else {
            return (0, matches);
        };
        let mut histogram = RotationHistogram::new();
        let mut count = 0;

        for (node, kf_indices) in kf_fv {
            let Some(frame_indices) = frame_fv.get(node) else {
                continue;
            };
            for &kf_idx in kf_indices {
                let Some(mp_id) = kf.get_map_point(kf_idx) else {
                    continue;
                };
                if map.get_map_point(mp_id).map_or(true, |mp| mp.is_bad) {
                    continue;
                }
                let kf_desc = &kf.descriptors[kf_idx];
                let mut best = BestTwo::new();
                for &f_idx in frame_indices {
                    if matches[f_idx].is_some() {
                        continue;
                    }
                    best.push(kf_desc.distance(&frame.descriptors[f_idx]), f_idx, 0);
                }
                let Some(f_idx) = best.best_idx else {
                    continue;
                };
                if best.best <= TH_LOW && best.passes_ratio(self.nn_ratio) {
                    matches[f_idx] = Some(mp_id);
                    count += 1;
                    if self.check_orientation {
                        histogram.add(&kf.keypoints[kf_idx], &frame.keypoints[f_idx], f_idx);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.outliers() {
                matches[idx] = None;
                count -= 1;
            }
        }
        (count, matches)
    }

    /// Project a keyframe's map points into `frame` (relocalization guided
    /// search). Points in `already_found` are skipped.
    pub fn search_by_projection_keyframe(
        &self,
        frame: &mut Frame,
        kf: &KeyFrame,
        map: &Map,
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
    ) -> usize {
        let (Some(pose_cw), Some(center)) = (frame.pose_cw(), frame.camera_center()) else {
            return 0;
        };
        let mut histogram = RotationHistogram::new();
        let mut matches = 0;

        for (kf_idx, mp_id) in kf.get_map_point_indices() {
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            let Some((u, v)) = frame.camera.project(&pose_cw.transform_point(&mp.position)) else {
                continue;
            };
            if !frame.camera.is_in_image(u, v) {
                continue;
            }
            let distance = (mp.position - center).norm();
            if !mp.is_in_distance_range(distance) {
                continue;
            }
            let level = mp.predict_scale(distance, &frame.pyramid);
            let radius = th * frame.pyramid.scale(level);
            let indices =
                frame.get_features_in_area(u, v, radius, Some(level.saturating_sub(1)), Some(level + 1));

            let mut best = BestTwo::new();
            for idx in indices {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                best.push(mp.descriptor.distance(&frame.descriptors[idx]), idx, 0);
            }
            if let Some(idx) = best.best_idx.filter(|_| best.best <= orb_dist) {
                frame.map_points[idx] = Some(mp_id);
                frame.outliers[idx] = false;
                matches += 1;
                if self.check_orientation {
                    histogram.add(&kf.keypoints[kf_idx], &frame.keypoints[idx], idx);
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.outliers() {
                frame.map_points[idx] = None;
                matches -= 1;
            }
        }
        matches
    }

    /// Match level-0 features of the initialization reference frame.
    ///
    /// `prev_matched` holds, per reference feature, where it was found last
    /// time (initially its own position); it is updated with the new matches.
    /// Returns `matches12[i1] = Some(i2)`.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [Vector2<f64>],
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
        let mut matched_dist: Vec<u32> = vec![u32::MAX; f2.num_features()];
        let mut matches21: Vec<Option<usize>> = vec![None; f2.num_features()];
        let mut count = 0;

        for (i1, kp1) in f1.keypoints.iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let guess = prev_matched[i1];
            let indices = f2.get_features_in_area(guess.x, guess.y, window, Some(0), Some(0));
            let d1 = &f1.descriptors[i1];
            let mut best = BestTwo::new();
            for i2 in indices {
                let dist = d1.distance(&f2.descriptors[i2]);
                if matched_dist[i2] <= dist {
                    continue;
                }
                best.push(dist, i2, 0);
            }
            let Some(i2) = best.best_idx else {
                continue;
            };
            if best.best > TH_LOW || !best.passes_ratio(self.nn_ratio) {
                continue;
            }
            if let Some(prev_i1) = matches21[i2] {
                matches12[prev_i1] = None;
                count -= 1;
            }
            matches12[i1] = Some(i2);
            matches21[i2] = Some(i1);
            matched_dist[i2] = best.best;
            count += 1;
        }

        if self.check_orientation {
            let mut histogram = RotationHistogram::new();
            for (i1, m) in matches12.iter().enumerate() {
                if let Some(i2) = m {
                    histogram.add(&f1.keypoints[i1], &f2.keypoints[*i2], i1);
                }
            }
            for i1 in histogram.outliers() {
                matches12[i1] = None;
                count -= 1;
            }
        }

        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                let kp = &f2.keypoints[*i2];
                prev_matched[i1] = Vector2::new(kp.x as f64, kp.y as f64);
            }
        }
        (count, matches12)
    }

    /// Pairs of unmatched features of two keyframes that satisfy the
    /// epipolar constraint, for triangulating new points.
    ///
    /// `f12` is the fundamental matrix with `x1ᵀ F12 x2 = 0`. Features of
    /// `kf2` too close to the epipole are skipped.
    pub fn search_for_triangulation(&self, kf1: &KeyFrame, kf2: &KeyFrame, f12: &Matrix3<f64>) -> Vec<(usize, usize)> {
        let (Some(fv1), Some(fv2)) = (kf1.feature_vector.as_ref(), kf2.feature_vector.as_ref()) else {
            return Vec::new();
        };

        // Epipole: camera center of kf1 seen from kf2.
        let c2 = kf2.pose_cw().transform_point(&kf1.camera_center());
        let epipole = kf2.camera.project(&c2);

        let mut matched2 = vec![false; kf2.num_features()];
        let mut matches12: Vec<Option<usize>> = vec![None; kf1.num_features()];
        let mut histogram = RotationHistogram::new();

        for (node, indices1) in fv1 {
            let Some(indices2) = fv2.get(node) else {
                continue;
            };
            for &i1 in indices1 {
                if kf1.get_map_point(i1).is_some() {
                    continue;
                }
                let kp1 = &kf1.keypoints[i1];
                let d1 = &kf1.descriptors[i1];
                let mut best_dist = TH_LOW;
                let mut best_i2 = None;
                for &i2 in indices2 {
                    if matched2[i2] || kf2.get_map_point(i2).is_some() {
                        continue;
                    }
                    let dist = d1.distance(&kf2.descriptors[i2]);
                    if dist > TH_LOW || dist > best_dist {
                        continue;
                    }
                    let kp2 = &kf2.keypoints[i2];
                    if let Some((ex, ey)) = epipole {
                        let dx = ex - kp2.x as f64;
                        let dy = ey - kp2.y as f64;
                        if dx * dx + dy * dy < 100.0 * kf2.pyramid.scale(kp2.octave) {
                            continue;
                        }
                    }
                    if check_dist_epipolar_line(kp1, kp2, f12, kf2.pyramid.sigma2(kp2.octave)) {
                        best_dist = dist;
                        best_i2 = Some(i2);
                    }
                }
                if let Some(i2) = best_i2 {
                    matched2[i2] = true;
                    matches12[i1] = Some(i2);
                    if self.check_orientation {
                        histogram.add(kp1, &kf2.keypoints[i2], i1);
                    }
                }
            }
        }

        if self.check_orientation {
            for i1 in histogram.outliers() {
                matches12[i1] = None;
            }
        }
        matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect()
    }
}

/// Squared distance of `kp2` to the epipolar line of `kp1`, against the
/// level's variance.
fn check_dist_epipolar_line(kp1: &KeyPoint, kp2: &KeyPoint, f12: &Matrix3<f64>, sigma2: f64) -> bool {
    let x1 = Vector3::new(kp1.x as f64, kp1.y as f64, 1.0);
    let line = f12.transpose() * x1;
    let den = line.x * line.x + line.y * line.y;
    if den == 0.0 {
        return false;
    }
    let num = line.x * kp2.x as f64 + line.y * kp2.y as f64 + line.z;
    num * num / den < CHI2_EPIPOLAR * sigma2
}

/// Project `mp_ids` into keyframe `kf_id` and merge them with what they land on.
///
/// A match on an empty slot adds an observation; a match on a slot holding
/// another point fuses the two, keeping the one with more observations.
/// Returns the number of fused or added observations.
pub fn fuse(map: &mut Map, kf_id: KeyFrameId, mp_ids: &[MapPointId], th: f64) -> usize {
    let mut fused = 0;
    for &candidate in mp_ids {
        let Some(mp_id) = map.resolve(candidate) else {
            continue;
        };
        let Some(kf) = map.get_keyframe(kf_id) else {
            return fused;
        };
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        if mp.is_observed_by(kf_id) {
            continue;
        }

        let target = find_fusion_target(kf, &mp.position, &mp.normal, &mp.descriptor, th, |d| {
            mp.is_in_distance_range(d).then(|| mp.predict_scale(d, &kf.pyramid))
        });
        let Some(target) = target else {
            continue;
        };
        let occupant = kf.get_map_point(target);
        let own_obs = mp.num_observations();

        match occupant {
            Some(existing) if existing != mp_id => {
                let existing_obs = map.get_map_point(existing).map_or(0, |p| p.num_observations());
                if existing_obs > own_obs {
                    map.replace_map_point(mp_id, existing);
                } else {
                    map.replace_map_point(existing, mp_id);
                }
                fused += 1;
            }
            Some(_) => {}
            None => {
                if map.associate(kf_id, target, mp_id) {
                    fused += 1;
                }
            }
        }
    }
    fused
}

/// Best feature of `kf` for a point at `position`, if any passes the
/// viewing-angle, level, reprojection and descriptor tests.
fn find_fusion_target(
    kf: &KeyFrame,
    position: &Vector3<f64>,
    normal: &Vector3<f64>,
    descriptor: &Descriptor,
    th: f64,
    predict_level: impl Fn(f64) -> Option<usize>,
) -> Option<usize> {
    let p_cam = kf.pose_cw().transform_point(position);
    let (u, v) = kf.camera.project(&p_cam)?;
    if !kf.camera.is_in_image(u, v) {
        return None;
    }
    let po = position - kf.camera_center();
    let distance = po.norm();
    let level = predict_level(distance)?;
    if po.dot(normal) < 0.5 * distance {
        return None;
    }

    let radius = th * kf.pyramid.scale(level);
    let mut best_dist = u32::MAX;
    let mut best_idx = None;
    for idx in kf.get_features_in_area(u, v, radius, None, None) {
        let kp = &kf.keypoints[idx];
        if kp.octave + 1 < level || kp.octave > level {
            continue;
        }
        let ex = u - kp.x as f64;
        let ey = v - kp.y as f64;
        if (ex * ex + ey * ey) * kf.pyramid.inv_sigma2(kp.octave) > CHI2_FUSE {
            continue;
        }
        let dist = descriptor.distance(&kf.descriptors[idx]);
        if dist < best_dist {
            best_dist = dist;
            best_idx = Some(idx);
        }
    }
    best_idx.filter(|_| best_dist <= TH_LOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{ExtractedFeatures, ScalePyramid};
    use crate::geometry::SE3;
    use crate::test_support::test_camera;

    fn descriptor(seed: u64) -> Descriptor {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        let mut d = Descriptor::zeros();
        rng.fill(&mut d.0[..]);
        d
    }

    fn frame_with(keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) -> Frame {
        Frame::from_features(
            0,
            0.0,
            ExtractedFeatures { keypoints, descriptors },
            ScalePyramid::new(1.2, 8),
            test_camera(),
        )
    }

    #[test]
    fn test_rotation_histogram_rejects_inconsistent() {
        let mut h = RotationHistogram::new();
        let a = KeyPoint::new(0.0, 0.0, 0);
        let mut b = KeyPoint::new(0.0, 0.0, 0);
        for i in 0..20 {
            h.add(&a, &b, i);
        }
        b.angle = 180.0;
        h.add(&a, &b, 99);
        assert_eq!(h.outliers(), vec![99]);
    }

    #[test]
    fn test_search_for_initialization_finds_shifted_features() {
        let kps1: Vec<KeyPoint> = (0..7).map(|i| KeyPoint::new(20.0 + 40.0 * i as f32, 100.0, 0)).collect();
        let kps2: Vec<KeyPoint> = kps1.iter().map(|k| KeyPoint::new(k.x + 5.0, k.y + 2.0, 0)).collect();
        let descs: Vec<Descriptor> = (0..7).map(descriptor).collect();
        let f1 = frame_with(kps1.clone(), descs.clone());
        let f2 = frame_with(kps2, descs);

        let mut prev: Vec<Vector2<f64>> = kps1.iter().map(|k| Vector2::new(k.x as f64, k.y as f64)).collect();
        let matcher = OrbMatcher::new(0.9, true);
        let (n, m12) = matcher.search_for_initialization(&f1, &f2, &mut prev, 20.0);
        assert_eq!(n, 7);
        for (i, m) in m12.iter().enumerate() {
            assert_eq!(*m, Some(i));
        }
        assert!((prev[3].x - (f1.keypoints[3].x as f64 + 5.0)).abs() < 1e-6);
    }

    #[test]
    fn test_fuse_adds_observation() {
        use crate::atlas::map::KeyFrame;

        let camera = test_camera();
        let pyramid = ScalePyramid::new(1.2, 8);
        let p = Vector3::new(0.1, 0.05, 2.0);
        let desc = descriptor(7);

        let mut map = Map::new();
        let make_kf = |id: u64, pose: SE3| {
            let (u, v) = camera.project(&pose.inverse().transform_point(&p)).unwrap();
            KeyFrame::new(
                KeyFrameId::new(id),
                id,
                0.0,
                pose,
                vec![KeyPoint::new(u as f32, v as f32, 0)],
                vec![desc],
                camera,
                pyramid.clone(),
            )
        };
        map.add_keyframe(make_kf(0, SE3::identity()));
        map.add_keyframe(make_kf(
            1,
            SE3::from_quaternion(Default::default(), Vector3::new(0.05, 0.0, 0.0)),
        ));
        let mp = map.create_map_point(p, desc, KeyFrameId::new(0));
        map.associate(KeyFrameId::new(0), 0, mp);
        map.update_map_point_normal_and_depth(mp);

        assert_eq!(fuse(&mut map, KeyFrameId::new(1), &[mp], 3.0), 1);
        assert_eq!(map.get_keyframe(KeyFrameId::new(1)).unwrap().get_map_point(0), Some(mp));
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_epipolar_check() {
        // Pure x translation: epipolar lines are horizontal.
        let t = Vector3::new(1.0, 0.0, 0.0);
        let tx = crate::geometry::so3::skew(&t);
        let k_inv = test_camera().k_matrix().try_inverse().unwrap();
        let f12 = k_inv.transpose() * tx * k_inv;
        let kp1 = KeyPoint::new(100.0, 80.0, 0);
        assert!(check_dist_epipolar_line(&kp1, &KeyPoint::new(140.0, 80.5, 0), &f12, 1.0));
        assert!(!check_dist_epipolar_line(&kp1, &KeyPoint::new(140.0, 90.0, 0), &f12, 1.0));
    }
}
