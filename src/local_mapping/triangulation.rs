//! New map points from keyframe pairs.
//!
//! Implements the CreateNewMapPoints step of ORB-SLAM's LocalMapping:
//! 1. For each covisible keyframe with enough baseline, match unmatched
//!    features under the epipolar constraint
//! 2. Triangulate each match linearly (DLT)
//! 3. Validate with parallax, depth, reprojection error and scale consistency

use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPointId};
use crate::geometry::so3;
use crate::optimizer::CHI2_MONO;
use crate::tracking::initializer::triangulate;
use crate::tracking::matcher::OrbMatcher;

/// Configuration for triangulation between keyframe pairs.
#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    /// Number of covisible keyframes to pair with.
    pub num_neighbors: usize,
    /// Minimum baseline as fraction of the neighbour's median scene depth.
    pub min_baseline_ratio: f64,
    /// Rays closer than this (cosine) carry no depth information.
    pub max_cos_parallax: f64,
    /// Scale ratio tolerance, multiplied by the pyramid scale factor.
    pub scale_ratio_factor: f64,
    pub nn_ratio: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 20,
            min_baseline_ratio: 0.01,
            max_cos_parallax: 0.9998,
            scale_ratio_factor: 1.5,
            nn_ratio: 0.6,
        }
    }
}

#[derive(Debug, Default)]
pub struct TriangulationResult {
    pub new_points: Vec<MapPointId>,
    pub num_pairs_checked: usize,
    pub num_matches_found: usize,
}

/// A validated match, ready to become a map point.
struct Candidate {
    idx1: usize,
    idx2: usize,
    position: Vector3<f64>,
}

/// Triangulate new map points between `current_kf_id` and its best covisibles.
pub fn create_new_map_points(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    config: &TriangulationConfig,
) -> TriangulationResult {
    let mut result = TriangulationResult::default();
    let neighbors = map.get_local_keyframes(current_kf_id, config.num_neighbors);
    let matcher = OrbMatcher::new(config.nn_ratio, false);

    for neighbor_id in neighbors {
        let candidates = {
            let (Some(kf1), Some(kf2)) = (map.get_keyframe(current_kf_id), map.get_keyframe(neighbor_id)) else {
                continue;
            };
            if kf2.is_bad {
                continue;
            }
            result.num_pairs_checked += 1;

            let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
            let median_depth = kf2.median_depth(
                kf2.get_map_point_indices()
                    .filter_map(|(_, id)| map.get_map_point(id))
                    .map(|mp| mp.position),
            );
            match median_depth {
                Some(depth) if depth > 0.0 && baseline / depth >= config.min_baseline_ratio => {}
                _ => continue,
            }

            let f12 = compute_f12(kf1, kf2);
            let matches = matcher.search_for_triangulation(kf1, kf2, &f12);
            result.num_matches_found += matches.len();
            matches
                .into_iter()
                .filter_map(|(idx1, idx2)| {
                    triangulate_match(kf1, kf2, idx1, idx2, config).map(|position| Candidate { idx1, idx2, position })
                })
                .collect::<Vec<_>>()
        };

        for c in candidates {
            let descriptor = match map.get_keyframe(current_kf_id) {
                Some(kf) => kf.descriptors[c.idx1],
                None => break,
            };
            let mp_id = map.create_map_point(c.position, descriptor, current_kf_id);
            if !map.associate(current_kf_id, c.idx1, mp_id) || !map.associate(neighbor_id, c.idx2, mp_id) {
                map.erase_map_point(mp_id);
                continue;
            }
            map.update_map_point_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            result.new_points.push(mp_id);
        }
    }

    if !result.new_points.is_empty() {
        debug!(
            "[LocalMapping] {}: {} new points (pairs={}, matches={})",
            current_kf_id,
            result.new_points.len(),
            result.num_pairs_checked,
            result.num_matches_found
        );
    }
    result
}

/// Fundamental matrix between two keyframes, with `x1ᵀ F12 x2 = 0`.
pub fn compute_f12(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
    let t1 = kf1.pose_cw();
    let t2 = kf2.pose_cw();
    let r1 = t1.rotation_matrix();
    let r2 = t2.rotation_matrix();

    let r12 = r1 * r2.transpose();
    let t12 = -r12 * t2.translation + t1.translation;

    let k1_inv = kf1.camera.k_matrix().try_inverse().unwrap_or_else(Matrix3::identity);
    let k2_inv = kf2.camera.k_matrix().try_inverse().unwrap_or_else(Matrix3::identity);
    k1_inv.transpose() * so3::skew(&t12) * r12 * k2_inv
}

/// Triangulate one match and run the validity checks.
fn triangulate_match(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    idx1: usize,
    idx2: usize,
    config: &TriangulationConfig,
) -> Option<Vector3<f64>> {
    let kp1 = &kf1.keypoints[idx1];
    let kp2 = &kf2.keypoints[idx2];
    let xn1 = kf1.camera.unproject(kp1.x as f64, kp1.y as f64);
    let xn2 = kf2.camera.unproject(kp2.x as f64, kp2.y as f64);

    let t1 = kf1.pose_cw();
    let t2 = kf2.pose_cw();
    let ray1 = kf1.pose.rotation * xn1;
    let ray2 = kf2.pose.rotation * xn2;
    let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
    if cos_parallax <= 0.0 || cos_parallax >= config.max_cos_parallax {
        return None;
    }

    let p = triangulate(
        &Vector2::new(xn1.x / xn1.z, xn1.y / xn1.z),
        &Vector2::new(xn2.x / xn2.z, xn2.y / xn2.z),
        &normalized_projection(&t1.rotation_matrix(), &t1.translation),
        &normalized_projection(&t2.rotation_matrix(), &t2.translation),
    )?;

    // In front of both cameras, within the reprojection error bound.
    for (kf, pose_cw, kp) in [(kf1, &t1, kp1), (kf2, &t2, kp2)] {
        let p_cam = pose_cw.transform_point(&p);
        if p_cam.z <= 0.0 {
            return None;
        }
        let (u, v) = kf.camera.project(&p_cam)?;
        let ex = u - kp.x as f64;
        let ey = v - kp.y as f64;
        if ex * ex + ey * ey > CHI2_MONO * kf.pyramid.sigma2(kp.octave) {
            return None;
        }
    }

    // Distance ratio between both cameras consistent with the octaves.
    let dist1 = (p - kf1.camera_center()).norm();
    let dist2 = (p - kf2.camera_center()).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = kf1.pyramid.scale(kp1.octave) / kf2.pyramid.scale(kp2.octave);
    let ratio_factor = config.scale_ratio_factor * kf1.pyramid.scale(1);
    if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
        return None;
    }
    Some(p)
}

/// `[R|t]`, the projection matrix in normalized image coordinates.
fn normalized_projection(r: &Matrix3<f64>, t: &Vector3<f64>) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    p.set_column(3, t);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::test_support::test_camera;
    use nalgebra::UnitQuaternion;

    fn keyframe(id: u64, pose: SE3, keypoints: Vec<KeyPoint>) -> KeyFrame {
        let n = keypoints.len();
        KeyFrame::new(
            KeyFrameId::new(id),
            id,
            id as f64,
            pose,
            keypoints,
            vec![Descriptor::zeros(); n],
            test_camera(),
            ScalePyramid::new(1.2, 8),
        )
    }

    fn observe(pose_wc: &SE3, p: &Vector3<f64>) -> KeyPoint {
        let (u, v) = test_camera().project(&pose_wc.inverse().transform_point(p)).unwrap();
        KeyPoint::new(u as f32, v as f32, 0)
    }

    #[test]
    fn test_fundamental_satisfies_epipolar_constraint() {
        let pose1 = SE3::identity();
        let pose2 = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.3, 0.0, 0.05),
        );
        let points = [Vector3::new(0.2, 0.1, 3.0), Vector3::new(-0.5, 0.3, 4.0), Vector3::new(0.1, -0.4, 2.5)];
        let kf1 = keyframe(0, pose1, points.iter().map(|p| observe(&pose1, p)).collect());
        let kf2 = keyframe(1, pose2, points.iter().map(|p| observe(&pose2, p)).collect());

        let f12 = compute_f12(&kf1, &kf2);
        for i in 0..points.len() {
            let x1 = Vector3::new(kf1.keypoints[i].x as f64, kf1.keypoints[i].y as f64, 1.0);
            let x2 = Vector3::new(kf2.keypoints[i].x as f64, kf2.keypoints[i].y as f64, 1.0);
            let residual = (x1.transpose() * f12 * x2)[(0, 0)];
            assert!(residual.abs() < 1e-3, "residual {}", residual);
        }
    }

    #[test]
    fn test_triangulate_match_recovers_point() {
        let pose1 = SE3::identity();
        let pose2 = SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(0.4, 0.0, 0.0));
        let p = Vector3::new(0.1, -0.2, 3.0);
        let kf1 = keyframe(0, pose1, vec![observe(&pose1, &p)]);
        let kf2 = keyframe(1, pose2, vec![observe(&pose2, &p)]);

        let q = triangulate_match(&kf1, &kf2, 0, 0, &TriangulationConfig::default()).unwrap();
        assert!((q - p).norm() < 1e-2);
    }

    #[test]
    fn test_no_parallax_is_rejected() {
        let pose = SE3::identity();
        let p = Vector3::new(0.1, -0.2, 3.0);
        let kf1 = keyframe(0, pose, vec![observe(&pose, &p)]);
        let kf2 = keyframe(1, pose, vec![observe(&pose, &p)]);
        assert!(triangulate_match(&kf1, &kf2, 0, 0, &TriangulationConfig::default()).is_none());
    }
}
