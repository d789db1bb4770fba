//! PnP (Perspective-n-Point) with RANSAC.
//!
//! Each hypothesis refines a prior pose against a random 4-point sample
//! with damped Gauss-Newton, then counts the correspondences that pass the
//! χ² test. The best hypothesis is refitted on its inliers.
//!
//! Relocalization always has a prior (the candidate keyframe's pose), so no
//! closed-form minimal solver is needed.

use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::geometry::SE3;
use crate::optimizer::edges::{chi2, CHI2_MONO};
use crate::optimizer::pose_optimizer::{refine_pose, PoseObservation};
use crate::tracking::frame::CameraModel;

const SAMPLE_SIZE: usize = 4;
const SAMPLE_ITERATIONS: usize = 10;
const REFIT_ITERATIONS: usize = 10;

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (T_wc).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

#[derive(Debug, Clone)]
pub struct PnPRansacParams {
    pub iterations: usize,
    /// Hypotheses with fewer inliers are rejected.
    pub min_inliers: usize,
    /// Stop early once this fraction of correspondences are inliers.
    pub early_stop_ratio: f64,
    pub seed: u64,
}

impl Default for PnPRansacParams {
    fn default() -> Self {
        Self {
            iterations: 300,
            min_inliers: 10,
            early_stop_ratio: 0.9,
            seed: 0,
        }
    }
}

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// # Arguments
/// * `points3d` - 3D world points
/// * `points2d` - Corresponding undistorted image points
/// * `inv_sigma2` - Inverse keypoint variance per correspondence
/// * `camera` - Camera intrinsics
/// * `prior` - Initial pose guess (T_wc)
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    inv_sigma2: &[f64],
    camera: &CameraModel,
    prior: &SE3,
    params: &PnPRansacParams,
) -> Option<PnPResult> {
    let n = points3d.len();
    if n < SAMPLE_SIZE || points2d.len() != n || inv_sigma2.len() != n {
        return None;
    }
    let observations: Vec<PoseObservation> = (0..n)
        .map(|i| PoseObservation {
            uv: points2d[i],
            point: points3d[i],
            inv_sigma2: inv_sigma2[i],
        })
        .collect();

    let prior_cw = prior.inverse();
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(SE3, Vec<bool>, usize)> = None;
    let mut excluded = vec![true; n];

    for _ in 0..params.iterations {
        excluded.iter_mut().for_each(|e| *e = true);
        for idx in sample(&mut rng, n, SAMPLE_SIZE) {
            excluded[idx] = false;
        }
        let pose_cw = refine_pose(camera, prior_cw, &observations, &excluded, SAMPLE_ITERATIONS, None);
        let (mask, count) = classify(&observations, &pose_cw, camera);
        if best.as_ref().map_or(true, |(_, _, c)| count > *c) {
            best = Some((pose_cw, mask, count));
        }
        if count as f64 >= params.early_stop_ratio * n as f64 {
            break;
        }
    }

    let (pose_cw, mask, count) = best?;
    if count < params.min_inliers.max(SAMPLE_SIZE) {
        return None;
    }

    let outliers: Vec<bool> = mask.iter().map(|inlier| !inlier).collect();
    let refined = refine_pose(camera, pose_cw, &observations, &outliers, REFIT_ITERATIONS, None);
    let (refined_mask, refined_count) = classify(&observations, &refined, camera);
    let (pose_cw, inlier_mask, num_inliers) = if refined_count >= count {
        (refined, refined_mask, refined_count)
    } else {
        (pose_cw, mask, count)
    };

    Some(PnPResult {
        pose: pose_cw.inverse(),
        inlier_mask,
        num_inliers,
    })
}

fn classify(observations: &[PoseObservation], pose_cw: &SE3, camera: &CameraModel) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = observations
        .iter()
        .map(|o| chi2(pose_cw, &o.point, &o.uv, o.inv_sigma2, camera) <= CHI2_MONO)
        .collect();
    let count = mask.iter().filter(|m| **m).count();
    (mask, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;
    use rand::Rng;

    #[test]
    fn test_recovers_pose_with_outliers() {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let truth_wc = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.03, -0.05, 0.02),
            Vector3::new(0.2, -0.1, 0.15),
        );
        let truth_cw = truth_wc.inverse();

        let mut rng = StdRng::seed_from_u64(5);
        let mut p3 = Vec::new();
        let mut p2 = Vec::new();
        while p3.len() < 80 {
            let p = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(4.0..7.0));
            let Some((u, v)) = camera.project(&truth_cw.transform_point(&p)) else {
                continue;
            };
            if !camera.is_in_image(u, v) {
                continue;
            }
            p3.push(p);
            p2.push(Vector2::new(u, v));
        }
        // A quarter of the matches are wrong.
        for uv in p2.iter_mut().take(20) {
            *uv += Vector2::new(rng.gen_range(30.0..80.0), rng.gen_range(-80.0..-30.0));
        }
        let sigmas = vec![1.0; p3.len()];

        let result = solve_pnp_ransac(&p3, &p2, &sigmas, &camera, &SE3::identity(), &PnPRansacParams::default())
            .unwrap();
        assert_eq!(result.num_inliers, 60);
        assert!(result.inlier_mask[..20].iter().all(|m| !m));
        assert!((result.pose.translation - truth_wc.translation).norm() < 1e-3);
        assert!(result.pose.rotation.angle_to(&truth_wc.rotation) < 1e-3);
    }

    #[test]
    fn test_rejects_too_few_points() {
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let p3 = vec![Vector3::new(0.0, 0.0, 5.0); 3];
        let p2 = vec![Vector2::new(320.0, 240.0); 3];
        assert!(solve_pnp_ransac(&p3, &p2, &[1.0; 3], &camera, &SE3::identity(), &PnPRansacParams::default())
            .is_none());
    }
}
