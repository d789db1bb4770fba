//! Motion-only optimization of a single camera pose.
//!
//! Map points are held fixed; only the 6-DOF pose is refined against the
//! frame's matched keypoints. Four rounds of ten damped Gauss-Newton
//! iterations are run. After every round each observation is reclassified as
//! inlier or outlier with the χ² test, and outliers are left out of the next
//! round. The first two rounds use a Huber kernel.

use nalgebra::{Matrix6, Vector2, Vector3, Vector6};

use crate::atlas::map::Map;
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;
use crate::tracking::Frame;

use super::edges::{chi2, huber_cost, huber_weight, jacobians_cw, reprojection_error, CHI2_MONO};

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;
const ROBUST_ROUNDS: usize = 2;
/// Fewer correspondences than this leave the pose untouched.
const MIN_CORRESPONDENCES: usize = 3;

/// One 3D-2D correspondence.
#[derive(Debug, Clone, Copy)]
pub struct PoseObservation {
    pub uv: Vector2<f64>,
    pub point: Vector3<f64>,
    /// Inverse variance of the keypoint's octave.
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct PoseOptimization {
    pub pose_cw: SE3,
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Refine `pose_cw` and classify every observation.
pub fn optimize_pose_observations(
    camera: &CameraModel,
    pose_cw: SE3,
    observations: &[PoseObservation],
) -> PoseOptimization {
    let n = observations.len();
    let mut outliers = vec![false; n];
    if n < MIN_CORRESPONDENCES {
        return PoseOptimization {
            pose_cw,
            outliers,
            num_inliers: 0,
        };
    }

    let delta = CHI2_MONO.sqrt();
    let mut pose = pose_cw;
    let mut num_bad = 0;
    for round in 0..ROUNDS {
        let kernel = (round < ROBUST_ROUNDS).then_some(delta);
        pose = refine_pose(camera, pose, observations, &outliers, ITERATIONS_PER_ROUND, kernel);

        num_bad = 0;
        for (obs, outlier) in observations.iter().zip(outliers.iter_mut()) {
            let e2 = chi2(&pose, &obs.point, &obs.uv, obs.inv_sigma2, camera);
            *outlier = e2 > CHI2_MONO;
            if *outlier {
                num_bad += 1;
            }
        }
        if n - num_bad < MIN_CORRESPONDENCES {
            break;
        }
    }

    PoseOptimization {
        pose_cw: pose,
        outliers,
        num_inliers: n - num_bad,
    }
}

/// Damped Gauss-Newton over the observations not flagged in `excluded`.
///
/// A step that increases the (robust) cost is rejected and retried with
/// more damping.
pub(crate) fn refine_pose(
    camera: &CameraModel,
    pose_cw: SE3,
    observations: &[PoseObservation],
    excluded: &[bool],
    iterations: usize,
    huber_delta: Option<f64>,
) -> SE3 {
    let cost = |pose: &SE3| -> f64 {
        observations
            .iter()
            .zip(excluded)
            .filter(|(_, ex)| !**ex)
            .map(|(obs, _)| {
                let e2 = chi2(pose, &obs.point, &obs.uv, obs.inv_sigma2, camera).min(1e6);
                huber_delta.map_or(e2, |d| huber_cost(e2, d))
            })
            .sum()
    };

    let mut pose = pose_cw;
    let mut current_cost = cost(&pose);
    let mut lambda = 1e-4;
    for _ in 0..iterations {
        let mut h = Matrix6::zeros();
        let mut b = Vector6::zeros();
        let mut used = 0;
        for (obs, ex) in observations.iter().zip(excluded) {
            if *ex {
                continue;
            }
            let Some(e) = reprojection_error(&pose, &obs.point, &obs.uv, camera) else {
                continue;
            };
            let e2 = e.norm_squared() * obs.inv_sigma2;
            let w = obs.inv_sigma2 * huber_delta.map_or(1.0, |d| huber_weight(e2, d));
            let (j, _) = jacobians_cw(&pose, &obs.point, camera);
            h += j.transpose() * j * w;
            b -= j.transpose() * e * w;
            used += 1;
        }
        if used < MIN_CORRESPONDENCES {
            break;
        }
        for i in 0..6 {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let Some(dx) = h.cholesky().map(|c| c.solve(&b)) else {
            lambda *= 10.0;
            continue;
        };
        let candidate = pose.retract(&dx);
        let candidate_cost = cost(&candidate);
        if candidate_cost > current_cost {
            lambda = (lambda * 10.0).min(1e8);
            continue;
        }
        pose = candidate;
        current_cost = candidate_cost;
        lambda = (lambda * 0.1).max(1e-10);
        if dx.norm() < 1e-10 {
            break;
        }
    }
    pose
}

/// Optimize the pose of `frame` against its matched map points.
///
/// Writes the refined pose and the outlier flags back into the frame and
/// returns the number of inliers. Matches to points that no longer exist are
/// dropped.
pub fn optimize_pose(frame: &mut Frame, map: &Map) -> usize {
    let Some(pose_wc) = frame.pose else {
        return 0;
    };

    let mut indices = Vec::new();
    let mut observations = Vec::new();
    for idx in 0..frame.map_points.len() {
        let Some(mp_id) = frame.map_points[idx] else {
            continue;
        };
        match map.get_map_point(mp_id).filter(|mp| !mp.is_bad) {
            Some(mp) => {
                let kp = &frame.keypoints[idx];
                indices.push(idx);
                observations.push(PoseObservation {
                    uv: Vector2::new(kp.x as f64, kp.y as f64),
                    point: mp.position,
                    inv_sigma2: frame.pyramid.inv_sigma2(kp.octave),
                });
                frame.outliers[idx] = false;
            }
            None => {
                frame.map_points[idx] = None;
                frame.outliers[idx] = false;
            }
        }
    }
    if observations.len() < MIN_CORRESPONDENCES {
        return 0;
    }

    let result = optimize_pose_observations(&frame.camera, pose_wc.inverse(), &observations);
    frame.pose = Some(result.pose_cw.inverse());
    for (k, &idx) in indices.iter().enumerate() {
        frame.outliers[idx] = result.outliers[k];
    }
    result.num_inliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scene(pose_cw: &SE3, camera: &CameraModel, n: usize) -> Vec<PoseObservation> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut out = Vec::new();
        while out.len() < n {
            let p = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            let Some((u, v)) = camera.project(&pose_cw.transform_point(&p)) else {
                continue;
            };
            if !camera.is_in_image(u, v) {
                continue;
            }
            out.push(PoseObservation {
                uv: Vector2::new(u, v),
                point: p,
                inv_sigma2: 1.0,
            });
        }
        out
    }

    #[test]
    fn test_recovers_pose_and_flags_outliers() {
        let camera = CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, 640, 480);
        let truth = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.02, -0.03, 0.01),
            Vector3::new(0.05, -0.02, 0.1),
        );
        let mut obs = scene(&truth, &camera, 120);
        for o in obs.iter_mut().take(20) {
            o.uv += Vector2::new(40.0, -30.0);
        }

        let result = optimize_pose_observations(&camera, SE3::identity(), &obs);
        assert_relative_eq!(result.pose_cw.translation, truth.translation, epsilon = 1e-6);
        assert!(result.pose_cw.rotation.angle_to(&truth.rotation) < 1e-6);
        assert_eq!(result.num_inliers, 100);
        assert!(result.outliers[..20].iter().all(|&o| o));
        assert!(result.outliers[20..].iter().all(|&o| !o));
    }

    #[test]
    fn test_too_few_correspondences() {
        let camera = CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, 640, 480);
        let obs = scene(&SE3::identity(), &camera, 2);
        let result = optimize_pose_observations(&camera, SE3::identity(), &obs);
        assert_eq!(result.num_inliers, 0);
    }
}
