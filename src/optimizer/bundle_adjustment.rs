//! Bundle Adjustment with Levenberg-Marquardt and a Schur complement on points.
//!
//! Bundle Adjustment minimizes the robust reprojection error
//!
//! ```text
//! E = Σ_i,j ρ(e_ijᵀ Ω_ij e_ij),   e_ij = u_ij - π(T_i, p_j)
//! ```
//!
//! over the free keyframe poses `T_i` (T_cw) and the map points `p_j`.
//! Each LM step eliminates the points first: the 3×3 point blocks of the
//! normal equations are inverted independently and the reduced camera
//! system is solved densely.
//!
//! # Three phases
//!
//! Local Mapping must not hold the map lock while optimizing, so BA is split:
//! 1. **collect** a snapshot under a read lock ([`collect_local_ba_data`],
//!    [`collect_global_ba_data`])
//! 2. **solve** without any lock ([`solve_ba`]), polling `should_stop`
//!    between iterations
//! 3. **apply** under a write lock ([`apply_ba_results`]), skipping anything
//!    that was erased in the meantime and removing outlier observations

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

use super::edges::{chi2, huber_cost, huber_weight, jacobians_cw, reprojection_error, CHI2_MONO};

/// Cap on a single term of the cost, so invalid projections stay comparable.
const MAX_TERM_CHI2: f64 = 1e6;
/// Damping retries within one LM iteration.
const MAX_DAMPING_RETRIES: usize = 10;

#[derive(Debug, Clone)]
pub struct BAConfig {
    pub max_iterations: usize,
    /// Huber threshold in whitened pixels.
    pub huber_delta: f64,
}

impl Default for BAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            huber_delta: CHI2_MONO.sqrt(),
        }
    }
}

/// Snapshot of a BA problem, independent of the map lock.
#[derive(Debug, Clone)]
pub struct BAProblemData {
    pub kf_ids: Vec<KeyFrameId>,
    /// T_cw per keyframe.
    pub poses_cw: Vec<SE3>,
    pub fixed: Vec<bool>,
    pub cameras: Vec<CameraModel>,
    pub mp_ids: Vec<MapPointId>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BAObservation>,
}

#[derive(Debug, Clone, Copy)]
pub struct BAObservation {
    pub pose_idx: usize,
    pub point_idx: usize,
    pub feature_idx: usize,
    pub uv: Vector2<f64>,
    pub inv_sigma2: f64,
}

/// Optimized values, ready to be written back.
#[derive(Debug, Clone)]
pub struct BAResultData {
    /// Optimized poses of the free keyframes (T_wc).
    pub poses: Vec<(KeyFrameId, SE3)>,
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    /// Observations rejected after solving: `(keyframe, feature index, point)`.
    pub outliers: Vec<(KeyFrameId, usize, MapPointId)>,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Whether `should_stop` cut the optimization short.
    pub aborted: bool,
}

// ============================================================================
// PHASE 1: COLLECT
// ============================================================================

/// Local BA around `current_kf_id`: the keyframe and its covisible neighbours
/// are free, every other observer of their points is held fixed. The origin
/// keyframe is always fixed.
pub fn collect_local_ba_data(map: &Map, current_kf_id: KeyFrameId) -> Option<BAProblemData> {
    let current = map.get_keyframe(current_kf_id)?;
    let mut local_kfs = vec![current_kf_id];
    for (id, _) in current.ordered_connections() {
        if map.get_keyframe(id).map_or(false, |kf| !kf.is_bad) {
            local_kfs.push(id);
        }
    }
    let mp_ids = map.get_map_points_from_keyframes(&local_kfs);
    let local_set: HashSet<KeyFrameId> = local_kfs.iter().copied().collect();

    let mut fixed_kfs: Vec<KeyFrameId> = Vec::new();
    let mut fixed_set = HashSet::new();
    for &mp_id in &mp_ids {
        if let Some(mp) = map.get_map_point(mp_id) {
            for &kf_id in mp.observations.keys() {
                if !local_set.contains(&kf_id) && fixed_set.insert(kf_id) {
                    fixed_kfs.push(kf_id);
                }
            }
        }
    }
    fixed_kfs.sort();

    let origin = map.origin_kf_id();
    let all: Vec<(KeyFrameId, bool)> = local_kfs
        .iter()
        .map(|&id| (id, Some(id) == origin))
        .chain(fixed_kfs.iter().map(|&id| (id, true)))
        .collect();
    build_problem(map, &all, &mp_ids)
}

/// Global BA over the whole map with the origin keyframe fixed.
pub fn collect_global_ba_data(map: &Map) -> Option<BAProblemData> {
    let origin = map.origin_kf_id();
    let all: Vec<(KeyFrameId, bool)> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| (kf.id, Some(kf.id) == origin))
        .collect();
    let mp_ids: Vec<MapPointId> = map.map_point_ids().copied().collect();
    build_problem(map, &all, &mp_ids)
}

fn build_problem(map: &Map, keyframes: &[(KeyFrameId, bool)], mp_ids: &[MapPointId]) -> Option<BAProblemData> {
    let mut kf_ids = Vec::new();
    let mut poses_cw = Vec::new();
    let mut fixed = Vec::new();
    let mut cameras = Vec::new();
    let mut pose_index: HashMap<KeyFrameId, usize> = HashMap::new();
    for &(kf_id, is_fixed) in keyframes {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        pose_index.insert(kf_id, kf_ids.len());
        kf_ids.push(kf_id);
        poses_cw.push(kf.pose_cw());
        fixed.push(is_fixed);
        cameras.push(kf.camera);
    }

    let mut points = Vec::new();
    let mut kept_mp_ids = Vec::new();
    let mut observations = Vec::new();
    for &mp_id in mp_ids {
        let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
            continue;
        };
        let obs: Vec<BAObservation> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, &feature_idx)| {
                let pose_idx = *pose_index.get(kf_id)?;
                let kf = map.get_keyframe(*kf_id)?;
                let kp = kf.keypoints.get(feature_idx)?;
                Some(BAObservation {
                    pose_idx,
                    point_idx: points.len(),
                    feature_idx,
                    uv: Vector2::new(kp.x as f64, kp.y as f64),
                    inv_sigma2: kf.pyramid.inv_sigma2(kp.octave),
                })
            })
            .collect();
        // A single view does not constrain depth.
        if obs.len() < 2 {
            continue;
        }
        observations.extend(obs);
        kept_mp_ids.push(mp_id);
        points.push(mp.position);
    }

    if observations.is_empty() || fixed.iter().all(|f| *f) {
        return None;
    }
    Some(BAProblemData {
        kf_ids,
        poses_cw,
        fixed,
        cameras,
        mp_ids: kept_mp_ids,
        points,
        observations,
    })
}

// ============================================================================
// PHASE 2: SOLVE
// ============================================================================

struct Linearization {
    h_pp: DMatrix<f64>,
    b_p: DVector<f64>,
    h_ll: Vec<Matrix3<f64>>,
    b_l: Vec<Vector3<f64>>,
    /// Pose-point block per observation (`None` for fixed poses or invalid projections).
    h_pl: Vec<Option<Matrix6x3<f64>>>,
}

fn total_cost(problem: &BAProblemData, poses: &[SE3], points: &[Vector3<f64>], delta: f64) -> f64 {
    problem
        .observations
        .iter()
        .map(|o| {
            let e2 = chi2(
                &poses[o.pose_idx],
                &points[o.point_idx],
                &o.uv,
                o.inv_sigma2,
                &problem.cameras[o.pose_idx],
            );
            huber_cost(e2.min(MAX_TERM_CHI2), delta)
        })
        .sum()
}

fn linearize(
    problem: &BAProblemData,
    poses: &[SE3],
    points: &[Vector3<f64>],
    free_index: &[Option<usize>],
    num_free: usize,
    delta: f64,
) -> Linearization {
    let mut lin = Linearization {
        h_pp: DMatrix::zeros(num_free * 6, num_free * 6),
        b_p: DVector::zeros(num_free * 6),
        h_ll: vec![Matrix3::zeros(); points.len()],
        b_l: vec![Vector3::zeros(); points.len()],
        h_pl: vec![None; problem.observations.len()],
    };

    for (k, o) in problem.observations.iter().enumerate() {
        let pose = &poses[o.pose_idx];
        let point = &points[o.point_idx];
        let camera = &problem.cameras[o.pose_idx];
        let Some(e) = reprojection_error(pose, point, &o.uv, camera) else {
            continue;
        };
        let e2 = e.norm_squared() * o.inv_sigma2;
        let w = o.inv_sigma2 * huber_weight(e2, delta);
        let (j_pose, j_point) = jacobians_cw(pose, point, camera);

        lin.h_ll[o.point_idx] += j_point.transpose() * j_point * w;
        lin.b_l[o.point_idx] -= j_point.transpose() * e * w;

        if let Some(pi) = free_index[o.pose_idx] {
            let base = pi * 6;
            let h = j_pose.transpose() * j_pose * w;
            let mut block = lin.h_pp.fixed_view_mut::<6, 6>(base, base);
            block += h;
            let b: Vector6<f64> = -(j_pose.transpose() * e * w);
            let mut seg = lin.b_p.fixed_rows_mut::<6>(base);
            seg += b;
            lin.h_pl[k] = Some(j_pose.transpose() * j_point * w);
        }
    }
    lin
}

/// Solve the damped system via the Schur complement. Returns pose and point steps.
fn solve_damped(
    problem: &BAProblemData,
    lin: &Linearization,
    free_index: &[Option<usize>],
    obs_by_point: &[Vec<usize>],
    num_free: usize,
    lambda: f64,
) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let damp = |x: f64| lambda * x.max(1e-6);

    let mut h_ll_inv = Vec::with_capacity(lin.h_ll.len());
    for block in &lin.h_ll {
        let mut b = *block;
        for i in 0..3 {
            b[(i, i)] += damp(block[(i, i)]);
        }
        h_ll_inv.push(b.try_inverse().unwrap_or_else(Matrix3::zeros));
    }

    let mut schur = lin.h_pp.clone();
    for i in 0..num_free * 6 {
        schur[(i, i)] += damp(lin.h_pp[(i, i)]);
    }
    let mut b_schur = lin.b_p.clone();

    for (j, obs_ids) in obs_by_point.iter().enumerate() {
        let inv = &h_ll_inv[j];
        let free_obs: Vec<(usize, Matrix6x3<f64>)> = obs_ids
            .iter()
            .filter_map(|&k| {
                let pi = free_index[problem.observations[k].pose_idx]?;
                lin.h_pl[k].map(|w| (pi, w))
            })
            .collect();
        for &(a, w_a) in &free_obs {
            let w_a_inv = w_a * inv;
            let mut seg = b_schur.fixed_rows_mut::<6>(a * 6);
            seg -= w_a_inv * lin.b_l[j];
            for &(b, w_b) in &free_obs {
                let mut block = schur.fixed_view_mut::<6, 6>(a * 6, b * 6);
                block -= w_a_inv * w_b.transpose();
            }
        }
    }

    let delta_p = if num_free == 0 {
        DVector::zeros(0)
    } else {
        schur.lu().solve(&b_schur)?
    };

    let mut delta_l = Vec::with_capacity(obs_by_point.len());
    for (j, obs_ids) in obs_by_point.iter().enumerate() {
        let mut rhs = lin.b_l[j];
        for &k in obs_ids {
            if let (Some(pi), Some(w)) = (free_index[problem.observations[k].pose_idx], lin.h_pl[k]) {
                rhs -= w.transpose() * delta_p.fixed_rows::<6>(pi * 6);
            }
        }
        delta_l.push(h_ll_inv[j] * rhs);
    }
    Some((delta_p, delta_l))
}

/// Run LM on a collected problem.
pub fn solve_ba(
    problem: &BAProblemData,
    config: &BAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<BAResultData> {
    if problem.observations.is_empty() {
        return None;
    }

    let mut free_index = vec![None; problem.kf_ids.len()];
    let mut num_free = 0;
    for (i, fixed) in problem.fixed.iter().enumerate() {
        if !fixed {
            free_index[i] = Some(num_free);
            num_free += 1;
        }
    }
    let mut obs_by_point: Vec<Vec<usize>> = vec![Vec::new(); problem.points.len()];
    for (k, o) in problem.observations.iter().enumerate() {
        obs_by_point[o.point_idx].push(k);
    }

    let delta = config.huber_delta;
    let mut poses = problem.poses_cw.clone();
    let mut points = problem.points.clone();
    let initial_cost = total_cost(problem, &poses, &points, delta);
    let mut cost = initial_cost;
    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut aborted = false;

    for _ in 0..config.max_iterations {
        if should_stop() {
            aborted = true;
            break;
        }
        iterations += 1;

        let lin = linearize(problem, &poses, &points, &free_index, num_free, delta);
        let mut improved = false;
        for _ in 0..MAX_DAMPING_RETRIES {
            let Some((dp, dl)) = solve_damped(problem, &lin, &free_index, &obs_by_point, num_free, lambda) else {
                lambda *= 10.0;
                continue;
            };
            let trial_poses: Vec<SE3> = poses
                .iter()
                .enumerate()
                .map(|(i, pose)| match free_index[i] {
                    Some(pi) => pose.retract(&dp.fixed_rows::<6>(pi * 6).into_owned()),
                    None => *pose,
                })
                .collect();
            let trial_points: Vec<Vector3<f64>> =
                points.iter().zip(&dl).map(|(p, d)| p + d).collect();
            let trial_cost = total_cost(problem, &trial_poses, &trial_points, delta);
            if trial_cost < cost {
                poses = trial_poses;
                points = trial_points;
                let relative = (cost - trial_cost) / cost.max(f64::EPSILON);
                cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-12);
                improved = relative > 1e-9;
                break;
            }
            lambda = (lambda * 10.0).min(1e12);
        }
        if !improved {
            break;
        }
    }

    let mut outliers = Vec::new();
    for o in &problem.observations {
        let pose = &poses[o.pose_idx];
        let point = &points[o.point_idx];
        let depth = pose.transform_point(point).z;
        let e2 = chi2(pose, point, &o.uv, o.inv_sigma2, &problem.cameras[o.pose_idx]);
        if depth <= 0.0 || e2 > CHI2_MONO {
            outliers.push((problem.kf_ids[o.pose_idx], o.feature_idx, problem.mp_ids[o.point_idx]));
        }
    }

    let result_poses = problem
        .kf_ids
        .iter()
        .zip(&poses)
        .zip(&problem.fixed)
        .filter(|(_, fixed)| !**fixed)
        .map(|((id, pose), _)| (*id, pose.inverse()))
        .collect();

    Some(BAResultData {
        poses: result_poses,
        points: problem.mp_ids.iter().copied().zip(points).collect(),
        outliers,
        iterations,
        initial_cost,
        final_cost: cost,
        aborted,
    })
}

// ============================================================================
// PHASE 3: APPLY
// ============================================================================

/// Write optimized values back and erase outlier observations.
///
/// Entities erased while the solver ran are skipped. Returns the number of
/// observations removed.
pub fn apply_ba_results(map: &mut Map, results: &BAResultData) -> usize {
    let mut removed = 0;
    for &(kf_id, feature_idx, mp_id) in &results.outliers {
        let still_linked = map
            .get_keyframe(kf_id)
            .and_then(|kf| kf.get_map_point(feature_idx))
            == Some(mp_id);
        if still_linked {
            map.disassociate(kf_id, feature_idx);
            removed += 1;
        }
    }

    for (kf_id, pose) in &results.poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            if !kf.is_bad {
                kf.pose = *pose;
            }
        }
    }
    for (mp_id, position) in &results.points {
        let exists = match map.get_map_point_mut(*mp_id) {
            Some(mp) if !mp.is_bad => {
                mp.position = *position;
                true
            }
            _ => false,
        };
        if exists {
            map.update_map_point_normal_and_depth(*mp_id);
        }
    }

    debug!(
        "[BA] {} iters, cost {:.2} -> {:.2}, {} outlier observations removed",
        results.iterations, results.initial_cost, results.final_cost, removed
    );
    removed
}

/// Run all three phases on a map the caller already owns exclusively.
pub fn global_bundle_adjustment(map: &mut Map, config: &BAConfig) -> Option<BAResultData> {
    let problem = collect_global_ba_data(map)?;
    let result = solve_ba(&problem, config, &|| false)?;
    apply_ba_results(map, &result);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrame;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    /// Three keyframes looking at a random cloud; every point seen by all.
    fn build_map(points: &[Vector3<f64>], poses_wc: &[SE3]) -> Map {
        let mut map = Map::new();
        for (i, pose) in poses_wc.iter().enumerate() {
            let pose_cw = pose.inverse();
            let keypoints: Vec<KeyPoint> = points
                .iter()
                .map(|p| {
                    let (u, v) = camera().project(&pose_cw.transform_point(p)).unwrap();
                    KeyPoint::new(u as f32, v as f32, 0)
                })
                .collect();
            let descriptors = vec![Descriptor::zeros(); keypoints.len()];
            map.add_keyframe(KeyFrame::new(
                KeyFrameId::new(i as u64),
                i as u64,
                i as f64,
                *pose,
                keypoints,
                descriptors,
                camera(),
                ScalePyramid::new(1.2, 8),
            ));
        }
        for (j, p) in points.iter().enumerate() {
            let mp = map.create_map_point(*p, Descriptor::zeros(), KeyFrameId::new(0));
            for i in 0..poses_wc.len() {
                map.associate(KeyFrameId::new(i as u64), j, mp);
            }
        }
        for i in 0..poses_wc.len() {
            map.update_connections(KeyFrameId::new(i as u64));
        }
        map
    }

    fn scene() -> (Vec<Vector3<f64>>, Vec<SE3>) {
        let mut rng = StdRng::seed_from_u64(11);
        let points = (0..60)
            .map(|_| Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-0.8..0.8), rng.gen_range(4.0..6.0)))
            .collect();
        let poses = vec![
            SE3::identity(),
            SE3::from_quaternion(UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0), Vector3::new(0.3, 0.0, 0.0)),
            SE3::from_quaternion(UnitQuaternion::from_euler_angles(0.01, -0.02, 0.0), Vector3::new(0.6, 0.05, 0.1)),
        ];
        (points, poses)
    }

    #[test]
    fn test_local_ba_reduces_error() {
        let (points, poses) = scene();
        let mut map = build_map(&points, &poses);

        // Perturb the free keyframe and the points.
        let mut rng = StdRng::seed_from_u64(3);
        for mp_id in map.map_point_ids().copied().collect::<Vec<_>>() {
            let mp = map.get_map_point_mut(mp_id).unwrap();
            mp.position += Vector3::new(rng.gen_range(-0.02..0.02), rng.gen_range(-0.02..0.02), rng.gen_range(-0.05..0.05));
        }
        let kf2 = KeyFrameId::new(2);
        map.get_keyframe_mut(kf2).unwrap().pose.translation += Vector3::new(0.01, -0.01, 0.02);

        let problem = collect_local_ba_data(&map, kf2).unwrap();
        assert_eq!(problem.fixed.iter().filter(|f| !**f).count(), 2, "origin stays fixed");

        let config = BAConfig { max_iterations: 20, ..BAConfig::default() };
        let result = solve_ba(&problem, &config, &|| false).unwrap();
        assert!(result.final_cost < 0.01 * result.initial_cost);
        assert!(result.outliers.is_empty());

        apply_ba_results(&mut map, &result);
        assert!(map.check_consistency().is_empty());
        let origin = map.get_keyframe(KeyFrameId::new(0)).unwrap();
        assert_relative_eq!(origin.pose.translation, Vector3::zeros());
    }

    #[test]
    fn test_outlier_observation_removed() {
        let (points, poses) = scene();
        let mut map = build_map(&points, &poses);
        {
            let kf = map.get_keyframe_mut(KeyFrameId::new(1)).unwrap();
            kf.keypoints[5].x += 40.0;
        }
        let result = global_bundle_adjustment(&mut map, &BAConfig::default()).unwrap();
        assert!(result
            .outliers
            .iter()
            .any(|&(kf, idx, _)| kf == KeyFrameId::new(1) && idx == 5));
        assert!(map.get_keyframe(KeyFrameId::new(1)).unwrap().get_map_point(5).is_none());
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_should_stop_aborts_before_first_iteration() {
        let (points, poses) = scene();
        let map = build_map(&points, &poses);
        let problem = collect_global_ba_data(&map).unwrap();
        let result = solve_ba(&problem, &BAConfig::default(), &|| true).unwrap();
        assert!(result.aborted);
        assert_eq!(result.iterations, 0);
        assert_relative_eq!(result.final_cost, result.initial_cost);
    }
}
