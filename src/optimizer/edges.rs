//! Monocular reprojection edge shared by the optimizers.
//!
//! Follows g2o's `EdgeSE3ProjectXYZ`: the error is `observed - projected`,
//! the pose is T_cw updated on the left with `exp([ω, υ])`, and the
//! information matrix is `inv_sigma2 · I₂` for the keypoint's octave.

use nalgebra::{Matrix2x3, Matrix2x6, Vector2, Vector3};

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// χ² (2 DOF, 95%) outlier threshold.
pub const CHI2_MONO: f64 = 5.991;

/// Points closer than this to the image plane are treated as invalid.
const MIN_DEPTH: f64 = 1e-6;

/// `observed - projected` for a world point seen from `pose_cw`.
/// `None` when the point is behind the camera.
#[inline]
pub fn reprojection_error(
    pose_cw: &SE3,
    point_world: &Vector3<f64>,
    observed_uv: &Vector2<f64>,
    camera: &CameraModel,
) -> Option<Vector2<f64>> {
    let p_cam = pose_cw.transform_point(point_world);
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    let (u, v) = camera.project(&p_cam)?;
    Some(Vector2::new(observed_uv.x - u, observed_uv.y - v))
}

/// Whitened squared error, `f64::INFINITY` behind the camera.
#[inline]
pub fn chi2(
    pose_cw: &SE3,
    point_world: &Vector3<f64>,
    observed_uv: &Vector2<f64>,
    inv_sigma2: f64,
    camera: &CameraModel,
) -> f64 {
    reprojection_error(pose_cw, point_world, observed_uv, camera)
        .map_or(f64::INFINITY, |e| e.norm_squared() * inv_sigma2)
}

/// Jacobians of the error with respect to the pose (columns
/// `[rot_x, rot_y, rot_z, trans_x, trans_y, trans_z]`) and the world point.
pub fn jacobians_cw(
    pose_cw: &SE3,
    point_world: &Vector3<f64>,
    camera: &CameraModel,
) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
    let p_cam = pose_cw.transform_point(point_world);
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    if z.abs() < MIN_DEPTH {
        return (Matrix2x6::zeros(), Matrix2x3::zeros());
    }
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let (fx, fy) = (camera.fx, camera.fy);

    let j_pose = Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    );

    let tmp = Matrix2x3::new(fx, 0.0, -fx * x * invz, 0.0, fy, -fy * y * invz);
    let j_point = -invz * tmp * pose_cw.rotation_matrix();

    (j_pose, j_point)
}

/// IRLS weight of the Huber kernel. `delta` is in whitened pixels.
#[inline]
pub fn huber_weight(chi2: f64, delta: f64) -> f64 {
    let e = chi2.sqrt();
    if e <= delta {
        1.0
    } else {
        delta / e
    }
}

/// Huber cost ρ(χ²) in g2o's convention.
#[inline]
pub fn huber_cost(chi2: f64, delta: f64) -> f64 {
    let e = chi2.sqrt();
    if e <= delta {
        chi2
    } else {
        2.0 * delta * e - delta * delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector6};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 390.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_pose_jacobian_numerical() {
        let cam = camera();
        let pose = SE3::from_quaternion(
            UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2),
            Vector3::new(0.1, -0.2, 0.3),
        );
        let point = Vector3::new(0.4, 0.3, 3.0);
        let uv = Vector2::new(300.0, 250.0);
        let (j_pose, j_point) = jacobians_cw(&pose, &point, &cam);

        let h = 1e-6;
        let e0 = reprojection_error(&pose, &point, &uv, &cam).unwrap();
        for k in 0..6 {
            let mut delta = Vector6::zeros();
            delta[k] = h;
            let e = reprojection_error(&pose.retract(&delta), &point, &uv, &cam).unwrap();
            let numeric = (e - e0) / h;
            assert_relative_eq!(numeric[0], j_pose[(0, k)], epsilon = 1e-3, max_relative = 1e-4);
            assert_relative_eq!(numeric[1], j_pose[(1, k)], epsilon = 1e-3, max_relative = 1e-4);
        }
        for k in 0..3 {
            let mut p = point;
            p[k] += h;
            let e = reprojection_error(&pose, &p, &uv, &cam).unwrap();
            let numeric = (e - e0) / h;
            assert_relative_eq!(numeric[0], j_point[(0, k)], epsilon = 1e-3, max_relative = 1e-4);
            assert_relative_eq!(numeric[1], j_point[(1, k)], epsilon = 1e-3, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_huber() {
        let delta = CHI2_MONO.sqrt();
        assert_eq!(huber_weight(1.0, delta), 1.0);
        assert!(huber_weight(100.0, delta) < 0.3);
        assert_relative_eq!(huber_cost(4.0, delta), 4.0);
        assert!(huber_cost(100.0, delta) < 100.0);
        assert!(chi2(&SE3::identity(), &Vector3::new(0.0, 0.0, -1.0), &Vector2::zeros(), 1.0, &camera()).is_infinite());
    }
}
