//! SO(3) helpers used by the SE3 exponential map and the optimizers.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Below this rotation angle the series expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// Left Jacobian J(ω) of SO(3), the `V` matrix of the SE(3) exponential.
///
/// ```text
/// J(ω) = I + (1 - cos θ)/θ² [ω]× + (θ - sin θ)/θ³ [ω]×²
/// ```
pub fn left_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let w = skew(omega);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * w;
    }

    let theta_sq = theta * theta;
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * w
        + ((theta - theta.sin()) / (theta_sq * theta)) * (w * w)
}

/// Inverse of the left Jacobian, used by the SE(3) logarithm.
pub fn left_jacobian_inv(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let w = skew(omega);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * w + (1.0 / 12.0) * (w * w);
    }

    let half = 0.5 * theta;
    let coeff = (1.0 - half * half.cos() / half.sin()) / (theta * theta);
    Matrix3::identity() - 0.5 * w + coeff * (w * w)
}
