//! Rigid-body transform in SE(3).
//!
//! Poses are stored as T_wc (camera-to-world) throughout the map. The
//! optimizers work on T_cw and convert at their boundaries.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// A rigid transform: `p' = R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_quaternion(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Build from a rotation matrix. The matrix is re-orthonormalized.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Build from a homogeneous 4×4 matrix (top 3×4 block used).
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t: Vector3<f64> = m.fixed_view::<3, 1>(0, 3).into_owned();
        Self::from_rt(r, t)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map. `xi = [ω, υ]` (rotation first, g2o ordering).
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let upsilon = Vector3::new(xi[3], xi[4], xi[5]);
        Self {
            rotation: so3::exp(&omega),
            translation: so3::left_jacobian(&omega) * upsilon,
        }
    }

    /// Logarithm, inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        let upsilon = so3::left_jacobian_inv(&omega) * self.translation;
        Vector6::new(omega.x, omega.y, omega.z, upsilon.x, upsilon.y, upsilon.z)
    }

    /// Left-multiplicative update `exp(delta) * self`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        Self::exp(delta).compose(self)
    }
}
