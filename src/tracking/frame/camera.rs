//! Pinhole camera with Brown–Conrady distortion.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Iterations of the fixed-point undistortion.
const UNDISTORT_ITERATIONS: usize = 10;

/// Camera intrinsics. Distortion coefficients follow the OpenCV order
/// `(k1, k2, p1, p2, k3)` and default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
            width,
            height,
        }
    }

    /// Reject calibrations the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [self.fx, self.fy, self.cx, self.cy, self.k1, self.k2, self.p1, self.p2, self.k3]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(ConfigError::InvalidCalibration(
                "non-finite intrinsic parameter".into(),
            ));
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(ConfigError::InvalidCalibration(format!(
                "focal lengths must be positive (fx={}, fy={})",
                self.fx, self.fy
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidCalibration("image size is zero".into()));
        }
        if self.cx <= 0.0
            || self.cy <= 0.0
            || self.cx >= self.width as f64
            || self.cy >= self.height as f64
        {
            return Err(ConfigError::InvalidCalibration(format!(
                "principal point ({}, {}) outside {}x{} image",
                self.cx, self.cy, self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0 || self.k3 != 0.0
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-frame point. `None` behind the camera.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some((
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Normalized bearing `(x/z, y/z, 1)` of an undistorted pixel.
    #[inline]
    pub fn unproject(&self, u: f64, v: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) / self.fx, (v - self.cy) / self.fy, 1.0)
    }

    #[inline]
    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64
    }

    /// Apply the distortion model to a normalized point.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Distort an ideal pixel (used to synthesize observations).
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let (x, y) = ((u - self.cx) / self.fx, (v - self.cy) / self.fy);
        let (xd, yd) = self.distort_normalized(x, y);
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// Remove lens distortion from an observed pixel.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let xd = (u - self.cx) / self.fx;
        let yd = (v - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }
}

impl Default for CameraModel {
    /// EuRoC MAV `cam0` calibration.
    fn default() -> Self {
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            k1: -0.28340811,
            k2: 0.07395907,
            p1: 0.00019359,
            p2: 1.76187114e-05,
            k3: 0.0,
            width: 752,
            height: 480,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_unproject() {
        let cam = CameraModel::pinhole(400.0, 410.0, 320.0, 240.0, 640, 480);
        let p = Vector3::new(0.2, -0.1, 2.0);
        let (u, v) = cam.project(&p).unwrap();
        let bearing = cam.unproject(u, v);
        assert_relative_eq!(bearing * p.z, p, epsilon = 1e-12);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let mut cam = CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, 640, 480);
        cam.k1 = -0.28;
        cam.k2 = 0.07;
        cam.p1 = 0.0002;
        cam.p2 = -0.0001;
        let (ud, vd) = cam.distort_point(500.0, 100.0);
        let (u, v) = cam.undistort_point(ud, vd);
        assert_relative_eq!(u, 500.0, epsilon = 1e-3);
        assert_relative_eq!(v, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_validate_rejects_bad_calibration() {
        let good = CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, 320, 240);
        assert!(good.validate().is_ok());

        let mut bad = good;
        bad.fx = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.cx = 400.0;
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.fy = f64::NAN;
        assert!(bad.validate().is_err());
    }
}
