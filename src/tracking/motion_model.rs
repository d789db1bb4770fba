//! Velocity-based motion model for pose prediction.

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Predicts the next pose by applying the relative motion observed between
/// the previous two tracked frames.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    /// Previous pose (T_wc).
    prev_pose: Option<SE3>,
    /// Motion between the last two poses, expressed in the earlier camera
    /// frame: `prev⁻¹ · curr`.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the model with a new pose observation.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = &self.prev_pose {
            self.velocity = Some(prev.inverse().compose(pose));
        }
        self.prev_pose = Some(*pose);
    }

    /// Predict the next pose. `None` until two poses have been observed.
    pub fn predict(&self) -> Option<SE3> {
        let prev = self.prev_pose.as_ref()?;
        let velocity = self.velocity.as_ref()?;
        Some(prev.compose(velocity))
    }

    pub fn has_velocity(&self) -> bool {
        self.velocity.is_some()
    }

    /// Forget the velocity but keep the last pose (after relocalization).
    pub fn clear_velocity(&mut self) {
        self.velocity = None;
    }

    /// Reset the motion model.
    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.velocity = None;
    }
}
