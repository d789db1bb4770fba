//! Nonlinear least-squares optimization.
//!
//! Implements Levenberg-Marquardt / Gauss-Newton optimization for:
//! - Pose-only optimization (tracking and relocalization)
//! - Local Bundle Adjustment (keyframe poses + map point positions)
//! - Global Bundle Adjustment (initial map)

pub mod bundle_adjustment;
pub mod edges;
pub mod pose_optimizer;

pub use bundle_adjustment::{
    apply_ba_results, collect_global_ba_data, collect_local_ba_data, global_bundle_adjustment,
    solve_ba, BAConfig, BAProblemData, BAResultData,
};
pub use edges::CHI2_MONO;
pub use pose_optimizer::{optimize_pose, optimize_pose_observations, PoseObservation, PoseOptimization};
