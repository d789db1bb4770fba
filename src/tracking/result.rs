//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / NOT_INITIALIZED)
//! - pose estimate and the tracked map points, for the renderer
//! - correspondence counts and timing information

use nalgebra::{Matrix4, Vector3};

use crate::atlas::map::KeyFrameId;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    pub state: TrackingState,
    /// Camera-to-world transform (T_wc), present only when `state` is `Ok`.
    pub pose: Option<Matrix4<f64>>,
    /// World positions of the inlier map points of this frame.
    pub tracked_points: Vec<Vector3<f64>>,
    pub reference_kf_id: Option<KeyFrameId>,
    /// KeyFrame created from this frame, if any.
    pub new_keyframe: Option<KeyFrameId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

impl TrackingResult {
    pub fn new(state: TrackingState) -> Self {
        Self {
            state,
            pose: None,
            tracked_points: Vec::new(),
            reference_kf_id: None,
            new_keyframe: None,
            metrics: TrackingMetrics::default(),
            timing: TimingStats::default(),
        }
    }
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    /// Matches before pose optimization.
    pub n_matches: usize,
    pub n_inliers: usize,
    /// Whether this frame was recovered by the relocalizer.
    pub relocalized: bool,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub extract_ms: f64,
    pub track_ms: f64,
}
