//! KeyFrame insertion criteria.

use crate::system::config::TrackingConfig;

/// Decides whether the current frame should become a KeyFrame.
///
/// A KeyFrame is inserted when tracking has drifted into unmapped area
/// (tracked points below a fraction of the reference KeyFrame's) and either
/// enough frames passed while Local Mapping is idle, or the maximum gap
/// between KeyFrames was reached. Insertions while Local Mapping is busy are
/// queued and interrupt its bundle adjustment.
#[derive(Debug, Clone)]
pub struct KeyFrameDecision {
    /// Minimum frames between KeyFrames.
    min_frames: u64,
    /// Maximum frames between KeyFrames.
    max_frames: u64,
    /// Tracked/reference ratio below which a new KeyFrame is needed.
    tracked_ratio: f64,
}

/// Tracked points below which a KeyFrame is never worth inserting.
const MIN_TRACKED_FOR_KEYFRAME: usize = 15;

impl KeyFrameDecision {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            min_frames: config.kf_min_frames,
            max_frames: config.kf_max_frames,
            tracked_ratio: config.kf_tracked_ratio,
        }
    }

    /// # Arguments
    /// * `frames_since_kf` - Frames since the last KeyFrame was inserted
    /// * `frames_since_reloc` - Frames since the last relocalization
    /// * `num_keyframes` - KeyFrames in the map
    /// * `tracked_points` - Inlier map points of the current frame
    /// * `reference_points` - Points of the reference KeyFrame seen by ≥ 3 KeyFrames
    /// * `mapper_idle` - Whether Local Mapping is waiting for work
    pub fn should_create_keyframe(
        &self,
        frames_since_kf: u64,
        frames_since_reloc: u64,
        num_keyframes: usize,
        tracked_points: usize,
        reference_points: usize,
        mapper_idle: bool,
    ) -> bool {
        // Right after relocalization the pose is fragile.
        if frames_since_reloc < self.max_frames && num_keyframes as u64 > self.max_frames {
            return false;
        }

        let max_gap_reached = frames_since_kf >= self.max_frames;
        let idle_gap_reached = frames_since_kf >= self.min_frames && mapper_idle;
        let needs_coverage = (tracked_points as f64) < reference_points as f64 * self.tracked_ratio
            && tracked_points > MIN_TRACKED_FOR_KEYFRAME;

        (max_gap_reached || idle_gap_reached) && needs_coverage
    }
}
