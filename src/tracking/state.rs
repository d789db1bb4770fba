//! Tracking state machine.

use std::fmt;

/// State of the tracking thread, reported with every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No map yet; waiting for two frames with enough parallax.
    #[default]
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Tracking failed; every new frame goes to the relocalizer.
    Lost,
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackingState::NotInitialized => "NOT_INITIALIZED",
            TrackingState::Ok => "OK",
            TrackingState::Lost => "LOST",
        };
        f.write_str(s)
    }
}
