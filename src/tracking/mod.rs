//! Tracking: turns each incoming image into a camera pose.
//!
//! This module implements the TRACKING component of ORB-SLAM:
//! - Frame processing (ORB extraction, undistortion)
//! - Two-view map initialization
//! - Initial pose estimation (motion model or BoW against the reference keyframe)
//! - Track local map (projection-based search)
//! - New KeyFrame decision
//! - Relocalization while lost

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod matcher;
pub mod motion_model;
pub mod relocalizer;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;

pub use result::TrackingResult;
pub use state::TrackingState;
pub use tracker::Tracker;
pub use tracking_frame::Frame;
