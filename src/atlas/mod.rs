//! Atlas module - SLAM map data structures.
//!
//! - [`map::KeyFrame`] - KeyFrames with covisibility and spanning tree
//! - [`map::MapPoint`] - 3D landmarks with observation tracking
//! - [`map::Map`] - Container with association, erasure and fusion
//! - [`keyframe_db::KeyFrameDatabase`] - inverted index for relocalization

pub mod atlas;
pub mod keyframe_db;
pub mod map;

pub use atlas::Atlas;
pub use keyframe_db::KeyFrameDatabase;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
