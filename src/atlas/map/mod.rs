//! The map: keyframes and map points in two id-keyed arenas.
//!
//! A [`KeyFrame`] lists, per feature index, the [`MapPoint`] it observes.
//! A map point lists, per observing keyframe, the feature index it was seen
//! at. [`Map`] is the only place these two lists are edited, so they never
//! disagree.
//!
//! Derived structure, rebuilt by [`Map::update_connections`]:
//! - covisibility weights (shared point count) between keyframes
//! - a spanning tree rooted at the origin keyframe
//!
//! Lifecycle rules:
//! - a point losing its last observation is erased
//! - a fused point forwards to its replacement until the forward is resolved
//! - the origin keyframe and keyframes flagged `not_erase` survive culling
//!
//! ```ignore
//! let mut map = Map::new();
//! let kf = map.create_keyframe(&frame);
//! let mp = map.create_map_point(position, descriptor, kf);
//! map.associate(kf, feature_idx, mp);
//! map.update_connections(kf);
//! ```

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::{KeyFrame, COVISIBILITY_THRESHOLD};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
