//! Inter-thread message types.

use crossbeam_channel::Sender;

use crate::atlas::map::KeyFrameId;

/// Sent by Tracking once a keyframe has been inserted into the map with its
/// tracked map points associated. Local Mapping finishes the insertion.
#[derive(Debug, Clone, Copy)]
pub struct NewKeyFrameMsg {
    pub keyframe_id: KeyFrameId,
}

/// Work items for the Local Mapping thread, processed in order.
#[derive(Debug)]
pub enum MapperMessage {
    KeyFrame(NewKeyFrameMsg),
    /// Drop all mapper state and clear the atlas, then acknowledge. Queued
    /// keyframes ahead of the reset are processed against the old map.
    Reset(Sender<()>),
}
