//! Atlas - the session's map plus its place-recognition database.
//!
//! Tracking and Local Mapping share one `Atlas` behind a lock; every
//! structural change to the map and the keyframe database happens through it
//! so that both stay in step.

use crate::atlas::map::{KeyFrameId, Map};

use super::keyframe_db::KeyFrameDatabase;

pub struct Atlas {
    map: Map,
    /// Place-recognition index over the map's KeyFrames.
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    pub fn new() -> Self {
        Self {
            map: Map::new(),
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    /// Wrap a map built elsewhere (e.g. loaded from disk) and index its KeyFrames.
    pub fn from_map(map: Map) -> Self {
        let mut atlas = Self {
            map,
            keyframe_db: KeyFrameDatabase::new(),
        };
        atlas.rebuild_keyframe_db();
        atlas
    }

    pub fn active_map(&self) -> &Map {
        &self.map
    }

    pub fn active_map_mut(&mut self) -> &mut Map {
        &mut self.map
    }

    /// Register a KeyFrame's BoW vector with the database.
    pub fn index_keyframe(&mut self, kf_id: KeyFrameId) {
        if let Some(bow) = self.map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector.as_ref()) {
            self.keyframe_db.add(kf_id, bow);
        }
    }

    /// Erase a KeyFrame from both the map and the database.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        let bow = self
            .map
            .get_keyframe(kf_id)
            .and_then(|kf| kf.bow_vector.clone());
        if !self.map.erase_keyframe(kf_id) {
            return false;
        }
        if let Some(bow) = bow {
            self.keyframe_db.erase(kf_id, &bow);
        }
        true
    }

    pub fn rebuild_keyframe_db(&mut self) {
        self.keyframe_db.clear();
        for kf in self.map.keyframes() {
            if let Some(bow) = &kf.bow_vector {
                self.keyframe_db.add(kf.id, bow);
            }
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.keyframe_db.clear();
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}
