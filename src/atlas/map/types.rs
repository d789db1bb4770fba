//! Core ID types for the Atlas map structures.

/// Unique identifier for a KeyFrame within a Map.
///
/// KeyFrameIds are assigned sequentially when KeyFrames are created.
/// They serve as lightweight handles for cross-referencing without
/// needing Arc/Rc, which simplifies ownership and avoids cyclic references.
/// Ordering follows creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}
