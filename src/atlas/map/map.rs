//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility relationships between KeyFrames
//!
//! Every mutation keeps both sides of the KF ↔ MP graph in step. A MapPoint
//! left without observations is erased on the spot, so the arena never holds
//! bad points.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use nalgebra::Vector3;
use tracing::debug;

use crate::features::Descriptor;
use crate::tracking::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    /// Keyed by id, so iteration follows insertion order.
    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    map_points: BTreeMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// First KeyFrame of the map (spanning tree root, never culled).
    origin_kf_id: Option<KeyFrameId>,

    /// Fused MapPoints: erased id → surviving id.
    replaced: HashMap<MapPointId, MapPointId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: BTreeMap::new(),
            map_points: BTreeMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            origin_kf_id: None,
            replaced: HashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    /// Promote a Frame to a KeyFrame. Map-point associations are not copied.
    pub fn create_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let id = self.next_keyframe_id();
        self.add_keyframe(KeyFrame::from_frame(id, frame));
        id
    }

    /// Add an existing KeyFrame to the map.
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        if self.origin_kf_id.is_none() {
            self.origin_kf_id = Some(kf.id);
        }
        self.keyframes.insert(kf.id, kf);
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    /// KeyFrames in insertion order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn origin_kf_id(&self) -> Option<KeyFrameId> {
        self.origin_kf_id
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.keyframes.keys().next_back().copied()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = self.next_map_point_id();
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    /// Add an existing MapPoint to the map.
    pub fn add_map_point(&mut self, mp: MapPoint) {
        if mp.id.0 >= self.next_mp_id {
            self.next_mp_id = mp.id.0 + 1;
        }
        self.map_points.insert(mp.id, mp);
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_point_ids(&self) -> impl Iterator<Item = &MapPointId> {
        self.map_points.keys()
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow fusion replacements to the surviving MapPoint.
    pub fn resolve(&self, mut id: MapPointId) -> Option<MapPointId> {
        for _ in 0..16 {
            if self.map_points.contains_key(&id) {
                return Some(id);
            }
            id = *self.replaced.get(&id)?;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// This:
    /// 1. Links the KeyFrame's feature to the MapPoint
    /// 2. Adds an observation in the MapPoint
    /// 3. Updates covisibility with other KeyFrames observing this MapPoint
    ///
    /// Returns false if either side is missing or the KeyFrame already
    /// observes the point (in which case nothing changes).
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() {
            return false;
        }
        let previous = kf.get_map_point(feature_idx);
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        if mp.is_observed_by(kf_id) {
            return false;
        }

        if let Some(prev_mp) = previous {
            self.disassociate(kf_id, feature_idx);
            debug!("[Map] {} slot {} reassigned from {} to {}", kf_id, feature_idx, prev_mp, mp_id);
        }

        let existing_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                let observers = mp.observations.keys().copied().collect();
                mp.add_observation(kf_id, feature_idx);
                observers
            }
            None => return false,
        };
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            self.add_covisibility_weight(kf_id, other_kf_id, 1);
        }
        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint.
    ///
    /// Reassigns the point's reference KeyFrame if it was `kf_id`, and erases
    /// the point if this was its last observation.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;

        let remaining: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observations.keys().copied().collect()
            }
            None => return Some(mp_id),
        };

        if remaining.is_empty() {
            self.map_points.remove(&mp_id);
            return Some(mp_id);
        }

        let needs_new_ref = self
            .map_points
            .get(&mp_id)
            .map_or(false, |mp| mp.ref_kf_id == kf_id);
        if needs_new_ref {
            let new_ref = self.best_covisible_among(kf_id, &remaining);
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.ref_kf_id = new_ref;
            }
        }

        for other_kf_id in remaining {
            self.add_covisibility_weight(kf_id, other_kf_id, -1);
        }
        Some(mp_id)
    }

    /// The candidate sharing the most covisibility weight with `kf_id`.
    /// Ties go to the oldest candidate. `candidates` must not be empty.
    fn best_covisible_among(&self, kf_id: KeyFrameId, candidates: &[KeyFrameId]) -> KeyFrameId {
        match self.keyframes.get(&kf_id) {
            Some(kf) => best_by_weight(kf.covisibility_weights(), candidates),
            None => candidates[0],
        }
    }

    fn add_covisibility_weight(&mut self, a: KeyFrameId, b: KeyFrameId, delta: i64) {
        if a == b {
            return;
        }
        let current = self
            .keyframes
            .get(&a)
            .map_or(0, |kf| kf.get_covisibility_weight(b)) as i64;
        let new_weight = (current + delta).max(0) as usize;
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.set_covisibility(b, new_weight);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.set_covisibility(a, new_weight);
        }
    }

    /// Recompute a KeyFrame's covisibility from its MapPoints and link it
    /// into the spanning tree if it has no parent yet.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            if let Some(mp) = self.map_points.get(&mp_id) {
                for &obs_kf in mp.observations.keys() {
                    if obs_kf != kf_id {
                        *counter.entry(obs_kf).or_insert(0) += 1;
                    }
                }
            }
        }

        let stale: Vec<KeyFrameId> = kf
            .covisibility_weights()
            .keys()
            .filter(|id| !counter.contains_key(id))
            .copied()
            .collect();
        for other in stale {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        for (&other, &w) in &counter {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility(kf_id, w);
            }
        }

        let is_origin = self.origin_kf_id == Some(kf_id);
        let best = {
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                return;
            };
            let parent = if kf.parent_id.is_none() && !is_origin {
                // Only older KeyFrames qualify, which keeps the tree acyclic.
                let older: Vec<KeyFrameId> =
                    counter.keys().filter(|id| **id < kf_id).copied().collect();
                (!older.is_empty()).then(|| best_by_weight(&counter, &older))
            } else {
                None
            };
            kf.replace_covisibility(counter);
            parent
        };
        if let Some(parent) = best {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_parent(parent);
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.add_child(kf_id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Erasure and fusion
    // ─────────────────────────────────────────────────────────────────────────

    /// Erase a MapPoint and every observation of it.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&mp_id) {
            Some(mp) => mp.observations.iter().map(|(k, i)| (*k, *i)).collect(),
            None => return,
        };

        for (i, &(kf_a, idx)) in observations.iter().enumerate() {
            if let Some(kf) = self.keyframes.get_mut(&kf_a) {
                kf.erase_map_point(idx);
            }
            for &(kf_b, _) in &observations[i + 1..] {
                self.add_covisibility_weight(kf_a, kf_b, -1);
            }
        }
        self.map_points.remove(&mp_id);
    }

    /// Erase a KeyFrame, repairing every reference to it.
    ///
    /// - Each of its MapPoints loses the observation. Points citing it as
    ///   reference move to the remaining observer with the most covisibility
    ///   weight with the erased KeyFrame. Points left without observations
    ///   are erased.
    /// - Children are reparented, each to the candidate (former parent or an
    ///   already reparented sibling) it shares the most points with.
    ///
    /// The origin KeyFrame and KeyFrames flagged `not_erase` are kept; the
    /// return value tells whether the KeyFrame was erased.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return false;
        };
        if kf.not_erase || self.origin_kf_id == Some(kf_id) {
            return false;
        }

        let weights = kf.covisibility_weights().clone();
        let slots: Vec<(usize, MapPointId)> = kf.get_map_point_indices().collect();

        // Reassign references while the original weights are still known.
        for &(_, mp_id) in &slots {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                if mp.ref_kf_id != kf_id {
                    continue;
                }
                let others: Vec<KeyFrameId> =
                    mp.observations.keys().filter(|id| **id != kf_id).copied().collect();
                if !others.is_empty() {
                    mp.ref_kf_id = best_by_weight(&weights, &others);
                }
            }
        }

        for (idx, _) in slots {
            self.disassociate(kf_id, idx);
        }

        let (parent, children, covisibles) = match self.keyframes.get(&kf_id) {
            Some(kf) => (
                kf.parent_id,
                kf.children_ids.iter().copied().collect::<Vec<_>>(),
                kf.covisibility_weights().keys().copied().collect::<Vec<_>>(),
            ),
            None => return false,
        };
        for other in covisibles {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }

        if let Some(parent) = parent {
            self.reparent_children(kf_id, parent, children);
        }

        self.keyframes.remove(&kf_id);
        debug!("[Map] erased {}", kf_id);
        true
    }

    fn reparent_children(&mut self, erased: KeyFrameId, parent: KeyFrameId, children: Vec<KeyFrameId>) {
        let mut candidates: BTreeSet<KeyFrameId> = BTreeSet::new();
        candidates.insert(parent);
        let mut pending: BTreeSet<KeyFrameId> = children.into_iter().collect();

        while !pending.is_empty() {
            let mut best: Option<(KeyFrameId, KeyFrameId, usize)> = None;
            for &child in &pending {
                let Some(child_kf) = self.keyframes.get(&child) else {
                    continue;
                };
                for &cand in &candidates {
                    let w = child_kf.get_covisibility_weight(cand);
                    if w > 0 && best.map_or(true, |(_, _, bw)| w > bw) {
                        best = Some((child, cand, w));
                    }
                }
            }
            let Some((child, new_parent, _)) = best else {
                break;
            };
            self.link_parent(child, new_parent);
            pending.remove(&child);
            candidates.insert(child);
        }

        // No covisibility with any candidate: attach to the former parent.
        for child in pending {
            self.link_parent(child, parent);
        }

        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.erase_child(erased);
        }
    }

    fn link_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if let Some(child_kf) = self.keyframes.get_mut(&child) {
            child_kf.set_parent(parent);
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(child);
        }
    }

    /// Fuse `old` into `new`: every observer of `old` now observes `new`
    /// (or keeps its existing observation of `new`), and `old` is erased.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new {
            return;
        }
        let (observations, visible, found) = match self.map_points.get(&old) {
            Some(mp) => (
                mp.observations.iter().map(|(k, i)| (*k, *i)).collect::<Vec<_>>(),
                mp.visible_count,
                mp.found_count,
            ),
            None => return,
        };
        if !self.map_points.contains_key(&new) {
            return;
        }

        self.erase_map_point(old);
        for (kf_id, idx) in observations {
            let already = self
                .map_points
                .get(&new)
                .map_or(true, |mp| mp.is_observed_by(kf_id));
            if !already {
                self.associate(kf_id, idx, new);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
        self.replaced.insert(old, new);
        self.update_map_point_descriptor(new);
        self.update_map_point_normal_and_depth(new);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint statistics
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute normal and scale bounds from the observers and the reference KeyFrame.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|id| self.keyframes.get(id).map(|kf| kf.camera_center()))
            .collect();
        let ref_kf = self
            .keyframes
            .get(&mp.ref_kf_id)
            .filter(|kf| mp.is_observed_by(kf.id))
            .or_else(|| {
                mp.observations
                    .keys()
                    .next()
                    .and_then(|id| self.keyframes.get(id))
            });
        let Some(ref_kf) = ref_kf else {
            return;
        };
        let Some(&ref_idx) = mp.observations.get(&ref_kf.id) else {
            return;
        };
        let ref_center = ref_kf.camera_center();
        let ref_level = ref_kf.keypoints[ref_idx].octave;
        let pyramid = ref_kf.pyramid.clone();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.into_iter(), &ref_center, ref_level, &pyramid);
        }
    }

    /// Recompute the representative descriptor from all observations.
    pub fn update_map_point_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let observed: Vec<Descriptor> = mp
            .observations
            .iter()
            .filter_map(|(kf_id, &idx)| {
                self.keyframes
                    .get(kf_id)
                    .and_then(|kf| kf.descriptors.get(idx).copied())
            })
            .collect();
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.compute_distinctive_descriptor(&observed);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The N best connected KeyFrames around a given KeyFrame.
    pub fn get_local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    /// Number of a KeyFrame's MapPoints observed by at least `min_obs` KeyFrames.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.get_map_point_indices()
            .filter(|(_, mp_id)| {
                self.map_points
                    .get(mp_id)
                    .map_or(false, |mp| mp.num_observations() >= min_obs)
            })
            .count()
    }

    /// All MapPoints observed by a set of KeyFrames.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get(kf_id) {
                for (_, mp_id) in kf.get_map_point_indices() {
                    if seen.insert(mp_id) {
                        out.push(mp_id);
                    }
                }
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify the graph invariants. Returns one message per violation.
    pub fn check_consistency(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for mp in self.map_points.values() {
            if mp.observations.is_empty() || mp.is_bad {
                problems.push(format!("{} has no observations or is bad", mp.id));
            }
            if !mp.observations.is_empty() && !mp.is_observed_by(mp.ref_kf_id) {
                problems.push(format!("{} reference {} does not observe it", mp.id, mp.ref_kf_id));
            }
            for (kf_id, &idx) in &mp.observations {
                match self.keyframes.get(kf_id) {
                    None => problems.push(format!("{} observed by missing {}", mp.id, kf_id)),
                    Some(kf) if kf.get_map_point(idx) != Some(mp.id) => {
                        problems.push(format!("{} slot {} does not point back to {}", kf_id, idx, mp.id))
                    }
                    _ => {}
                }
            }
        }

        for kf in self.keyframes.values() {
            let mut expected: HashMap<KeyFrameId, usize> = HashMap::new();
            for (idx, mp_id) in kf.get_map_point_indices() {
                match self.map_points.get(&mp_id) {
                    None => problems.push(format!("{} slot {} cites missing {}", kf.id, idx, mp_id)),
                    Some(mp) => {
                        if mp.observations.get(&kf.id) != Some(&idx) {
                            problems.push(format!("{} not registered on {} slot {}", mp_id, kf.id, idx));
                        }
                        for &other in mp.observations.keys() {
                            if other != kf.id {
                                *expected.entry(other).or_insert(0) += 1;
                            }
                        }
                    }
                }
            }
            if &expected != kf.covisibility_weights() {
                problems.push(format!("{} covisibility weights out of date", kf.id));
            }
            if let Some(parent) = kf.parent_id {
                if !self.keyframes.contains_key(&parent) {
                    problems.push(format!("{} has missing parent {}", kf.id, parent));
                }
            }
        }

        problems
    }

    /// Scale all positions with respect to the world origin.
    pub fn normalize_scale(&mut self, scale: f64) {
        for kf in self.keyframes.values_mut() {
            kf.pose.translation *= scale;
        }
        for mp in self.map_points.values_mut() {
            mp.position *= scale;
            mp.min_distance *= scale;
            mp.max_distance *= scale;
        }
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.replaced.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.origin_kf_id = None;
    }
}

/// Highest weight among `candidates`, ties to the smallest id.
fn best_by_weight(weights: &HashMap<KeyFrameId, usize>, candidates: &[KeyFrameId]) -> KeyFrameId {
    let mut sorted = candidates.to_vec();
    sorted.sort();
    let mut best = sorted[0];
    let mut best_w = weights.get(&best).copied().unwrap_or(0);
    for c in &sorted[1..] {
        let w = weights.get(c).copied().unwrap_or(0);
        if w > best_w {
            best = *c;
            best_w = w;
        }
    }
    best
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::test_support::test_camera;

    fn add_kf(map: &mut Map, id: u64, num_features: usize) -> KeyFrameId {
        let keypoints = (0..num_features)
            .map(|i| KeyPoint::new(20.0 + i as f32, 30.0, 0))
            .collect();
        let kf = KeyFrame::new(
            KeyFrameId::new(id),
            id,
            id as f64,
            SE3::from_quaternion(Default::default(), Vector3::new(id as f64 * 0.1, 0.0, 0.0)),
            keypoints,
            vec![Descriptor::zeros(); num_features],
            test_camera(),
            ScalePyramid::new(1.2, 8),
        );
        map.add_keyframe(kf);
        KeyFrameId::new(id)
    }

    fn point(map: &mut Map, kf: KeyFrameId) -> MapPointId {
        map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::zeros(), kf)
    }

    #[test]
    fn test_associate() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 0, 10);
        let kf2 = add_kf(&mut map, 1, 10);
        let mp_id = point(&mut map, kf1);

        assert!(map.associate(kf1, 0, mp_id));
        assert!(map.associate(kf2, 3, mp_id));
        // Second association from the same KeyFrame is refused.
        assert!(!map.associate(kf2, 4, mp_id));

        let mp = map.get_map_point(mp_id).unwrap();
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&kf2), Some(&3));
        assert_eq!(map.get_keyframe(kf2).unwrap().get_map_point(4), None);

        assert_eq!(map.get_keyframe(kf1).unwrap().get_covisibility_weight(kf2), 1);
        assert_eq!(map.get_keyframe(kf2).unwrap().get_covisibility_weight(kf1), 1);
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_disassociate_last_observation_erases_point() {
        let mut map = Map::new();
        let kf1 = add_kf(&mut map, 0, 10);
        let kf2 = add_kf(&mut map, 1, 10);
        let mp_id = point(&mut map, kf1);
        map.associate(kf1, 0, mp_id);
        map.associate(kf2, 0, mp_id);

        assert_eq!(map.disassociate(kf1, 0), Some(mp_id));
        let mp = map.get_map_point(mp_id).unwrap();
        assert_eq!(mp.num_observations(), 1);
        // Reference moved to the remaining observer.
        assert_eq!(mp.ref_kf_id, kf2);
        assert_eq!(map.get_keyframe(kf1).unwrap().get_covisibility_weight(kf2), 0);

        assert_eq!(map.disassociate(kf2, 0), Some(mp_id));
        assert!(map.get_map_point(mp_id).is_none());
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_erase_keyframe_reassigns_reference_by_covisibility() {
        let mut map = Map::new();
        let kf0 = add_kf(&mut map, 0, 40);
        let kf1 = add_kf(&mut map, 1, 40);
        let kf2 = add_kf(&mut map, 2, 40);
        let kf3 = add_kf(&mut map, 3, 40);

        // kf1 shares 20 points with kf3 and 2 with kf2.
        for i in 0..20 {
            let mp = point(&mut map, kf1);
            map.associate(kf1, i, mp);
            map.associate(kf3, i, mp);
        }
        let shared = point(&mut map, kf1);
        map.associate(kf1, 30, shared);
        map.associate(kf2, 30, shared);
        map.associate(kf3, 30, shared);
        let other = point(&mut map, kf1);
        map.associate(kf1, 31, other);
        map.associate(kf2, 31, other);
        // Anchor kf0 so it is a regular neighbour.
        let anchor = point(&mut map, kf0);
        map.associate(kf0, 0, anchor);
        map.associate(kf1, 35, anchor);
        map.update_connections(kf1);
        map.update_connections(kf2);
        map.update_connections(kf3);

        let only_here = point(&mut map, kf1);
        map.associate(kf1, 39, only_here);

        assert!(map.erase_keyframe(kf1));
        assert!(map.get_keyframe(kf1).is_none());
        // Observed by kf2 and kf3: kf3 shares more with kf1.
        assert_eq!(map.get_map_point(shared).unwrap().ref_kf_id, kf3);
        assert_eq!(map.get_map_point(other).unwrap().ref_kf_id, kf2);
        assert!(map.get_map_point(only_here).is_none());
        assert!(map.check_consistency().is_empty(), "{:?}", map.check_consistency());

        // Nobody is left pointing at the erased KeyFrame.
        for kf in map.keyframes() {
            assert_ne!(kf.parent_id, Some(kf1));
            assert!(!kf.children_ids.contains(&kf1));
        }
    }

    #[test]
    fn test_origin_and_protected_keyframes_are_kept() {
        let mut map = Map::new();
        let kf0 = add_kf(&mut map, 0, 5);
        let kf1 = add_kf(&mut map, 1, 5);
        assert!(!map.erase_keyframe(kf0));
        map.get_keyframe_mut(kf1).unwrap().not_erase = true;
        assert!(!map.erase_keyframe(kf1));
        assert_eq!(map.num_keyframes(), 2);
    }

    #[test]
    fn test_replace_map_point_merges_observations() {
        let mut map = Map::new();
        let kf0 = add_kf(&mut map, 0, 10);
        let kf1 = add_kf(&mut map, 1, 10);
        let kf2 = add_kf(&mut map, 2, 10);

        let keep = point(&mut map, kf0);
        map.associate(kf0, 0, keep);
        map.associate(kf1, 0, keep);
        let dup = point(&mut map, kf1);
        map.associate(kf1, 5, dup);
        map.associate(kf2, 5, dup);

        map.replace_map_point(dup, keep);
        assert!(map.get_map_point(dup).is_none());
        assert_eq!(map.resolve(dup), Some(keep));

        let mp = map.get_map_point(keep).unwrap();
        assert_eq!(mp.num_observations(), 3);
        assert_eq!(mp.observations.get(&kf2), Some(&5));
        // kf1 already observed `keep` at slot 0, its duplicate slot is cleared.
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(5), None);
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_update_connections_sets_parent() {
        let mut map = Map::new();
        let kf0 = add_kf(&mut map, 0, 30);
        let kf1 = add_kf(&mut map, 1, 30);
        for i in 0..20 {
            let mp = point(&mut map, kf0);
            map.associate(kf0, i, mp);
            map.associate(kf1, i, mp);
        }
        map.update_connections(kf1);
        assert_eq!(map.get_keyframe(kf1).unwrap().parent_id, Some(kf0));
        assert!(map.get_keyframe(kf0).unwrap().children_ids.contains(&kf1));
        assert_eq!(map.get_local_keyframes(kf0, 5), vec![kf1]);
        assert_eq!(map.tracked_map_points(kf0, 2), 20);
        assert_eq!(map.tracked_map_points(kf0, 3), 0);
    }

    #[test]
    fn test_normalize_scale() {
        let mut map = Map::new();
        let kf0 = add_kf(&mut map, 0, 2);
        let kf1 = add_kf(&mut map, 1, 2);
        let mp = point(&mut map, kf0);
        map.associate(kf0, 0, mp);
        map.associate(kf1, 0, mp);
        map.normalize_scale(0.5);
        assert!((map.get_keyframe(kf1).unwrap().pose.translation.x - 0.05).abs() < 1e-12);
        assert!((map.get_map_point(mp).unwrap().position.z - 2.5).abs() < 1e-12);
    }
}
