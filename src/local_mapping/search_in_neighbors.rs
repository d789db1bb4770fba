//! SearchInNeighbors - Map point fusion between covisible keyframes.
//!
//! Fuses duplicate map points between the current keyframe and its
//! neighbourhood:
//! 1. Collect neighbor keyframes (best covisibles + their best covisibles)
//! 2. Fuse current KF's map points into neighbors
//! 3. Fuse neighbors' map points into current KF
//! 4. Update affected points' descriptors and normals, then the connections

use std::collections::HashSet;

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::matcher::fuse;

/// Configuration for SearchInNeighbors.
#[derive(Debug, Clone)]
pub struct SearchInNeighborsConfig {
    /// Number of best covisible keyframes to collect.
    pub nn_covisibles: usize,
    /// Best covisibles taken from each first-order neighbor.
    pub nn_secondary: usize,
    /// Projection search radius, scaled by the predicted level.
    pub radius: f64,
}

impl Default for SearchInNeighborsConfig {
    fn default() -> Self {
        Self {
            nn_covisibles: 20,
            nn_secondary: 5,
            radius: 3.0,
        }
    }
}

/// Result of SearchInNeighbors operation.
#[derive(Debug, Default)]
pub struct SearchInNeighborsResult {
    pub num_neighbors: usize,
    /// Fusions and added observations, current → neighbors.
    pub fused_into_neighbors: usize,
    /// Fusions and added observations, neighbors → current.
    pub fused_into_current: usize,
}

/// Perform map point fusion between `current_kf_id` and its neighbors.
pub fn search_in_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    config: &SearchInNeighborsConfig,
) -> SearchInNeighborsResult {
    let mut result = SearchInNeighborsResult::default();

    // Phase 1: Collect neighbor keyframes
    let neighbor_ids = collect_neighbors(map, current_kf_id, config);
    result.num_neighbors = neighbor_ids.len();
    if neighbor_ids.is_empty() {
        return result;
    }

    // Phase 2: Fuse current KF's map points into neighbors
    let current_mp_ids = keyframe_points(map, current_kf_id);
    for &neighbor_id in &neighbor_ids {
        result.fused_into_neighbors += fuse(map, neighbor_id, &current_mp_ids, config.radius);
    }

    // Phase 3: Collect neighbors' map points and fuse into current KF
    let mut seen: HashSet<MapPointId> = current_mp_ids.iter().copied().collect();
    let mut neighbor_mp_ids = Vec::new();
    for &neighbor_id in &neighbor_ids {
        for mp_id in keyframe_points(map, neighbor_id) {
            if seen.insert(mp_id) {
                neighbor_mp_ids.push(mp_id);
            }
        }
    }
    result.fused_into_current = fuse(map, current_kf_id, &neighbor_mp_ids, config.radius);

    // Phase 4: Update the current KF's points and its connections
    for mp_id in keyframe_points(map, current_kf_id) {
        map.update_map_point_descriptor(mp_id);
        map.update_map_point_normal_and_depth(mp_id);
    }
    map.update_connections(current_kf_id);

    debug!(
        "[SearchInNeighbors] {}: neighbors={} fused out={} in={}",
        current_kf_id, result.num_neighbors, result.fused_into_neighbors, result.fused_into_current
    );
    result
}

fn keyframe_points(map: &Map, kf_id: KeyFrameId) -> Vec<MapPointId> {
    map.get_keyframe(kf_id)
        .map(|kf| kf.get_map_point_indices().map(|(_, id)| id).collect())
        .unwrap_or_default()
}

/// Best covisibles of the current keyframe plus their own best covisibles.
fn collect_neighbors(map: &Map, current_kf_id: KeyFrameId, config: &SearchInNeighborsConfig) -> Vec<KeyFrameId> {
    let Some(kf) = map.get_keyframe(current_kf_id) else {
        return Vec::new();
    };
    let first_neighbors: Vec<KeyFrameId> = kf
        .get_best_covisibles(config.nn_covisibles)
        .into_iter()
        .filter(|id| map.get_keyframe(*id).map_or(false, |k| !k.is_bad))
        .collect();

    let mut seen: HashSet<KeyFrameId> = first_neighbors.iter().copied().collect();
    seen.insert(current_kf_id);
    let mut neighbors = first_neighbors.clone();

    for neighbor_id in &first_neighbors {
        let Some(neighbor_kf) = map.get_keyframe(*neighbor_id) else {
            continue;
        };
        for secondary in neighbor_kf.get_best_covisibles(config.nn_secondary) {
            let usable = map.get_keyframe(secondary).map_or(false, |k| !k.is_bad);
            if usable && seen.insert(secondary) {
                neighbors.push(secondary);
            }
        }
    }
    neighbors
}
