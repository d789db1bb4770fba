//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes inserted by Tracking:
//! 1. Refreshes the statistics of the points the keyframe tracked
//! 2. Culls recently created map points that are not being re-observed
//! 3. Triangulates new map points with covisible keyframes
//! 4. Fuses duplicates with the neighbourhood
//! 5. Local BA (Levenberg-Marquardt, interruptible)
//! 6. Keyframe culling (removes redundant keyframes)

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::optimizer::{apply_ba_results, collect_local_ba_data, solve_ba, BAConfig};
use crate::system::config::LocalMappingConfig;
use crate::system::messages::{MapperMessage, NewKeyFrameMsg};
use crate::system::shared_state::SharedState;

use super::search_in_neighbors::{search_in_neighbors, SearchInNeighborsConfig};
use super::triangulation::{create_new_map_points, TriangulationConfig};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Keyframes after creation during which a point must gather observations.
const MIN_OBSERVATION_AGE: u64 = 2;
/// A point with this few observations after [`MIN_OBSERVATION_AGE`] is culled.
const MAX_WEAK_OBSERVATIONS: usize = 2;
/// Keyframes after which a point leaves the recent list for good.
const RECENT_WINDOW: u64 = 3;

/// Local Mapping thread state.
pub struct LocalMapper {
    config: LocalMappingConfig,
    /// Points created by triangulation that have not yet passed culling.
    recent_points: Vec<MapPointId>,
}

impl LocalMapper {
    pub fn new(config: LocalMappingConfig) -> Self {
        Self {
            config,
            recent_points: Vec::new(),
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, receiver: Receiver<MapperMessage>, shared: Arc<SharedState>) {
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(MapperMessage::KeyFrame(msg)) => {
                    shared.set_mapper_idle(false);
                    self.process_keyframe(msg, &receiver, &shared);
                }
                Ok(MapperMessage::Reset(ack)) => {
                    self.reset(&shared);
                    // The requester may have given up waiting.
                    let _ = ack.send(());
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if receiver.is_empty() {
                shared.set_mapper_idle(true);
            }
        }
        debug!("[LocalMapping] thread finished");
    }

    /// Drop all mapping state along with the map itself.
    fn reset(&mut self, shared: &SharedState) {
        self.recent_points.clear();
        shared.atlas.write().clear();
        shared.clear_abort_ba();
        info!("[LocalMapping] map reset");
    }

    /// Process a single keyframe message.
    fn process_keyframe(&mut self, msg: NewKeyFrameMsg, receiver: &Receiver<MapperMessage>, shared: &SharedState) {
        shared.clear_abort_ba();
        let kf_id = msg.keyframe_id;

        {
            let mut atlas = shared.atlas.write();
            let map = atlas.active_map_mut();
            if map.get_keyframe(kf_id).map_or(true, |kf| kf.is_bad) {
                // Erased by a reset that overtook this message.
                return;
            }

            // Step 1: Refresh the points tracked by the new keyframe
            update_tracked_points(map, kf_id);

            // Step 2: Cull recent map points
            self.map_point_culling(map, kf_id);

            // Step 3: Triangulate new map points
            let triangulation = TriangulationConfig {
                num_neighbors: self.config.triangulation_neighbors,
                ..TriangulationConfig::default()
            };
            let created = create_new_map_points(map, kf_id, &triangulation);
            self.recent_points.extend(created.new_points);

            // Step 4: Fuse duplicates with the neighbourhood
            if receiver.is_empty() {
                let fusion = SearchInNeighborsConfig {
                    nn_covisibles: self.config.fusion_neighbors,
                    ..SearchInNeighborsConfig::default()
                };
                search_in_neighbors(map, kf_id, &fusion);
            }
        }

        // Tracking already queued more work: skip the optimization for now.
        if !receiver.is_empty() || shared.should_abort_ba() {
            return;
        }

        // Step 5: Local Bundle Adjustment
        let num_keyframes = shared.atlas.read().active_map().num_keyframes();
        if num_keyframes > 2 {
            self.local_bundle_adjustment(kf_id, shared);
        }

        // Step 6: Cull redundant keyframes
        let mut atlas = shared.atlas.write();
        self.keyframe_culling(&mut atlas, kf_id);
    }

    /// Local Bundle Adjustment using three-phase locking.
    ///
    /// 1. **COLLECT**: read lock to extract a data snapshot
    /// 2. **SOLVE**: no lock, LM on the snapshot
    /// 3. **APPLY**: write lock to write results back
    ///
    /// The solver checks `shared.should_abort_ba()` between iterations and
    /// exits early when Tracking inserts a new keyframe.
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId, shared: &SharedState) {
        let should_stop = || shared.should_abort_ba();
        let config = BAConfig {
            max_iterations: self.config.ba_max_iterations,
            ..BAConfig::default()
        };

        // PHASE 1: COLLECT (read lock)
        let problem = {
            let atlas = shared.atlas.read();
            match collect_local_ba_data(atlas.active_map(), kf_id) {
                Some(p) => p,
                None => return,
            }
        };

        // PHASE 2: SOLVE (no lock held)
        let Some(result) = solve_ba(&problem, &config, &should_stop) else {
            return;
        };

        // PHASE 3: APPLY (write lock)
        if result.iterations > 0 {
            let mut atlas = shared.atlas.write();
            let removed = apply_ba_results(atlas.active_map_mut(), &result);
            debug!(
                "[LocalBA] {} iters={} cost {:.3} -> {:.3} ({} outliers, aborted={})",
                kf_id, result.iterations, result.initial_cost, result.final_cost, removed, result.aborted
            );
        }
    }

    /// Cull recently created map points.
    ///
    /// A recent point is removed when:
    /// - it was found in less than `min_found_ratio` of the frames that
    ///   should have seen it, or
    /// - two keyframes have passed since its creation and it still has at
    ///   most two observations.
    ///
    /// Points surviving three keyframes leave the recent list.
    fn map_point_culling(&mut self, map: &mut Map, current_kf_id: KeyFrameId) {
        let min_found_ratio = self.config.min_found_ratio;
        let mut culled = 0;
        let mut kept = Vec::with_capacity(self.recent_points.len());

        for mp_id in std::mem::take(&mut self.recent_points) {
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            let age = current_kf_id.0.saturating_sub(mp.first_kf_id.0);

            if mp.found_ratio() < min_found_ratio
                || (age >= MIN_OBSERVATION_AGE && mp.num_observations() <= MAX_WEAK_OBSERVATIONS)
            {
                map.erase_map_point(mp_id);
                culled += 1;
            } else if age < RECENT_WINDOW {
                kept.push(mp_id);
            }
        }
        self.recent_points = kept;

        if culled > 0 {
            debug!(
                "[MapCulling] Removed {} recent map points (remaining: {})",
                culled,
                map.num_map_points()
            );
        }
    }

    /// Cull redundant keyframes.
    ///
    /// A covisible keyframe of `current_kf_id` is removed when more than
    /// `kf_redundancy_ratio` of its map points are seen by at least
    /// `redundant_observers` other keyframes at the same or a finer scale.
    /// The origin keyframe and keyframes flagged `not_erase` are kept.
    fn keyframe_culling(&self, atlas: &mut Atlas, current_kf_id: KeyFrameId) {
        let candidates: Vec<KeyFrameId> = {
            let map = atlas.active_map();
            let Some(current) = map.get_keyframe(current_kf_id) else {
                return;
            };
            current
                .ordered_connections()
                .into_iter()
                .map(|(id, _)| id)
                .filter(|&kf_id| map.origin_kf_id() != Some(kf_id))
                .collect()
        };

        // One at a time: every erasure lowers the redundancy of the rest.
        let mut num_culled = 0;
        for kf_id in candidates {
            if self.is_redundant(atlas.active_map(), kf_id) && atlas.erase_keyframe(kf_id) {
                num_culled += 1;
            }
        }

        if num_culled > 0 {
            info!(
                "[KFCulling] Removed {} redundant keyframes (remaining: {})",
                num_culled,
                atlas.active_map().num_keyframes()
            );
        }
    }

    fn is_redundant(&self, map: &Map, kf_id: KeyFrameId) -> bool {
        let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad && !kf.not_erase) else {
            return false;
        };
        let th_obs = self.config.redundant_observers;

        let mut num_points = 0usize;
        let mut num_redundant = 0usize;
        for (idx, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = map.get_map_point(mp_id).filter(|mp| !mp.is_bad) else {
                continue;
            };
            num_points += 1;
            if mp.num_observations() <= th_obs {
                continue;
            }

            let level = kf.keypoints[idx].octave;
            let finer_observers = mp
                .observations
                .iter()
                .filter(|(other_id, _)| **other_id != kf_id)
                .filter(|(other_id, other_idx)| {
                    map.get_keyframe(**other_id)
                        .and_then(|other| other.keypoints.get(**other_idx))
                        .map_or(false, |kp| kp.octave <= level + 1)
                })
                .take(th_obs)
                .count();
            if finer_observers >= th_obs {
                num_redundant += 1;
            }
        }

        num_points > 0 && num_redundant as f64 > self.config.kf_redundancy_ratio * num_points as f64
    }
}

/// Fusion or culling may have replaced points the keyframe was matched to.
fn update_tracked_points(map: &mut Map, kf_id: KeyFrameId) {
    let point_ids: Vec<MapPointId> = match map.get_keyframe(kf_id) {
        Some(kf) => kf.get_map_point_indices().map(|(_, id)| id).collect(),
        None => return,
    };
    for mp_id in point_ids {
        map.update_map_point_normal_and_depth(mp_id);
        map.update_map_point_descriptor(mp_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::KeyFrame;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::test_support::test_camera;
    use crossbeam_channel::bounded;
    use nalgebra::Vector3;

    fn add_keyframe(map: &mut Map, id: u64, n: usize) -> KeyFrameId {
        let keypoints = (0..n)
            .map(|i| KeyPoint::new(10.0 + (i % 25) as f32 * 12.0, 10.0 + (i / 25) as f32 * 12.0, 0))
            .collect();
        let kf_id = KeyFrameId::new(id);
        map.add_keyframe(KeyFrame::new(
            kf_id,
            id,
            id as f64,
            SE3::from_rt(nalgebra::Matrix3::identity(), Vector3::new(0.05 * id as f64, 0.0, 0.0)),
            keypoints,
            vec![Descriptor::zeros(); n],
            test_camera(),
            ScalePyramid::new(1.2, 8),
        ));
        kf_id
    }

    /// `num_kfs` keyframes that all observe the same `n` points.
    fn shared_view_map(num_kfs: u64, n: usize) -> Map {
        let mut map = Map::new();
        let ids: Vec<KeyFrameId> = (0..num_kfs).map(|id| add_keyframe(&mut map, id, n)).collect();
        for j in 0..n {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0 + j as f64 * 0.01), Descriptor::zeros(), ids[0]);
            for kf_id in &ids {
                map.associate(*kf_id, j, mp);
            }
        }
        for kf_id in &ids {
            map.update_connections(*kf_id);
        }
        map
    }

    #[test]
    fn test_weak_recent_points_are_culled() {
        let mut map = Map::new();
        let kf0 = add_keyframe(&mut map, 0, 10);
        let kf1 = add_keyframe(&mut map, 1, 10);
        let kf2 = add_keyframe(&mut map, 2, 10);

        let weak = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::zeros(), kf0);
        map.associate(kf0, 0, weak);
        let strong = map.create_map_point(Vector3::new(0.1, 0.0, 3.0), Descriptor::zeros(), kf0);
        for kf in [kf0, kf1, kf2] {
            map.associate(kf, 1, strong);
        }

        let mut mapper = LocalMapper::new(LocalMappingConfig::default());
        mapper.recent_points = vec![weak, strong];
        mapper.map_point_culling(&mut map, kf2);

        assert!(map.get_map_point(weak).is_none());
        assert!(map.get_map_point(strong).is_some());
        assert_eq!(mapper.recent_points, vec![strong]);
    }

    #[test]
    fn test_points_leave_recent_list_after_window() {
        let mut map = Map::new();
        let ids: Vec<KeyFrameId> = (0..4).map(|id| add_keyframe(&mut map, id, 10)).collect();
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::zeros(), ids[0]);
        for kf in &ids {
            map.associate(*kf, 0, mp);
        }

        let mut mapper = LocalMapper::new(LocalMappingConfig::default());
        mapper.recent_points = vec![mp];
        mapper.map_point_culling(&mut map, ids[3]);

        assert!(map.get_map_point(mp).is_some());
        assert!(mapper.recent_points.is_empty());
    }

    #[test]
    fn test_redundant_keyframes_are_culled_except_origin() {
        // Every point is seen by all five keyframes at the same level.
        let map = shared_view_map(5, 40);
        let mut atlas = Atlas::from_map(map);
        let mapper = LocalMapper::new(LocalMappingConfig::default());

        let current = KeyFrameId::new(4);
        mapper.keyframe_culling(&mut atlas, current);

        let map = atlas.active_map();
        assert!(map.get_keyframe(KeyFrameId::new(0)).is_some());
        assert!(map.get_keyframe(current).is_some());
        // Culling stops once points keep only the minimum number of observers.
        assert_eq!(map.num_keyframes(), 3);
        assert!(map.check_consistency().is_empty());
    }

    #[test]
    fn test_not_erase_keyframe_is_kept() {
        let mut map = shared_view_map(5, 40);
        for id in 1..4 {
            if let Some(kf) = map.get_keyframe_mut(KeyFrameId::new(id)) {
                kf.not_erase = true;
            }
        }
        let mut atlas = Atlas::from_map(map);
        let mapper = LocalMapper::new(LocalMappingConfig::default());
        mapper.keyframe_culling(&mut atlas, KeyFrameId::new(4));
        assert_eq!(atlas.active_map().num_keyframes(), 5);
    }

    #[test]
    fn test_keyframes_with_private_points_are_kept() {
        let mut map = Map::new();
        let ids: Vec<KeyFrameId> = (0..3).map(|id| add_keyframe(&mut map, id, 20)).collect();
        for j in 0..20 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::zeros(), ids[0]);
            for kf in &ids {
                map.associate(*kf, j, mp);
            }
        }
        for kf in &ids {
            map.update_connections(*kf);
        }
        // Only two other observers per point: below the redundancy count.
        let mut atlas = Atlas::from_map(map);
        let mapper = LocalMapper::new(LocalMappingConfig::default());
        mapper.keyframe_culling(&mut atlas, ids[2]);
        assert_eq!(atlas.active_map().num_keyframes(), 3);
    }

    #[test]
    fn test_reset_clears_atlas_and_acknowledges() {
        let shared = SharedState::with_atlas(Atlas::from_map(shared_view_map(3, 10)));
        let (sender, receiver) = bounded(5);
        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || LocalMapper::new(LocalMappingConfig::default()).run(receiver, shared))
        };

        let (ack_tx, ack_rx) = bounded(1);
        sender.send(MapperMessage::Reset(ack_tx)).unwrap();
        ack_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 0);
        assert_eq!(shared.atlas.read().active_map().num_map_points(), 0);

        drop(sender);
        handle.join().unwrap();
        assert!(shared.is_mapper_idle());
    }

    #[test]
    fn test_message_for_missing_keyframe_is_ignored() {
        let shared = SharedState::new();
        let (sender, receiver) = bounded(5);
        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || LocalMapper::new(LocalMappingConfig::default()).run(receiver, shared))
        };
        sender
            .send(MapperMessage::KeyFrame(NewKeyFrameMsg {
                keyframe_id: KeyFrameId::new(42),
            }))
            .unwrap();
        drop(sender);
        handle.join().unwrap();
        assert_eq!(shared.atlas.read().active_map().num_keyframes(), 0);
    }
}
