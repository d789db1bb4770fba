//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! This implementation follows the ORB-SLAM monocular design:
//! - Uses the shared `Atlas` via RwLock, holding the lock only for the
//!   duration of each matching stage
//! - Bootstraps the map from two views with enough parallax
//! - Tracks `MapPoint`s frame to frame with a constant velocity model, falling
//!   back to BoW matching against the reference keyframe
//! - Refines every pose against the local map
//! - Inserts keyframes and hands them to Local Mapping via channel
//! - Relocalizes against the keyframe database while lost

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use image::GrayImage;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::features::FeatureExtractor;
use crate::geometry::SE3;
use crate::optimizer::{global_bundle_adjustment, optimize_pose, BAConfig};
use crate::system::config::SlamConfig;
use crate::system::messages::{MapperMessage, NewKeyFrameMsg};
use crate::system::shared_state::SharedState;
use crate::tracking::initializer::{InitRejection, Initializer, TwoViewReconstruction};
use crate::tracking::keyframe_decision::KeyFrameDecision;
use crate::tracking::matcher::OrbMatcher;
use crate::tracking::motion_model::MotionModel;
use crate::tracking::relocalizer::Relocalizer;
use crate::tracking::result::{TrackingMetrics, TrackingResult};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::TrackingState;
use crate::vocabulary::OrbVocabulary;

/// Matches needed after projection from the last frame.
const MIN_MOTION_MODEL_MATCHES: usize = 20;
/// Matches needed after BoW matching against the reference keyframe.
const MIN_BOW_MATCHES: usize = 15;
/// Inlier map points needed by the frame-to-frame stages.
const MIN_STAGE_INLIERS: usize = 10;
/// Iterations of the bundle adjustment run on the initial map.
const INITIAL_BA_ITERATIONS: usize = 20;
/// Viewing-angle limit (cosine) for local map points.
const LOCAL_VIEW_COS: f64 = 0.5;
/// Covisibles added per local keyframe, and the size cap of the local set.
const LOCAL_NEIGHBOURS: usize = 10;
const MAX_LOCAL_KEYFRAMES: usize = 80;

/// Main tracking structure.
pub struct Tracker {
    config: SlamConfig,
    extractor: FeatureExtractor,
    vocabulary: Arc<OrbVocabulary>,

    /// Tracking state machine (NotInitialized, Ok, Lost).
    pub state: TrackingState,

    initializer: Option<Initializer>,
    motion_model: MotionModel,
    kf_decision: KeyFrameDecision,
    relocalizer: Relocalizer,

    /// The previous frame, kept for projection matching.
    last_frame: Option<Frame>,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,

    next_frame_id: u64,
    last_kf_frame_id: u64,
    last_reloc_frame_id: Option<u64>,
    /// Failed frames since the last tracked one.
    consecutive_failures: u32,

    /// Inserted keyframes the full queue has not taken yet, oldest first.
    pending_keyframes: VecDeque<KeyFrameId>,

    /// Shared state (Atlas, flags) - thread-safe access.
    shared: Arc<SharedState>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<MapperMessage>,
}

impl Tracker {
    pub fn new(
        config: SlamConfig,
        extractor: FeatureExtractor,
        vocabulary: Arc<OrbVocabulary>,
        shared: Arc<SharedState>,
        kf_sender: Sender<MapperMessage>,
    ) -> Self {
        Self {
            kf_decision: KeyFrameDecision::new(&config.tracking),
            relocalizer: Relocalizer::new(config.relocalization.clone()),
            config,
            extractor,
            vocabulary,
            state: TrackingState::NotInitialized,
            initializer: None,
            motion_model: MotionModel::new(),
            last_frame: None,
            reference_kf: None,
            next_frame_id: 0,
            last_kf_frame_id: 0,
            last_reloc_frame_id: None,
            consecutive_failures: 0,
            pending_keyframes: VecDeque::new(),
            shared,
            kf_sender,
        }
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Keyframes in the map that Local Mapping has not been sent yet.
    pub fn pending_keyframes(&self) -> usize {
        self.pending_keyframes.len()
    }

    /// Extract features from `image` and track it.
    pub fn process_image(&mut self, image: &GrayImage, timestamp: f64) -> TrackingResult {
        let t_start = Instant::now();
        let frame = Frame::new(
            self.next_frame_id,
            timestamp,
            image,
            &self.extractor,
            self.config.camera,
        );
        let extract_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        let mut result = self.process_frame(frame);
        result.timing.extract_ms = extract_ms;
        result.timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        result
    }

    /// Track a frame whose features are already extracted.
    ///
    /// Per-frame failures never surface as errors; they are reported through
    /// the state in the result.
    pub fn process_frame(&mut self, mut frame: Frame) -> TrackingResult {
        let t_start = Instant::now();
        self.next_frame_id = self.next_frame_id.max(frame.id + 1);
        self.flush_pending_keyframes();

        let mut metrics = TrackingMetrics {
            n_features: frame.num_features(),
            ..TrackingMetrics::default()
        };
        let mut new_keyframe = None;

        match self.state {
            TrackingState::NotInitialized => {
                new_keyframe = self.initialize(&mut frame);
            }
            TrackingState::Ok | TrackingState::Lost => {
                let relocalizing = self.state == TrackingState::Lost;
                let ok = if !frame.has_enough_features(self.config.tracking.min_features) {
                    debug!("[Tracking] frame {}: only {} features", frame.id, frame.num_features());
                    false
                } else if relocalizing {
                    self.relocalize(&mut frame)
                } else {
                    self.track(&mut frame, &mut metrics)
                };
                metrics.relocalized = ok && relocalizing;

                let ok = ok && self.track_local_map(&mut frame, &mut metrics);
                if ok {
                    if self.state == TrackingState::Lost {
                        info!("[Tracking] relocalized at frame {}", frame.id);
                    }
                    self.state = TrackingState::Ok;
                    self.consecutive_failures = 0;
                    if let Some(pose) = frame.pose {
                        self.motion_model.update(&pose);
                    }
                    new_keyframe = self.maybe_create_keyframe(&mut frame);
                } else {
                    self.consecutive_failures += 1;
                    frame.clear_matches();
                    let coasting = self.state == TrackingState::Ok
                        && self.consecutive_failures < self.config.tracking.lost_after_failures;
                    if coasting {
                        frame.pose = self.coast(frame.id);
                    } else {
                        if self.state == TrackingState::Ok {
                            warn!("[Tracking] lost at frame {}", frame.id);
                        }
                        self.state = TrackingState::Lost;
                        self.motion_model.reset();
                        frame.pose = None;
                    }
                }
            }
        }

        let mut result = TrackingResult::new(self.state);
        if self.state == TrackingState::Ok {
            result.pose = frame.pose.map(|p| p.to_matrix());
            result.tracked_points = self.tracked_positions(&frame);
        }
        self.shared
            .publish_pose(frame.pose.filter(|_| self.state == TrackingState::Ok));
        metrics.n_inliers = frame.num_tracked();
        result.reference_kf_id = self.reference_kf;
        result.new_keyframe = new_keyframe;
        result.metrics = metrics;
        result.timing.track_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        result.timing.total_ms = result.timing.track_ms;

        self.last_frame = Some(frame);
        result
    }

    /// Drop all tracking state. The map is cleared by the caller.
    pub fn reset(&mut self) {
        self.state = TrackingState::NotInitialized;
        self.initializer = None;
        self.motion_model.reset();
        self.last_frame = None;
        self.reference_kf = None;
        self.last_kf_frame_id = 0;
        self.last_reloc_frame_id = None;
        self.consecutive_failures = 0;
        self.pending_keyframes.clear();
        self.shared.publish_pose(None);
    }

    /// Continue from a map built elsewhere: the next frames relocalize.
    pub fn resume_lost(&mut self) {
        self.reset();
        self.state = TrackingState::Lost;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    fn initialize(&mut self, frame: &mut Frame) -> Option<KeyFrameId> {
        let min_features = self.config.tracking.init_min_features;
        let Some(initializer) = self.initializer.as_mut() else {
            self.initializer = Initializer::new(frame, &self.config.tracking);
            return None;
        };
        if frame.num_features() <= min_features {
            self.initializer = None;
            return None;
        }

        match initializer.initialize(frame) {
            Ok(reconstruction) => {
                let reference = initializer.reference().clone();
                self.initializer = None;
                self.create_initial_map(reference, frame, reconstruction)
            }
            Err(InitRejection::TooFewMatches(n)) => {
                debug!("[Tracking] init: {} matches, restarting from frame {}", n, frame.id);
                self.initializer = Initializer::new(frame, &self.config.tracking);
                None
            }
            Err(rejection) => {
                debug!("[Tracking] init: frame {} rejected ({:?})", frame.id, rejection);
                None
            }
        }
    }

    /// Build the map from a two-view reconstruction: two keyframes, the
    /// triangulated points, a full BA and normalization to unit median
    /// depth. Returns the second keyframe.
    fn create_initial_map(
        &mut self,
        mut reference: Frame,
        current: &mut Frame,
        reconstruction: TwoViewReconstruction,
    ) -> Option<KeyFrameId> {
        reference.pose = Some(SE3::identity());
        current.pose = Some(reconstruction.pose_cw.inverse());
        reference.compute_bow(&self.vocabulary, self.config.bow_levels_up);
        current.compute_bow(&self.vocabulary, self.config.bow_levels_up);
        current.clear_matches();

        let mut atlas = self.shared.atlas.write();
        let (kf0, kf1) = {
            let map = atlas.active_map_mut();
            let kf0 = map.create_keyframe(&reference);
            let kf1 = map.create_keyframe(current);

            for &(i1, i2, position) in &reconstruction.triangulated {
                let mp_id = map.create_map_point(position, reference.descriptors[i1], kf0);
                map.associate(kf0, i1, mp_id);
                map.associate(kf1, i2, mp_id);
                map.update_map_point_descriptor(mp_id);
                map.update_map_point_normal_and_depth(mp_id);
            }
            map.update_connections(kf0);
            map.update_connections(kf1);
            (kf0, kf1)
        };
        info!(
            "[Tracking] new map: {:?} model, {} points, parallax {:.2}°",
            reconstruction.model,
            atlas.active_map().num_map_points(),
            reconstruction.parallax_deg
        );

        let ba = BAConfig {
            max_iterations: INITIAL_BA_ITERATIONS,
            ..BAConfig::default()
        };
        global_bundle_adjustment(atlas.active_map_mut(), &ba);

        let map = atlas.active_map();
        let median_depth = map.get_keyframe(kf0).and_then(|kf| {
            kf.median_depth(
                kf.get_map_point_indices()
                    .filter_map(|(_, mp_id)| map.get_map_point(mp_id))
                    .map(|mp| mp.position),
            )
        });
        let tracked = map.tracked_map_points(kf1, 1);
        let median_depth = match median_depth {
            Some(d) if d > 0.0 && tracked >= self.config.tracking.init_min_triangulated => d,
            _ => {
                warn!("[Tracking] initial map rejected ({} points after BA), resetting", tracked);
                atlas.clear();
                return None;
            }
        };
        atlas.active_map_mut().normalize_scale(1.0 / median_depth);
        atlas.index_keyframe(kf0);
        atlas.index_keyframe(kf1);

        // The current frame continues from the refined second keyframe.
        if let Some(kf) = atlas.active_map().get_keyframe(kf1) {
            current.pose = Some(kf.pose);
            current.map_points = kf.map_point_ids.clone();
            current.outliers = vec![false; current.num_features()];
        }
        drop(atlas);

        self.send_keyframe(kf0);
        self.send_keyframe(kf1);

        self.state = TrackingState::Ok;
        self.reference_kf = Some(kf1);
        current.reference_kf = Some(kf1);
        self.last_kf_frame_id = current.id;
        self.motion_model.reset();
        if let Some(pose) = current.pose {
            self.motion_model.update(&pose);
        }
        Some(kf1)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame-to-frame tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Initial pose of an `Ok` frame: motion model, then reference keyframe.
    fn track(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) -> bool {
        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        let Some(last) = self.last_frame.as_mut() else {
            return false;
        };
        check_replaced_in_last_frame(last, map);

        let recently_relocalized = self.frames_since_reloc(frame.id) < 2;
        if self.motion_model.has_velocity() && !recently_relocalized {
            if let Some(n) = self.track_with_motion_model(frame, map) {
                metrics.n_matches = n;
                return true;
            }
        }
        match self.track_reference_keyframe(frame, map) {
            Some(n) => {
                metrics.n_matches = n;
                true
            }
            None => false,
        }
    }

    fn track_with_motion_model(&self, frame: &mut Frame, map: &Map) -> Option<usize> {
        let last = self.last_frame.as_ref()?;
        frame.pose = Some(self.motion_model.predict()?);
        frame.clear_matches();

        let matcher = OrbMatcher::new(0.9, true);
        let th = self.config.tracking.projection_radius;
        let mut matches = matcher.search_by_projection_from_last(frame, last, map, th);
        if matches < MIN_MOTION_MODEL_MATCHES {
            frame.clear_matches();
            matches = matcher.search_by_projection_from_last(frame, last, map, 2.0 * th);
        }
        if matches < MIN_MOTION_MODEL_MATCHES {
            return None;
        }

        optimize_pose(frame, map);
        let inliers = discard_outliers(frame);
        (inliers >= MIN_STAGE_INLIERS).then_some(matches)
    }

    fn track_reference_keyframe(&self, frame: &mut Frame, map: &Map) -> Option<usize> {
        frame.compute_bow(&self.vocabulary, self.config.bow_levels_up);
        let kf = map.get_keyframe(self.reference_kf?)?;

        let (matches, found) = OrbMatcher::new(0.7, true).search_by_bow(kf, frame, map);
        if matches < MIN_BOW_MATCHES {
            debug!("[Tracking] frame {}: {} BoW matches with {}", frame.id, matches, kf.id);
            return None;
        }

        frame.map_points = found;
        frame.outliers = vec![false; frame.num_features()];
        frame.pose = self
            .last_frame
            .as_ref()
            .and_then(|last| last.pose)
            .or(Some(kf.pose));
        optimize_pose(frame, map);
        let inliers = discard_outliers(frame);
        (inliers >= MIN_STAGE_INLIERS).then_some(matches)
    }

    fn relocalize(&mut self, frame: &mut Frame) -> bool {
        let Some(kf_id) = self.relocalizer.relocalize(
            frame,
            &self.shared.atlas,
            &self.vocabulary,
            self.config.bow_levels_up,
        ) else {
            return false;
        };
        self.reference_kf = Some(kf_id);
        self.last_reloc_frame_id = Some(frame.id);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local map
    // ─────────────────────────────────────────────────────────────────────────

    /// Refine the pose against the points of the local keyframes.
    fn track_local_map(&mut self, frame: &mut Frame, metrics: &mut TrackingMetrics) -> bool {
        let since_reloc = self.frames_since_reloc(frame.id);
        let recently_relocalized = since_reloc < 2;
        let (visible, inliers) = {
            let atlas = self.shared.atlas.read();
            let map = atlas.active_map();

            let (local_kfs, reference) = local_keyframes(frame, map);
            if let Some(reference) = reference {
                self.reference_kf = Some(reference);
                frame.reference_kf = Some(reference);
            }
            let local_points = map.get_map_points_from_keyframes(&local_kfs);

            let mut visible: Vec<MapPointId> = frame.map_points.iter().flatten().copied().collect();
            let already: HashSet<MapPointId> = visible.iter().copied().collect();
            let mut candidates = Vec::new();
            for mp_id in local_points {
                if already.contains(&mp_id) {
                    continue;
                }
                let Some(mp) = map.get_map_point(mp_id) else {
                    continue;
                };
                if let Some(proj) = frame.is_in_frustum(mp, LOCAL_VIEW_COS) {
                    visible.push(mp_id);
                    candidates.push((mp_id, proj));
                }
            }

            let th = if recently_relocalized { 5.0 } else { 1.0 };
            let added = OrbMatcher::new(0.8, false).search_by_projection_local(frame, map, &candidates, th);
            metrics.n_matches += added;

            optimize_pose(frame, map);
            discard_outliers(frame);
            let inliers: Vec<MapPointId> = frame.map_points.iter().flatten().copied().collect();
            (visible, inliers)
        };

        if !visible.is_empty() {
            let mut atlas = self.shared.atlas.write();
            let map = atlas.active_map_mut();
            for mp_id in &visible {
                if let Some(mp) = map.get_map_point_mut(*mp_id) {
                    mp.increase_visible(1);
                }
            }
            for mp_id in &inliers {
                if let Some(mp) = map.get_map_point_mut(*mp_id) {
                    mp.increase_found(1);
                }
            }
        }

        let required = if since_reloc < self.config.tracking.kf_max_frames {
            self.config.tracking.min_inliers_after_reloc
        } else {
            self.config.tracking.min_inliers
        };
        let ok = inliers.len() >= required;
        if !ok {
            debug!(
                "[Tracking] frame {}: {} local map inliers (need {})",
                frame.id,
                inliers.len(),
                required
            );
        }
        ok
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame insertion
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether `frame` becomes a keyframe, and if so insert it.
    fn maybe_create_keyframe(&mut self, frame: &mut Frame) -> Option<KeyFrameId> {
        if !self.pending_keyframes.is_empty() {
            // Local Mapping is saturated.
            return None;
        }
        let reference = self.reference_kf?;
        let (num_keyframes, reference_points) = {
            let atlas = self.shared.atlas.read();
            let map = atlas.active_map();
            let n = map.num_keyframes();
            let min_obs = if n <= 2 { 2 } else { 3 };
            (n, map.tracked_map_points(reference, min_obs))
        };

        let should_create = self.kf_decision.should_create_keyframe(
            frame.id.saturating_sub(self.last_kf_frame_id),
            self.frames_since_reloc(frame.id),
            num_keyframes,
            frame.num_tracked(),
            reference_points,
            self.shared.is_mapper_idle(),
        );
        if !should_create {
            return None;
        }

        frame.compute_bow(&self.vocabulary, self.config.bow_levels_up);
        let kf_id = insert_keyframe(&mut self.shared.atlas.write(), frame);
        self.send_keyframe(kf_id);

        self.reference_kf = Some(kf_id);
        frame.reference_kf = Some(kf_id);
        self.last_kf_frame_id = frame.id;
        debug!("[Tracking] frame {} → {} ({} points)", frame.id, kf_id, frame.num_tracked());
        Some(kf_id)
    }

    fn frames_since_reloc(&self, frame_id: u64) -> u64 {
        self.last_reloc_frame_id
            .map_or(u64::MAX, |id| frame_id.saturating_sub(id))
    }

    fn send_keyframe(&mut self, keyframe_id: KeyFrameId) {
        // Signal Local Mapping that a new keyframe is coming (abort current BA)
        self.shared.request_abort_ba();
        self.shared.set_mapper_idle(false);
        self.pending_keyframes.push_back(keyframe_id);
        self.flush_pending_keyframes();
    }

    /// Hand queued keyframes to Local Mapping without ever blocking.
    fn flush_pending_keyframes(&mut self) {
        while let Some(&keyframe_id) = self.pending_keyframes.front() {
            match self
                .kf_sender
                .try_send(MapperMessage::KeyFrame(NewKeyFrameMsg { keyframe_id }))
            {
                Ok(()) => {
                    self.pending_keyframes.pop_front();
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "[Tracking] keyframe queue full, {} waits ({} pending)",
                        keyframe_id,
                        self.pending_keyframes.len()
                    );
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("[Tracking] local mapping is gone, {} not processed", keyframe_id);
                    self.pending_keyframes.clear();
                    return;
                }
            }
        }
    }

    /// Pose of a failed frame inside the grace window: the motion model
    /// prediction, or the last pose without one.
    fn coast(&mut self, frame_id: u64) -> Option<SE3> {
        let pose = self
            .motion_model
            .predict()
            .or_else(|| self.last_frame.as_ref().and_then(|f| f.pose))?;
        self.motion_model.update(&pose);
        debug!(
            "[Tracking] frame {} failed ({} in a row), coasting",
            frame_id, self.consecutive_failures
        );
        Some(pose)
    }

    fn tracked_positions(&self, frame: &Frame) -> Vec<nalgebra::Vector3<f64>> {
        let atlas = self.shared.atlas.read();
        let map = atlas.active_map();
        frame
            .map_points
            .iter()
            .zip(&frame.outliers)
            .filter(|(_, out)| !**out)
            .filter_map(|(mp, _)| mp.and_then(|id| map.get_map_point(id)))
            .map(|mp| mp.position)
            .collect()
    }
}

/// Promote `frame` to a keyframe carrying its tracked points, linked into the
/// covisibility graph and the keyframe database.
fn insert_keyframe(atlas: &mut Atlas, frame: &Frame) -> KeyFrameId {
    let map = atlas.active_map_mut();
    let kf_id = map.create_keyframe(frame);
    for (idx, mp_id) in frame.map_points.iter().enumerate() {
        if frame.outliers[idx] {
            continue;
        }
        if let Some(mp_id) = mp_id.and_then(|id| map.resolve(id)) {
            map.associate(kf_id, idx, mp_id);
        }
    }
    map.update_connections(kf_id);
    atlas.index_keyframe(kf_id);
    kf_id
}

/// Points of the last frame may have been fused or culled by Local Mapping.
fn check_replaced_in_last_frame(last: &mut Frame, map: &Map) {
    for slot in last.map_points.iter_mut() {
        if let Some(mp_id) = *slot {
            *slot = map.resolve(mp_id);
        }
    }
}

/// Drop outlier matches; returns the remaining matches.
fn discard_outliers(frame: &mut Frame) -> usize {
    for idx in 0..frame.map_points.len() {
        if frame.outliers[idx] {
            frame.map_points[idx] = None;
            frame.outliers[idx] = false;
        }
    }
    frame.num_tracked()
}

/// Keyframes observing the frame's points, extended with their best
/// covisibles, children and parents. The keyframe sharing the most points
/// is returned as the new reference.
fn local_keyframes(frame: &Frame, map: &Map) -> (Vec<KeyFrameId>, Option<KeyFrameId>) {
    let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
    for mp_id in frame.map_points.iter().flatten() {
        if let Some(mp) = map.get_map_point(*mp_id) {
            for kf_id in mp.observations.keys() {
                *counter.entry(*kf_id).or_insert(0) += 1;
            }
        }
    }

    let mut first: Vec<(KeyFrameId, usize)> = counter
        .into_iter()
        .filter(|(id, _)| map.get_keyframe(*id).map_or(false, |kf| !kf.is_bad))
        .collect();
    first.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let reference = first.first().map(|(id, _)| *id);

    let mut local: Vec<KeyFrameId> = first.iter().map(|(id, _)| *id).collect();
    let mut seen: HashSet<KeyFrameId> = local.iter().copied().collect();
    for (kf_id, _) in &first {
        if local.len() >= MAX_LOCAL_KEYFRAMES {
            break;
        }
        let Some(kf) = map.get_keyframe(*kf_id) else {
            continue;
        };
        let neighbours = kf
            .get_best_covisibles(LOCAL_NEIGHBOURS)
            .into_iter()
            .chain(kf.children_ids.iter().copied())
            .chain(kf.parent_id);
        for n in neighbours {
            if map.get_keyframe(n).map_or(false, |k| !k.is_bad) && seen.insert(n) {
                local.push(n);
            }
        }
    }
    (local, reference)
}
