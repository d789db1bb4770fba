//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs Tracking in the caller's thread and spawns
//! the Local Mapping thread.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use image::GrayImage;
use tracing::{info, warn};

use crate::atlas::Atlas;
use crate::error::{ConfigError, SlamError};
use crate::features::{ExtractorType, FeatureExtractor};
use crate::geometry::SE3;
use crate::local_mapping::LocalMapper;
use crate::storage::{self, MapContext};
use crate::tracking::result::TrackingResult;
use crate::tracking::{Tracker, TrackingState};
use crate::vocabulary::OrbVocabulary;

use super::config::SlamConfig;
use super::messages::MapperMessage;
use super::shared_state::SharedState;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// When the channel is full, keyframes wait in Tracking and are sent with a
/// later frame.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Main SLAM system orchestrating Tracking and Local Mapping.
pub struct SlamSystem {
    config: SlamConfig,
    vocabulary: Arc<OrbVocabulary>,

    /// Shared state (Atlas, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the calling thread.
    tracker: Tracker,

    /// Control channel to Local Mapping (resets). The tracker holds its own
    /// sender for keyframes.
    mapper_sender: Option<Sender<MapperMessage>>,

    /// Handle to the Local Mapping thread.
    local_mapping_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Create a session from a config whose `vocabulary_path` points at a
    /// DBoW2 text vocabulary.
    ///
    /// Fails if the vocabulary cannot be read or the calibration is invalid.
    pub fn new(config: SlamConfig) -> Result<Self, SlamError> {
        let path = config
            .vocabulary_path
            .clone()
            .ok_or(ConfigError::MissingVocabulary)?;
        let vocabulary = OrbVocabulary::load_from_text(&path)?;
        info!(
            "[System] vocabulary '{}' loaded ({} words)",
            vocabulary.identifier(),
            vocabulary.num_words()
        );
        Self::with_vocabulary(config, Arc::new(vocabulary))
    }

    /// Create a session around an already loaded vocabulary.
    pub fn with_vocabulary(config: SlamConfig, vocabulary: Arc<OrbVocabulary>) -> Result<Self, SlamError> {
        config.camera.validate()?;
        config.validate()?;

        let shared = SharedState::new();
        let extractor = FeatureExtractor::new(&config.extractor);

        // Create bounded channel for keyframe communication
        let (mapper_sender, mapper_receiver) = bounded::<MapperMessage>(KEYFRAME_CHANNEL_CAPACITY);

        let local_mapping_handle = Self::spawn_local_mapping(&config, Arc::clone(&shared), mapper_receiver)?;

        let tracker = Tracker::new(
            config.clone(),
            extractor,
            Arc::clone(&vocabulary),
            Arc::clone(&shared),
            mapper_sender.clone(),
        );

        info!(
            "[System] session started: extractor {}, camera {}x{}",
            config.extractor.extractor_type, config.camera.width, config.camera.height
        );
        Ok(Self {
            config,
            vocabulary,
            shared,
            tracker,
            mapper_sender: Some(mapper_sender),
            local_mapping_handle: Some(local_mapping_handle),
        })
    }

    /// Spawn the Local Mapping thread.
    fn spawn_local_mapping(
        config: &SlamConfig,
        shared: Arc<SharedState>,
        receiver: Receiver<MapperMessage>,
    ) -> Result<JoinHandle<()>, SlamError> {
        let mapping_config = config.local_mapping.clone();
        thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || {
                let mut local_mapper = LocalMapper::new(mapping_config);
                local_mapper.run(receiver, shared);
            })
            .map_err(SlamError::Thread)
    }

    /// Track one grayscale image.
    ///
    /// This runs in the calling thread. Returns the tracking state, the
    /// camera pose (T_wc) when tracked, and the tracked point positions.
    pub fn process_image(&mut self, image: &GrayImage, timestamp: f64) -> TrackingResult {
        self.tracker.process_image(image, timestamp)
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state
    }

    /// Last published camera pose (T_wc). May lag the tracker by a frame.
    pub fn current_pose(&self) -> Option<SE3> {
        self.shared.current_pose()
    }

    /// Get a reference to the shared state.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Arc<OrbVocabulary> {
        &self.vocabulary
    }

    /// The extractor is fixed for the lifetime of a session.
    pub fn set_extractor(&mut self, extractor_type: ExtractorType) -> Result<(), SlamError> {
        let current = self.config.extractor.extractor_type;
        if extractor_type == current {
            return Ok(());
        }
        Err(SlamError::ExtractorLocked {
            current: current.to_string(),
            requested: extractor_type.to_string(),
        })
    }

    fn map_context(&self) -> MapContext {
        MapContext {
            camera: self.config.camera,
            pyramid: self.tracker.extractor().pyramid().clone(),
            extractor: self.config.extractor.extractor_type,
            vocabulary_id: self.vocabulary.identifier().to_string(),
        }
    }

    /// Write the current map to `path`.
    pub fn save_map(&self, path: &Path) -> Result<(), SlamError> {
        let context = self.map_context();
        let atlas = self.shared.atlas.read();
        storage::save_map(atlas.active_map(), &context, path)?;
        Ok(())
    }

    /// Replace the session's map with one read from `path`.
    ///
    /// The file is validated before anything changes. Tracking then starts
    /// out lost, so the next frames relocalize against the loaded map.
    pub fn load_map(&mut self, path: &Path) -> Result<(), SlamError> {
        let mut map = storage::load_map(path, &self.map_context())?;

        let kf_ids: Vec<_> = map.keyframe_ids().copied().collect();
        for kf_id in kf_ids {
            if let Some(kf) = map.get_keyframe_mut(kf_id) {
                let (bow, features) = self.vocabulary.transform(&kf.descriptors, self.config.bow_levels_up);
                kf.bow_vector = Some(bow);
                kf.feature_vector = Some(features);
            }
        }

        self.reset();
        *self.shared.atlas.write() = Atlas::from_map(map);
        self.tracker.resume_lost();
        Ok(())
    }

    /// Discard the map and start over with initialization.
    ///
    /// Blocks until Local Mapping has drained the keyframes queued before the
    /// reset and cleared its own state.
    pub fn reset(&mut self) {
        let (ack_sender, ack_receiver) = bounded(1);
        let delivered = self
            .mapper_sender
            .as_ref()
            .map_or(false, |sender| sender.send(MapperMessage::Reset(ack_sender)).is_ok());
        if !delivered || ack_receiver.recv().is_err() {
            warn!("[System] local mapping is not running, clearing the map directly");
            self.shared.atlas.write().clear();
        }
        self.tracker.reset();
        info!("[System] reset");
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals the Local Mapping thread to finish and waits for it, so no
    /// optimization is still running once this returns.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        self.shared.request_abort_ba();
        self.mapper_sender = None;

        if let Some(handle) = self.local_mapping_handle.take() {
            if handle.join().is_err() {
                warn!("[System] local mapping thread panicked");
            }
            info!("[System] shutdown complete");
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blank, test_camera, textured_image, view, world, Scene, HEIGHT, WIDTH};

    fn test_vocabulary() -> Arc<OrbVocabulary> {
        let extractor = FeatureExtractor::new(&SlamConfig::default().extractor);
        let sample = extractor.extract(&textured_image(WIDTH, HEIGHT, 7)).descriptors;
        Arc::new(OrbVocabulary::train(&[sample], 8, 3, 0).unwrap())
    }

    fn test_system() -> SlamSystem {
        SlamSystem::with_vocabulary(SlamConfig::with_camera(test_camera()), test_vocabulary()).unwrap()
    }

    fn initialized_system() -> (SlamSystem, Scene) {
        let mut system = test_system();
        let scene = world(3);
        system.process_image(&view(&scene, 0), 0.0);
        let result = system.process_image(&view(&scene, 20), 0.1);
        assert_eq!(result.state, TrackingState::Ok);
        (system, scene)
    }

    #[test]
    fn test_lateral_translation_reaches_ok() {
        let mut system = test_system();
        let scene = world(3);
        assert_eq!(system.process_image(&view(&scene, 0), 0.0).state, TrackingState::NotInitialized);
        let result = system.process_image(&view(&scene, 20), 0.1);

        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.tracked_points.len() >= 50);
        assert!(result.pose.is_some());
        assert!(system.current_pose().is_some());
        assert!(system.shared_state().atlas.read().active_map().num_map_points() >= 50);
    }

    #[test]
    fn test_zero_motion_does_not_initialize() {
        let mut system = test_system();
        let image = view(&world(3), 0);
        for i in 0..3 {
            let result = system.process_image(&image, i as f64 * 0.1);
            assert_eq!(result.state, TrackingState::NotInitialized);
        }
        assert_eq!(system.shared_state().atlas.read().active_map().num_keyframes(), 0);
    }

    #[test]
    fn test_blank_frames_lose_tracking_then_relocalize() {
        let (mut system, scene) = initialized_system();

        for i in 0..30 {
            let result = system.process_image(&blank(), 0.2 + i as f64 * 0.1);
            assert_eq!(result.state, TrackingState::Lost);
            assert!(result.pose.is_none());
        }
        assert!(system.current_pose().is_none());

        let result = system.process_image(&view(&scene, 0), 4.0);
        assert_eq!(result.state, TrackingState::Ok);
        assert!(result.metrics.relocalized);
        assert!(result.pose.is_some());
    }

    #[test]
    fn test_saved_map_relocalizes_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let (mut system, scene) = initialized_system();
        system.save_map(&path).unwrap();
        let saved = system.shared_state().atlas.read().active_map().num_keyframes();

        system.reset();
        assert_eq!(system.state(), TrackingState::NotInitialized);
        assert_eq!(system.shared_state().atlas.read().active_map().num_keyframes(), 0);

        system.load_map(&path).unwrap();
        assert_eq!(system.state(), TrackingState::Lost);
        assert_eq!(system.shared_state().atlas.read().active_map().num_keyframes(), saved);

        let result = system.process_image(&view(&scene, 0), 1.0);
        assert_eq!(result.state, TrackingState::Ok);
    }

    #[test]
    fn test_failed_load_keeps_current_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let (mut system, _scene) = initialized_system();
        let before = system.shared_state().atlas.read().active_map().num_keyframes();

        assert!(matches!(system.load_map(&path), Err(SlamError::Storage(_))));
        assert_eq!(system.shared_state().atlas.read().active_map().num_keyframes(), before);
        assert_eq!(system.state(), TrackingState::Ok);
    }

    #[test]
    fn test_extractor_is_locked() {
        let mut system = test_system();
        let current = system.config().extractor.extractor_type;
        assert!(system.set_extractor(current).is_ok());
        assert!(matches!(
            system.set_extractor(ExtractorType::FastBrief { n_features: 1000 }),
            Err(SlamError::ExtractorLocked { .. })
        ));
    }

    #[test]
    fn test_missing_vocabulary_is_fatal() {
        let mut config = SlamConfig::with_camera(test_camera());
        assert!(matches!(
            SlamSystem::new(config.clone()),
            Err(SlamError::Config(ConfigError::MissingVocabulary))
        ));
        config.vocabulary_path = Some("/nonexistent/voc.txt".into());
        assert!(matches!(SlamSystem::new(config), Err(SlamError::Vocabulary(_))));
    }

    #[test]
    fn test_invalid_calibration_is_fatal() {
        let mut camera = test_camera();
        camera.fx = 0.0;
        let config = SlamConfig::with_camera(camera);
        assert!(matches!(
            SlamSystem::with_vocabulary(config, test_vocabulary()),
            Err(SlamError::Config(ConfigError::InvalidCalibration(_)))
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut system = test_system();
        system.shutdown();
        system.shutdown();
    }
}
