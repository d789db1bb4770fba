//! Relocalization against the KeyFrame database.
//!
//! After tracking is lost every frame is queried against the place
//! recognition index. Each candidate KeyFrame is matched by BoW, a pose is
//! hypothesized with PnP-RANSAC seeded at the candidate's pose, and the
//! hypothesis is refined with pose optimization and guided projection
//! searches until it is supported by enough inliers.

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use parking_lot::RwLock;
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::atlas::Atlas;
use crate::geometry::{solve_pnp_ransac, PnPRansacParams};
use crate::optimizer::optimize_pose;
use crate::system::config::RelocalizationConfig;
use crate::tracking::matcher::OrbMatcher;
use crate::tracking::Frame;
use crate::vocabulary::OrbVocabulary;

/// Inliers below which a PnP hypothesis is dropped before the guided search.
const MIN_OPTIMIZED_INLIERS: usize = 10;
/// Coarse and fine guided-search radii.
const COARSE_RADIUS: f64 = 10.0;
const FINE_RADIUS: f64 = 3.0;
const COARSE_ORB_DIST: u32 = 100;
const FINE_ORB_DIST: u32 = 64;

pub struct Relocalizer {
    config: RelocalizationConfig,
}

impl Relocalizer {
    pub fn new(config: RelocalizationConfig) -> Self {
        Self { config }
    }

    /// Try to recover the pose of `frame`.
    ///
    /// On success the frame carries the recovered pose and its inlier
    /// matches, and the KeyFrame it was localized against is returned. On
    /// failure the frame is left without pose and matches.
    ///
    /// Candidates are flagged `not_erase` while they are in use so that
    /// Local Mapping cannot cull them between the lock scopes.
    pub fn relocalize(
        &self,
        frame: &mut Frame,
        atlas: &RwLock<Atlas>,
        vocabulary: &OrbVocabulary,
        bow_levels_up: usize,
    ) -> Option<KeyFrameId> {
        frame.compute_bow(vocabulary, bow_levels_up);
        let bow = frame.bow_vector.as_ref()?;

        let candidates = {
            let atlas = atlas.read();
            atlas
                .keyframe_db
                .detect_relocalization_candidates(bow, atlas.active_map())
        };
        if candidates.is_empty() {
            debug!("[Reloc] frame {}: no candidates", frame.id);
            return None;
        }

        let guarded = set_not_erase(atlas, &candidates, true);
        let result = {
            let atlas = atlas.read();
            self.try_candidates(frame, atlas.active_map(), &candidates)
        };
        set_not_erase(atlas, &guarded, false);

        match result {
            Some(kf_id) => {
                frame.reference_kf = Some(kf_id);
                debug!(
                    "[Reloc] frame {} relocalized against {} with {} inliers",
                    frame.id,
                    kf_id,
                    frame.num_tracked()
                );
            }
            None => {
                frame.clear_matches();
                frame.pose = None;
                debug!("[Reloc] frame {}: {} candidates rejected", frame.id, candidates.len());
            }
        }
        result
    }

    fn try_candidates(&self, frame: &mut Frame, map: &Map, candidates: &[KeyFrameId]) -> Option<KeyFrameId> {
        let bow_matcher = OrbMatcher::new(0.75, true);
        for &kf_id in candidates {
            let Some(kf) = map.get_keyframe(kf_id).filter(|kf| !kf.is_bad) else {
                continue;
            };
            let (num_matches, matches) = bow_matcher.search_by_bow(kf, frame, map);
            if num_matches < self.config.min_bow_matches {
                continue;
            }
            if self.try_candidate(frame, map, kf_id, &matches) {
                return Some(kf_id);
            }
            frame.clear_matches();
            frame.pose = None;
        }
        None
    }

    fn try_candidate(&self, frame: &mut Frame, map: &Map, kf_id: KeyFrameId, matches: &[Option<MapPointId>]) -> bool {
        let Some(kf) = map.get_keyframe(kf_id) else {
            return false;
        };

        let mut indices = Vec::new();
        let mut points3d: Vec<Vector3<f64>> = Vec::new();
        let mut points2d = Vec::new();
        let mut inv_sigma2 = Vec::new();
        for (idx, mp_id) in matches.iter().enumerate() {
            let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
                continue;
            };
            let kp = &frame.keypoints[idx];
            indices.push(idx);
            points3d.push(mp.position);
            points2d.push(Vector2::new(kp.x as f64, kp.y as f64));
            inv_sigma2.push(frame.pyramid.inv_sigma2(kp.octave));
        }

        let params = PnPRansacParams {
            iterations: self.config.ransac_iterations,
            min_inliers: MIN_OPTIMIZED_INLIERS,
            seed: self.config.ransac_seed,
            ..PnPRansacParams::default()
        };
        let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, &inv_sigma2, &frame.camera, &kf.pose, &params)
        else {
            return false;
        };

        frame.clear_matches();
        frame.pose = Some(pnp.pose);
        for (k, &idx) in indices.iter().enumerate() {
            if pnp.inlier_mask[k] {
                frame.map_points[idx] = matches[idx];
            }
        }

        let mut good = optimize_pose(frame, map);
        if good < MIN_OPTIMIZED_INLIERS {
            return false;
        }
        discard_outliers(frame);

        let min_inliers = self.config.min_inliers;
        if good < min_inliers {
            let guided = OrbMatcher::new(0.9, true);
            let found = matched_points(frame);
            let additional =
                guided.search_by_projection_keyframe(frame, kf, map, &found, COARSE_RADIUS, COARSE_ORB_DIST);
            if additional + good >= min_inliers {
                good = optimize_pose(frame, map);

                // Close to the threshold: a narrower search with the better pose.
                if good > 30 && good < min_inliers {
                    let found = matched_points(frame);
                    let additional =
                        guided.search_by_projection_keyframe(frame, kf, map, &found, FINE_RADIUS, FINE_ORB_DIST);
                    if good + additional >= min_inliers {
                        good = optimize_pose(frame, map);
                    }
                }
                discard_outliers(frame);
            }
        }

        good >= min_inliers
    }
}

fn matched_points(frame: &Frame) -> HashSet<MapPointId> {
    frame
        .map_points
        .iter()
        .zip(&frame.outliers)
        .filter(|(_, out)| !**out)
        .filter_map(|(mp, _)| *mp)
        .collect()
}

fn discard_outliers(frame: &mut Frame) {
    for idx in 0..frame.map_points.len() {
        if frame.outliers[idx] {
            frame.map_points[idx] = None;
            frame.outliers[idx] = false;
        }
    }
}

/// Set `not_erase` on the candidates. Returns the ones whose flag changed, so
/// that clearing never removes a guard set by someone else.
fn set_not_erase(atlas: &RwLock<Atlas>, kf_ids: &[KeyFrameId], value: bool) -> Vec<KeyFrameId> {
    let mut atlas = atlas.write();
    let map = atlas.active_map_mut();
    let mut changed = Vec::new();
    for &kf_id in kf_ids {
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            if kf.not_erase != value {
                kf.not_erase = value;
                changed.push(kf_id);
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, ExtractedFeatures, KeyPoint, ScalePyramid};
    use crate::test_support::test_camera;

    fn frame_with_features(n: usize) -> Frame {
        let features = ExtractedFeatures {
            keypoints: (0..n)
                .map(|i| KeyPoint::new(10.0 + (i % 30) as f32 * 10.0, 10.0 + (i / 30) as f32 * 10.0, 0))
                .collect(),
            descriptors: (0..n).map(|i| Descriptor([i as u8; 32])).collect(),
        };
        Frame::from_features(0, 0.0, features, ScalePyramid::new(1.2, 8), test_camera())
    }

    #[test]
    fn test_empty_database_gives_no_pose() {
        let vocabulary = OrbVocabulary::train(&[vec![Descriptor([0; 32]), Descriptor([255; 32])]], 2, 1, 0).unwrap();
        let atlas = RwLock::new(Atlas::new());
        let relocalizer = Relocalizer::new(RelocalizationConfig::default());
        let mut frame = frame_with_features(60);
        assert!(relocalizer.relocalize(&mut frame, &atlas, &vocabulary, 0).is_none());
        assert!(frame.pose.is_none());
        assert_eq!(frame.num_tracked(), 0);
    }

    #[test]
    fn test_not_erase_guard_only_clears_its_own_flags() {
        let atlas = RwLock::new(Atlas::new());
        let (a, b) = {
            let mut guard = atlas.write();
            let map = guard.active_map_mut();
            let frame = frame_with_features(10);
            let a = map.create_keyframe(&frame);
            let b = map.create_keyframe(&frame);
            if let Some(kf) = map.get_keyframe_mut(b) {
                kf.not_erase = true;
            }
            (a, b)
        };

        let guarded = set_not_erase(&atlas, &[a, b], true);
        assert_eq!(guarded, vec![a]);
        set_not_erase(&atlas, &guarded, false);

        let guard = atlas.read();
        assert!(!guard.active_map().get_keyframe(a).unwrap().not_erase);
        assert!(guard.active_map().get_keyframe(b).unwrap().not_erase);
    }
}
