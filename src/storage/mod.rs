//! Map storage in a versioned JSON format.
//!
//! ## File Format
//!
//! One JSON document per map:
//! - header: format version, vocabulary identifier, extractor name, camera
//! - `keyframes`: id, pose (T_wc), spanning-tree parent, keypoints, hex descriptors
//! - `map_points`: id, position, hex descriptor, observations as
//!   `(keyframe id, keypoint index)` pairs
//!
//! Covisibility weights are rebuilt from the observations on load. Loads are
//! all or nothing: the whole file is validated before any map is built.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::atlas::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
use crate::features::{Descriptor, ExtractorType, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Current map file version.
pub const FORMAT_VERSION: u32 = 1;

const MAP_FILE_PREFIX: &str = "slam-map-";
const MAP_FILE_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("map file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("map file JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported map file version {found} (expected {FORMAT_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("map was built with extractor {found}, session uses {expected}")]
    IncompatibleExtractor { found: String, expected: String },
    #[error("map was indexed with vocabulary '{found}', session uses '{expected}'")]
    VocabularyMismatch { found: String, expected: String },
    #[error("dangling reference: {0}")]
    DanglingReference(String),
    #[error("invalid map data: {0}")]
    InvalidData(String),
}

/// Session properties a map file is written with and checked against.
#[derive(Debug, Clone)]
pub struct MapContext {
    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    pub extractor: ExtractorType,
    pub vocabulary_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapFile {
    pub version: u32,
    pub vocabulary: String,
    pub extractor: ExtractorType,
    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    pub keyframes: Vec<KeyFrameRecord>,
    pub map_points: Vec<MapPointRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFrameRecord {
    pub id: u64,
    pub frame_id: u64,
    pub timestamp: f64,
    /// Unit quaternion of T_wc as `[x, y, z, w]`.
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
    pub parent_id: Option<u64>,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MapPointRecord {
    pub id: u64,
    pub position: [f64; 3],
    pub descriptor: String,
    pub first_kf_id: u64,
    pub ref_kf_id: u64,
    pub visible_count: u32,
    pub found_count: u32,
    pub observations: Vec<(u64, usize)>,
}

impl MapFile {
    /// Snapshot the good KeyFrames and MapPoints of `map`.
    pub fn from_map(map: &Map, context: &MapContext) -> Self {
        let keyframes = map
            .keyframes()
            .filter(|kf| !kf.is_bad)
            .map(|kf| {
                let q = kf.pose.rotation.quaternion();
                KeyFrameRecord {
                    id: kf.id.0,
                    frame_id: kf.frame_id,
                    timestamp: kf.timestamp,
                    rotation: [q.i, q.j, q.k, q.w],
                    translation: kf.pose.translation.into(),
                    parent_id: kf.parent_id.map(|id| id.0),
                    keypoints: kf.keypoints.clone(),
                    descriptors: kf.descriptors.iter().map(Descriptor::to_hex).collect(),
                }
            })
            .collect();

        let map_points = map
            .map_points()
            .filter(|mp| !mp.is_bad)
            .map(|mp| MapPointRecord {
                id: mp.id.0,
                position: mp.position.into(),
                descriptor: mp.descriptor.to_hex(),
                first_kf_id: mp.first_kf_id.0,
                ref_kf_id: mp.ref_kf_id.0,
                visible_count: mp.visible_count,
                found_count: mp.found_count,
                observations: mp.observations.iter().map(|(kf, idx)| (kf.0, *idx)).collect(),
            })
            .collect();

        Self {
            version: FORMAT_VERSION,
            vocabulary: context.vocabulary_id.clone(),
            extractor: context.extractor,
            camera: context.camera,
            pyramid: context.pyramid.clone(),
            keyframes,
            map_points,
        }
    }

    /// Check the header against the session and every cross-reference.
    pub fn validate(&self, context: &MapContext) -> Result<(), StorageError> {
        if self.version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion { found: self.version });
        }
        if !self.extractor.is_compatible_with(&context.extractor) {
            return Err(StorageError::IncompatibleExtractor {
                found: self.extractor.to_string(),
                expected: context.extractor.to_string(),
            });
        }
        if self.vocabulary != context.vocabulary_id {
            return Err(StorageError::VocabularyMismatch {
                found: self.vocabulary.clone(),
                expected: context.vocabulary_id.clone(),
            });
        }
        self.camera
            .validate()
            .map_err(|e| StorageError::InvalidData(format!("camera: {}", e)))?;
        validate_pyramid(&self.pyramid, &context.pyramid)?;

        let mut num_features: HashMap<u64, usize> = HashMap::new();
        for kf in &self.keyframes {
            if kf.keypoints.len() != kf.descriptors.len() {
                return Err(StorageError::InvalidData(format!(
                    "keyframe {} has {} keypoints but {} descriptors",
                    kf.id,
                    kf.keypoints.len(),
                    kf.descriptors.len()
                )));
            }
            if kf.descriptors.iter().any(|d| Descriptor::from_hex(d).is_none()) {
                return Err(StorageError::InvalidData(format!("keyframe {} has a malformed descriptor", kf.id)));
            }
            if !kf.rotation.iter().chain(&kf.translation).all(|v| v.is_finite())
                || kf.rotation.iter().all(|v| *v == 0.0)
            {
                return Err(StorageError::InvalidData(format!("keyframe {} has an invalid pose", kf.id)));
            }
            if num_features.insert(kf.id, kf.keypoints.len()).is_some() {
                return Err(StorageError::InvalidData(format!("duplicate keyframe id {}", kf.id)));
            }
        }
        for kf in &self.keyframes {
            if let Some(parent) = kf.parent_id {
                if parent == kf.id || !num_features.contains_key(&parent) {
                    return Err(StorageError::DanglingReference(format!(
                        "keyframe {} has parent {}",
                        kf.id, parent
                    )));
                }
            }
        }
        let parents: HashMap<u64, u64> = self
            .keyframes
            .iter()
            .filter_map(|kf| kf.parent_id.map(|p| (kf.id, p)))
            .collect();
        for kf in &self.keyframes {
            let mut visited = HashSet::from([kf.id]);
            let mut current = kf.id;
            while let Some(&parent) = parents.get(&current) {
                if !visited.insert(parent) {
                    return Err(StorageError::InvalidData(format!(
                        "keyframe {} has a cyclic parent chain",
                        kf.id
                    )));
                }
                current = parent;
            }
        }

        let mut point_ids = HashSet::new();
        let mut used_slots = HashSet::new();
        for mp in &self.map_points {
            if !point_ids.insert(mp.id) {
                return Err(StorageError::InvalidData(format!("duplicate map point id {}", mp.id)));
            }
            if Descriptor::from_hex(&mp.descriptor).is_none() {
                return Err(StorageError::InvalidData(format!("map point {} has a malformed descriptor", mp.id)));
            }
            if !mp.position.iter().all(|v| v.is_finite()) {
                return Err(StorageError::InvalidData(format!("map point {} has a non-finite position", mp.id)));
            }
            if mp.observations.is_empty() {
                return Err(StorageError::InvalidData(format!("map point {} has no observations", mp.id)));
            }
            let mut observers = HashSet::new();
            for &(kf_id, idx) in &mp.observations {
                let Some(&n) = num_features.get(&kf_id) else {
                    return Err(StorageError::DanglingReference(format!(
                        "map point {} observed by missing keyframe {}",
                        mp.id, kf_id
                    )));
                };
                if idx >= n {
                    return Err(StorageError::DanglingReference(format!(
                        "map point {} observed at keypoint {} of keyframe {} ({} keypoints)",
                        mp.id, idx, kf_id, n
                    )));
                }
                if !observers.insert(kf_id) {
                    return Err(StorageError::InvalidData(format!(
                        "map point {} observed twice by keyframe {}",
                        mp.id, kf_id
                    )));
                }
                if !used_slots.insert((kf_id, idx)) {
                    return Err(StorageError::InvalidData(format!(
                        "keypoint {} of keyframe {} observes two map points",
                        idx, kf_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the map. Call only after [`MapFile::validate`] succeeded.
    fn into_map(self) -> Result<Map, StorageError> {
        let mut map = Map::new();
        let mut keyframes = self.keyframes;
        // The smallest id becomes the origin.
        keyframes.sort_by_key(|kf| kf.id);

        let mut parents = Vec::new();
        for record in keyframes {
            let [x, y, z, w] = record.rotation;
            let pose = SE3::from_quaternion(
                UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
                Vector3::from(record.translation),
            );
            let descriptors = record
                .descriptors
                .iter()
                .map(|d| Descriptor::from_hex(d).ok_or_else(|| StorageError::InvalidData(d.clone())))
                .collect::<Result<Vec<_>, _>>()?;
            let kf_id = KeyFrameId::new(record.id);
            map.add_keyframe(KeyFrame::new(
                kf_id,
                record.frame_id,
                record.timestamp,
                pose,
                record.keypoints,
                descriptors,
                self.camera,
                self.pyramid.clone(),
            ));
            if let Some(parent) = record.parent_id {
                parents.push((kf_id, KeyFrameId::new(parent)));
            }
        }
        for (child, parent) in parents {
            if let Some(kf) = map.get_keyframe_mut(child) {
                kf.set_parent(parent);
            }
            if let Some(kf) = map.get_keyframe_mut(parent) {
                kf.add_child(child);
            }
        }

        let mut point_ids = Vec::with_capacity(self.map_points.len());
        for record in self.map_points {
            let descriptor = Descriptor::from_hex(&record.descriptor)
                .ok_or_else(|| StorageError::InvalidData(record.descriptor.clone()))?;
            let mp_id = MapPointId::new(record.id);
            let mut mp = MapPoint::new(
                mp_id,
                Vector3::from(record.position),
                descriptor,
                KeyFrameId::new(record.first_kf_id),
            );
            let observers: BTreeMap<u64, usize> = record.observations.iter().copied().collect();
            let ref_kf = if observers.contains_key(&record.ref_kf_id) {
                record.ref_kf_id
            } else {
                observers.keys().next().copied().unwrap_or(record.first_kf_id)
            };
            mp.ref_kf_id = KeyFrameId::new(ref_kf);
            mp.visible_count = record.visible_count.max(1);
            mp.found_count = record.found_count.min(mp.visible_count);
            map.add_map_point(mp);

            for (kf_id, idx) in record.observations {
                if !map.associate(KeyFrameId::new(kf_id), idx, mp_id) {
                    return Err(StorageError::InvalidData(format!(
                        "map point {} cannot be attached to keyframe {}",
                        record.id, kf_id
                    )));
                }
            }
            point_ids.push(mp_id);
        }

        for mp_id in point_ids {
            map.update_map_point_normal_and_depth(mp_id);
        }
        let kf_ids: Vec<KeyFrameId> = map.keyframe_ids().copied().collect();
        for kf_id in kf_ids {
            map.update_connections(kf_id);
        }
        Ok(map)
    }
}

/// The file's levels must be self-consistent and match the session's.
fn validate_pyramid(found: &ScalePyramid, expected: &ScalePyramid) -> Result<(), StorageError> {
    let levels = found.num_levels;
    let lengths = [
        found.scale_factors.len(),
        found.inv_scale_factors.len(),
        found.level_sigma2.len(),
        found.inv_level_sigma2.len(),
    ];
    if levels == 0 || lengths.iter().any(|&n| n != levels) {
        return Err(StorageError::InvalidData(format!(
            "pyramid has {} levels but tables of {:?}",
            levels, lengths
        )));
    }
    let tables = [
        &found.scale_factors,
        &found.inv_scale_factors,
        &found.level_sigma2,
        &found.inv_level_sigma2,
    ];
    if !found.scale_factor.is_finite()
        || tables.iter().any(|t| t.iter().any(|v| !v.is_finite() || *v <= 0.0))
    {
        return Err(StorageError::InvalidData("pyramid has non-positive scales".to_string()));
    }
    if levels != expected.num_levels || (found.scale_factor - expected.scale_factor).abs() > 1e-9 {
        return Err(StorageError::IncompatibleExtractor {
            found: format!("{} levels at scale {}", levels, found.scale_factor),
            expected: format!("{} levels at scale {}", expected.num_levels, expected.scale_factor),
        });
    }
    Ok(())
}

/// Write `map` to `path`. The file is replaced atomically.
pub fn save_map(map: &Map, context: &MapContext, path: &Path) -> Result<(), StorageError> {
    let file = MapFile::from_map(map, context);
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    info!(
        "[MapStorage] saved {} keyframes and {} map points to {}",
        file.keyframes.len(),
        file.map_points.len(),
        path.display()
    );
    Ok(())
}

/// Read and validate a map file written by [`save_map`].
pub fn load_map(path: &Path, context: &MapContext) -> Result<Map, StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let file: MapFile = serde_json::from_reader(reader)?;
    file.validate(context)?;
    let map = file.into_map()?;

    info!(
        "[MapStorage] loaded {} keyframes and {} map points from {}",
        map.num_keyframes(),
        map.num_map_points(),
        path.display()
    );
    Ok(map)
}

/// Next free `slam-map-<n>.json` in `dir`.
pub fn next_map_file_name(dir: &Path) -> Result<PathBuf, StorageError> {
    let mut next = 0u64;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_prefix(MAP_FILE_PREFIX))
                .and_then(|n| n.strip_suffix(&format!(".{}", MAP_FILE_EXTENSION)))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(index) = index {
                next = next.max(index + 1);
            }
        }
    }
    Ok(dir.join(format!("{}{}.{}", MAP_FILE_PREFIX, next, MAP_FILE_EXTENSION)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_camera;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn context() -> MapContext {
        MapContext {
            camera: test_camera(),
            pyramid: ScalePyramid::new(1.2, 8),
            extractor: ExtractorType::FastOrb { n_features: 1000 },
            vocabulary_id: "test-voc".to_string(),
        }
    }

    /// Four keyframes along x, 50 points each seen by a random subset of them.
    fn sample_map() -> Map {
        let mut rng = StdRng::seed_from_u64(5);
        let camera = test_camera();
        let mut map = Map::new();
        let n = 50;
        for id in 0..4u64 {
            let keypoints = (0..n)
                .map(|_| KeyPoint::new(rng.gen_range(0.0..320.0), rng.gen_range(0.0..240.0), rng.gen_range(0..3)))
                .collect();
            let descriptors = (0..n).map(|_| Descriptor(rng.gen())).collect();
            let pose = SE3::from_quaternion(
                UnitQuaternion::from_euler_angles(0.0, 0.02 * id as f64, 0.0),
                Vector3::new(0.1 * id as f64, 0.0, 0.0),
            );
            map.add_keyframe(KeyFrame::new(
                KeyFrameId::new(id),
                id * 3,
                id as f64 * 0.1,
                pose,
                keypoints,
                descriptors,
                camera,
                ScalePyramid::new(1.2, 8),
            ));
        }
        for j in 0..n {
            let position = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(2.0..5.0));
            let mp = map.create_map_point(position, Descriptor(rng.gen()), KeyFrameId::new(0));
            map.associate(KeyFrameId::new(0), j, mp);
            for id in 1..4u64 {
                if rng.gen_bool(0.6) {
                    map.associate(KeyFrameId::new(id), j, mp);
                }
            }
            map.update_map_point_normal_and_depth(mp);
        }
        for id in 0..4u64 {
            map.update_connections(KeyFrameId::new(id));
        }
        map
    }

    #[test]
    fn test_save_and_reload_preserves_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        let map = sample_map();
        save_map(&map, &context(), &path).unwrap();
        let loaded = load_map(&path, &context()).unwrap();

        assert_eq!(loaded.num_keyframes(), map.num_keyframes());
        assert_eq!(loaded.num_map_points(), map.num_map_points());
        assert_eq!(loaded.origin_kf_id(), map.origin_kf_id());

        let sampled = MapPointId::new(17);
        let original = map.get_map_point(sampled).unwrap();
        let reloaded = loaded.get_map_point(sampled).unwrap();
        assert_eq!(reloaded.observations, original.observations);
        assert_eq!(reloaded.descriptor, original.descriptor);
        assert_relative_eq!(reloaded.position, original.position, epsilon = 1e-9);

        for kf in map.keyframes() {
            let other = loaded.get_keyframe(kf.id).unwrap();
            assert_eq!(other.map_point_ids, kf.map_point_ids);
            assert_eq!(other.parent_id, kf.parent_id);
            assert_eq!(other.covisibility_weights(), kf.covisibility_weights());
            assert_relative_eq!(other.pose.to_matrix(), kf.pose.to_matrix(), epsilon = 1e-9);
        }
        assert!(loaded.check_consistency().is_empty());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_version_and_session_mismatches_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        save_map(&sample_map(), &context(), &path).unwrap();

        let mut other_voc = context();
        other_voc.vocabulary_id = "other".to_string();
        assert!(matches!(load_map(&path, &other_voc), Err(StorageError::VocabularyMismatch { .. })));

        let mut brief = context();
        brief.extractor = ExtractorType::FastBrief { n_features: 1000 };
        assert!(matches!(load_map(&path, &brief), Err(StorageError::IncompatibleExtractor { .. })));

        // Same descriptor family with a different budget is accepted.
        let mut larger = context();
        larger.extractor = ExtractorType::FastOrb { n_features: 4000 };
        assert!(load_map(&path, &larger).is_ok());

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.version = 2;
        assert!(matches!(file.validate(&context()), Err(StorageError::UnsupportedVersion { found: 2 })));
    }

    #[test]
    fn test_dangling_references_are_rejected() {
        let mut file = MapFile::from_map(&sample_map(), &context());
        file.map_points[3].observations.push((99, 0));
        assert!(matches!(file.validate(&context()), Err(StorageError::DanglingReference(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.map_points[0].observations[0].1 = 10_000;
        assert!(matches!(file.validate(&context()), Err(StorageError::DanglingReference(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.keyframes[2].parent_id = Some(42);
        assert!(matches!(file.validate(&context()), Err(StorageError::DanglingReference(_))));
    }

    #[test]
    fn test_malformed_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\"version\": 1, \"keyframes\": [").unwrap();
        assert!(matches!(load_map(&path, &context()), Err(StorageError::Json(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.keyframes[1].descriptors[0] = "zz".to_string();
        assert!(matches!(file.validate(&context()), Err(StorageError::InvalidData(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        let dup = file.map_points[0].observations[0];
        file.map_points[1].observations.retain(|(kf, _)| *kf != dup.0);
        file.map_points[1].observations.push(dup);
        assert!(matches!(file.validate(&context()), Err(StorageError::InvalidData(_))));

        assert!(matches!(
            load_map(&dir.path().join("missing.json"), &context()),
            Err(StorageError::Io(_))
        ));
    }

    #[test]
    fn test_malformed_pyramid_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyramid.json");

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.pyramid.scale_factors.clear();
        fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        assert!(matches!(load_map(&path, &context()), Err(StorageError::InvalidData(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.pyramid.num_levels = 0;
        fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        assert!(matches!(load_map(&path, &context()), Err(StorageError::InvalidData(_))));

        let mut file = MapFile::from_map(&sample_map(), &context());
        file.pyramid.inv_level_sigma2.pop();
        assert!(matches!(file.validate(&context()), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_foreign_pyramid_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coarse.json");
        let mut coarse = context();
        coarse.pyramid = ScalePyramid::new(2.0, 3);
        save_map(&sample_map(), &coarse, &path).unwrap();

        assert!(matches!(load_map(&path, &context()), Err(StorageError::IncompatibleExtractor { .. })));
        assert!(load_map(&path, &coarse).is_ok());

        let mut fewer_levels = context();
        fewer_levels.pyramid = ScalePyramid::new(1.2, 4);
        assert!(matches!(
            load_map(&path, &fewer_levels),
            Err(StorageError::IncompatibleExtractor { .. })
        ));
    }

    #[test]
    fn test_parent_cycle_is_rejected() {
        let mut file = MapFile::from_map(&sample_map(), &context());
        for kf in file.keyframes.iter_mut() {
            match kf.id {
                1 => kf.parent_id = Some(2),
                2 => kf.parent_id = Some(1),
                _ => {}
            }
        }
        assert!(matches!(file.validate(&context()), Err(StorageError::InvalidData(_))));

        // A chain ending at the root is fine.
        let file = MapFile::from_map(&sample_map(), &context());
        assert!(file.keyframes.iter().skip(1).all(|kf| kf.parent_id.is_some()));
        assert!(file.validate(&context()).is_ok());
    }

    #[test]
    fn test_next_map_file_name_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_map_file_name(dir.path()).unwrap(), dir.path().join("slam-map-0.json"));
        fs::write(dir.path().join("slam-map-0.json"), "{}").unwrap();
        fs::write(dir.path().join("slam-map-4.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(next_map_file_name(dir.path()).unwrap(), dir.path().join("slam-map-5.json"));
    }
}
