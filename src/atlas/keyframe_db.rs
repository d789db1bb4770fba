//! KeyFrameDatabase - inverted index for place recognition.
//!
//! Maps every vocabulary word to the KeyFrames whose BoW vector contains it,
//! so relocalization only scores KeyFrames that share words with the query.

use std::collections::{BTreeMap, HashMap};

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::{BowVector, OrbVocabulary};

/// Candidates must share at least this fraction of the best shared-word count.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;
/// Covisible neighbours accumulated into a candidate's group score.
const GROUP_NEIGHBOURS: usize = 10;
/// Groups must reach this fraction of the best accumulated score.
const MIN_GROUP_SCORE_RATIO: f64 = 0.75;

/// Inverted file: word id → KeyFrames containing it.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    inverted: HashMap<u32, Vec<KeyFrameId>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a KeyFrame under every word of its BoW vector.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word in bow.keys() {
            let list = self.inverted.entry(*word).or_default();
            if !list.contains(&kf_id) {
                list.push(kf_id);
            }
        }
    }

    /// Remove a KeyFrame from the lists of the given words.
    pub fn erase(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word in bow.keys() {
            if let Some(list) = self.inverted.get_mut(word) {
                list.retain(|id| *id != kf_id);
                if list.is_empty() {
                    self.inverted.remove(word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inverted.is_empty()
    }

    /// Number of KeyFrames that contain `word`.
    pub fn word_frequency(&self, word: u32) -> usize {
        self.inverted.get(&word).map_or(0, |l| l.len())
    }

    /// KeyFrames likely depicting the same place as `query`, best first.
    ///
    /// 1. KeyFrames sharing at least 80% of the best shared-word count.
    /// 2. Each is scored against the query and its score accumulated over
    ///    its 10 best covisibles that also passed step 1; the best-scoring
    ///    KeyFrame represents the group.
    /// 3. Groups above 75% of the best accumulated score are returned.
    pub fn detect_relocalization_candidates(&self, query: &BowVector, map: &Map) -> Vec<KeyFrameId> {
        let mut shared_words: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for word in query.keys() {
            if let Some(list) = self.inverted.get(word) {
                for kf_id in list {
                    *shared_words.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }
        let Some(&max_common) = shared_words.values().max() else {
            return Vec::new();
        };
        let min_common = (MIN_COMMON_WORDS_RATIO * max_common as f64) as usize;

        let mut scores: BTreeMap<KeyFrameId, f64> = BTreeMap::new();
        for (&kf_id, &words) in &shared_words {
            if words <= min_common {
                continue;
            }
            let Some(bow) = map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector.as_ref()) else {
                continue;
            };
            scores.insert(kf_id, OrbVocabulary::score(query, bow));
        }
        if scores.is_empty() {
            return Vec::new();
        }

        let mut groups: Vec<(f64, KeyFrameId)> = Vec::new();
        let mut best_acc = 0.0f64;
        for (&kf_id, &score) in &scores {
            let mut acc = score;
            let mut best_score = score;
            let mut best_kf = kf_id;
            if let Some(kf) = map.get_keyframe(kf_id) {
                for neigh in kf.get_best_covisibles(GROUP_NEIGHBOURS) {
                    if let Some(&s) = scores.get(&neigh) {
                        acc += s;
                        if s > best_score {
                            best_score = s;
                            best_kf = neigh;
                        }
                    }
                }
            }
            best_acc = best_acc.max(acc);
            groups.push((acc, best_kf));
        }

        let min_score = MIN_GROUP_SCORE_RATIO * best_acc;
        groups.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut out: Vec<KeyFrameId> = Vec::new();
        for (acc, kf_id) in groups {
            if acc > min_score && !out.contains(&kf_id) {
                out.push(kf_id);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::atlas::map::KeyFrame;
    use crate::test_support::test_camera;

    fn bow(words: &[u32]) -> BowVector {
        words.iter().map(|w| (*w, 1.0 / words.len() as f64)).collect()
    }

    fn add(map: &mut Map, db: &mut KeyFrameDatabase, id: u64, words: &[u32]) -> KeyFrameId {
        let mut kf = KeyFrame::new(
            KeyFrameId::new(id),
            id,
            0.0,
            SE3::identity(),
            vec![KeyPoint::new(5.0, 5.0, 0)],
            vec![Descriptor::zeros()],
            test_camera(),
            ScalePyramid::new(1.2, 8),
        );
        let b = bow(words);
        db.add(kf.id, &b);
        kf.bow_vector = Some(b);
        map.add_keyframe(kf);
        KeyFrameId::new(id)
    }

    #[test]
    fn test_candidates_follow_shared_words() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let a = add(&mut map, &mut db, 0, &[1, 2, 3, 4, 5]);
        let _b = add(&mut map, &mut db, 1, &[1, 9, 10, 11, 12]);
        let c = add(&mut map, &mut db, 2, &[20, 21, 22]);

        let cands = db.detect_relocalization_candidates(&bow(&[1, 2, 3, 4, 6]), &map);
        assert_eq!(cands, vec![a]);

        let cands = db.detect_relocalization_candidates(&bow(&[20, 21, 22]), &map);
        assert_eq!(cands, vec![c]);

        assert!(db.detect_relocalization_candidates(&bow(&[99]), &map).is_empty());
    }

    #[test]
    fn test_erase_and_clear() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let a = add(&mut map, &mut db, 0, &[1, 2]);
        let b = add(&mut map, &mut db, 1, &[2, 3]);
        assert_eq!(db.word_frequency(2), 2);

        db.erase(a, &bow(&[1, 2]));
        assert_eq!(db.word_frequency(1), 0);
        assert_eq!(db.word_frequency(2), 1);
        assert_eq!(db.detect_relocalization_candidates(&bow(&[2, 3]), &map), vec![b]);

        db.clear();
        assert!(db.is_empty());
    }
}
