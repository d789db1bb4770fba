//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! A hierarchical k-majority tree over binary descriptors, stored in the
//! DBoW2 text format. Besides loading a pre-trained file the vocabulary can
//! be trained from sample images, which is how small test vocabularies are
//! produced.
//!
//! # Key Types
//!
//! - [`BowVector`]: word id → L1-normalized TF-IDF weight (place recognition)
//! - [`FeatureVector`]: tree node → feature indices (accelerated matching)
//! - [`OrbVocabulary`]: the tree with quantization and scoring

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::info;

use crate::features::{Descriptor, DESCRIPTOR_BYTES};

/// Bag-of-Words vector: word_id -> TF-IDF weight, L1-normalized.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: node_id -> feature indices that descend through that node.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Maximum k-majority refinement rounds per tree node.
const MAX_CLUSTER_ITERATIONS: usize = 10;

/// Errors that can occur when loading or using a vocabulary.
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vocabulary parse error: {0}")]
    Parse(String),
    #[error("vocabulary has no words")]
    Empty,
}

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
pub struct VocabNode {
    pub id: u32,
    /// Parent node id (`u32::MAX` for the root).
    pub parent: u32,
    pub children: Vec<u32>,
    pub descriptor: Descriptor,
    /// IDF weight (leaves only).
    pub weight: f64,
    pub word_id: Option<u32>,
}

impl VocabNode {
    fn new(id: u32, parent: u32) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            descriptor: Descriptor::zeros(),
            weight: 0.0,
            word_id: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// ORB Vocabulary tree (DBoW2 format).
#[derive(Debug)]
pub struct OrbVocabulary {
    /// All nodes in the tree (nodes[0] is root).
    nodes: Vec<VocabNode>,
    /// Word id to node id.
    words: Vec<u32>,
    /// Branching factor.
    k: usize,
    /// Depth levels.
    l: usize,
    identifier: String,
}

impl OrbVocabulary {
    /// Load vocabulary from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] desc[1] ... desc[31] weight
    /// ...
    /// ```
    ///
    /// One line per node, root excluded. Any malformed line fails the load.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary file".to_string()))??;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(VocabularyError::Parse(
                "invalid header, expected: k L [scoring weighting]".to_string(),
            ));
        }
        let k: usize = header_parts[0]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid k value".to_string()))?;
        let l: usize = header_parts[1]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid L value".to_string()))?;
        if k < 2 || l == 0 {
            return Err(VocabularyError::Parse(format!("unsupported tree shape k={} L={}", k, l)));
        }

        let mut nodes = vec![VocabNode::new(0, u32::MAX)];
        let mut words = Vec::new();

        for (line_idx, line_result) in lines.enumerate() {
            let line_num = line_idx + 2;
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != DESCRIPTOR_BYTES + 3 {
                return Err(VocabularyError::Parse(format!(
                    "line {}: expected {} fields, found {}",
                    line_num,
                    DESCRIPTOR_BYTES + 3,
                    parts.len()
                )));
            }

            let parent_id: u32 = parts[0]
                .parse()
                .map_err(|_| VocabularyError::Parse(format!("invalid parent id at line {}", line_num)))?;
            if parent_id as usize >= nodes.len() {
                return Err(VocabularyError::Parse(format!(
                    "line {}: parent {} not defined yet",
                    line_num, parent_id
                )));
            }
            let is_leaf = match parts[1] {
                "1" => true,
                "0" => false,
                other => {
                    return Err(VocabularyError::Parse(format!(
                        "line {}: invalid leaf flag '{}'",
                        line_num, other
                    )))
                }
            };

            let mut bytes = [0u8; DESCRIPTOR_BYTES];
            for (i, byte_str) in parts[2..2 + DESCRIPTOR_BYTES].iter().enumerate() {
                bytes[i] = byte_str.parse().map_err(|_| {
                    VocabularyError::Parse(format!("invalid descriptor byte at line {}", line_num))
                })?;
            }
            let weight: f64 = parts[2 + DESCRIPTOR_BYTES]
                .parse()
                .map_err(|_| VocabularyError::Parse(format!("invalid weight at line {}", line_num)))?;

            let node_id = nodes.len() as u32;
            let mut node = VocabNode::new(node_id, parent_id);
            node.descriptor = Descriptor(bytes);
            node.weight = weight;
            if is_leaf {
                node.word_id = Some(words.len() as u32);
                words.push(node_id);
            }
            nodes[parent_id as usize].children.push(node_id);
            nodes.push(node);
        }

        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }

        let identifier = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vocabulary".to_string());

        info!(
            "Loaded vocabulary '{}': k={}, L={}, {} nodes, {} words",
            identifier,
            k,
            l,
            nodes.len(),
            words.len()
        );

        Ok(Self {
            nodes,
            words,
            k,
            l,
            identifier,
        })
    }

    /// Write the tree in DBoW2 text format (L1 scoring, TF-IDF weighting).
    pub fn save_to_text<P: AsRef<Path>>(&self, path: P) -> Result<(), VocabularyError> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{} {} 0 0", self.k, self.l)?;
        for node in self.nodes.iter().skip(1) {
            write!(out, "{} {}", node.parent, if node.is_leaf() { 1 } else { 0 })?;
            for b in node.descriptor.0.iter() {
                write!(out, " {}", b)?;
            }
            writeln!(out, " {}", node.weight)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Train a vocabulary from per-image descriptor sets.
    ///
    /// Builds a k-majority tree of depth `l` and assigns each word the IDF
    /// weight `ln(N / n_i)` over the `N` training images.
    pub fn train(
        images: &[Vec<Descriptor>],
        k: usize,
        l: usize,
        seed: u64,
    ) -> Result<Self, VocabularyError> {
        if k < 2 || l == 0 {
            return Err(VocabularyError::Parse(format!("unsupported tree shape k={} L={}", k, l)));
        }
        let all: Vec<Descriptor> = images.iter().flatten().copied().collect();
        if all.is_empty() {
            return Err(VocabularyError::Empty);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![VocabNode::new(0, u32::MAX)];
        let indices: Vec<usize> = (0..all.len()).collect();
        Self::build_subtree(&mut nodes, 0, &all, indices, 1, k, l, &mut rng);

        let mut words = Vec::new();
        for node in nodes.iter_mut().skip(1) {
            if node.is_leaf() {
                node.word_id = Some(words.len() as u32);
                words.push(node.id);
            }
        }

        let mut vocab = Self {
            nodes,
            words,
            k,
            l,
            identifier: format!("trained-k{}-L{}-s{}", k, l, seed),
        };

        // IDF weights.
        let n_images = images.len().max(1) as f64;
        let mut doc_freq = vec![0usize; vocab.words.len()];
        for image in images {
            let seen: HashSet<u32> = image
                .iter()
                .map(|d| vocab.transform_descriptor(d, 0).0)
                .collect();
            for w in seen {
                doc_freq[w as usize] += 1;
            }
        }
        for (word, &node_id) in vocab.words.iter().enumerate() {
            let n_i = doc_freq[word].max(1) as f64;
            vocab.nodes[node_id as usize].weight = (n_images / n_i).ln().max(0.0) + 1e-3;
        }

        info!(
            "Trained vocabulary '{}': {} nodes, {} words from {} descriptors",
            vocab.identifier,
            vocab.nodes.len(),
            vocab.words.len(),
            all.len()
        );
        Ok(vocab)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_subtree(
        nodes: &mut Vec<VocabNode>,
        parent: u32,
        all: &[Descriptor],
        indices: Vec<usize>,
        depth: usize,
        k: usize,
        l: usize,
        rng: &mut StdRng,
    ) {
        let clusters = if indices.len() <= k {
            indices.iter().map(|&i| (all[i], vec![i])).collect()
        } else {
            k_majority(all, &indices, k, rng)
        };

        let mut children = Vec::with_capacity(clusters.len());
        for (center, members) in clusters {
            let id = nodes.len() as u32;
            let mut node = VocabNode::new(id, parent);
            node.descriptor = center;
            nodes.push(node);
            nodes[parent as usize].children.push(id);
            children.push((id, members));
        }

        if depth >= l {
            return;
        }
        for (id, members) in children {
            if members.len() > 1 {
                Self::build_subtree(nodes, id, all, members, depth + 1, k, l, rng);
            }
        }
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Name stored in map files to pair them with the vocabulary that indexed them.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Quantize one descriptor.
    ///
    /// Returns `(word_id, leaf_node_id, node at depth L - levels_up)`. For
    /// leaves shallower than that depth the leaf itself is the group node.
    fn transform_descriptor(&self, desc: &Descriptor, levels_up: usize) -> (u32, u32, u32) {
        let group_depth = self.l.saturating_sub(levels_up).max(1);
        let mut node_id = 0usize;
        let mut depth = 0;
        let mut group_node = 0u32;

        while !self.nodes[node_id].children.is_empty() {
            let children = &self.nodes[node_id].children;
            let mut best_child = children[0];
            let mut best_dist = desc.distance(&self.nodes[best_child as usize].descriptor);
            for &child in &children[1..] {
                let dist = desc.distance(&self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
            depth += 1;
            if depth <= group_depth {
                group_node = best_child;
            }
        }

        let word_id = self.nodes[node_id].word_id.unwrap_or(0);
        (word_id, node_id as u32, group_node)
    }

    /// Transform descriptors to BowVector and FeatureVector.
    ///
    /// `levels_up` selects the FeatureVector grouping depth `L - levels_up`.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id, group) = self.transform_descriptor(desc, levels_up);
            let weight = self.nodes[leaf_id as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
            feat.entry(group).or_default().push(i);
        }

        normalize_l1(&mut bow);
        (bow, feat)
    }

    /// BowVector only.
    pub fn transform_bow_only(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf_id, _) = self.transform_descriptor(desc, 0);
            let weight = self.nodes[leaf_id as usize].weight;
            if weight > 0.0 {
                *bow.entry(word_id).or_insert(0.0) += weight;
            }
        }
        normalize_l1(&mut bow);
        bow
    }

    /// L1 similarity: `1 - 0.5 * ||v1 - v2||_1`, in `[0, 1]`.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        1.0 - 0.5 * diff_sum
    }
}

fn normalize_l1(bow: &mut BowVector) {
    let sum: f64 = bow.values().sum();
    if sum > 0.0 {
        for v in bow.values_mut() {
            *v /= sum;
        }
    }
}

/// One level of k-majority clustering with k-means++ seeding.
fn k_majority(
    all: &[Descriptor],
    indices: &[usize],
    k: usize,
    rng: &mut StdRng,
) -> Vec<(Descriptor, Vec<usize>)> {
    // k-means++ seeding on Hamming distance.
    let mut centers: Vec<Descriptor> = Vec::with_capacity(k);
    centers.push(all[indices[rng.gen_range(0..indices.len())]]);
    let mut min_dist: Vec<f64> = indices
        .iter()
        .map(|&i| all[i].distance(&centers[0]) as f64)
        .collect();

    while centers.len() < k {
        let total: f64 = min_dist.iter().map(|d| d * d).sum();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut chosen = indices.len() - 1;
        for (j, d) in min_dist.iter().enumerate() {
            target -= d * d;
            if target <= 0.0 {
                chosen = j;
                break;
            }
        }
        let c = all[indices[chosen]];
        centers.push(c);
        for (j, &i) in indices.iter().enumerate() {
            min_dist[j] = min_dist[j].min(all[i].distance(&c) as f64);
        }
    }

    let mut assignment = vec![usize::MAX; indices.len()];
    for _ in 0..MAX_CLUSTER_ITERATIONS {
        let mut changed = false;
        for (j, &i) in indices.iter().enumerate() {
            let best = centers
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| all[i].distance(c))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignment[j] != best {
                assignment[j] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        // Majority vote per bit.
        for (c, center) in centers.iter_mut().enumerate() {
            let mut counts = [0usize; DESCRIPTOR_BYTES * 8];
            let mut n = 0;
            for (j, &i) in indices.iter().enumerate() {
                if assignment[j] != c {
                    continue;
                }
                n += 1;
                for (bit, count) in counts.iter_mut().enumerate() {
                    if all[i].bit(bit) {
                        *count += 1;
                    }
                }
            }
            if n == 0 {
                continue;
            }
            let mut d = Descriptor::zeros();
            for (bit, &count) in counts.iter().enumerate() {
                if 2 * count > n {
                    d.set_bit(bit);
                }
            }
            *center = d;
        }
    }

    let mut clusters: Vec<(Descriptor, Vec<usize>)> =
        centers.into_iter().map(|c| (c, Vec::new())).collect();
    for (j, &i) in indices.iter().enumerate() {
        clusters[assignment[j]].1.push(i);
    }
    clusters.retain(|(_, members)| !members.is_empty());
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut bytes = [0u8; DESCRIPTOR_BYTES];
                rng.fill(&mut bytes[..]);
                Descriptor(bytes)
            })
            .collect()
    }

    #[test]
    fn test_bow_score() {
        let mut v1 = BowVector::new();
        v1.insert(0, 0.5);
        v1.insert(1, 0.5);
        let v2 = v1.clone();
        assert!((OrbVocabulary::score(&v1, &v2) - 1.0).abs() < 1e-10);

        let mut v3 = BowVector::new();
        v3.insert(2, 0.5);
        v3.insert(3, 0.5);
        assert!(OrbVocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_vocab_node_creation() {
        let node = VocabNode::new(1, 0);
        assert_eq!(node.id, 1);
        assert_eq!(node.parent, 0);
        assert!(node.is_leaf());
        assert!(node.word_id.is_none());
    }

    #[test]
    fn test_train_transform_and_score() {
        let images: Vec<Vec<Descriptor>> = (0..4).map(|s| random_descriptors(150, s)).collect();
        let vocab = OrbVocabulary::train(&images, 5, 3, 42).unwrap();
        assert!(vocab.num_words() > 25);

        let (bow_a, feat_a) = vocab.transform(&images[0], 1);
        let (bow_b, _) = vocab.transform(&images[0], 1);
        assert!((OrbVocabulary::score(&bow_a, &bow_b) - 1.0).abs() < 1e-9);
        assert_eq!(feat_a.values().map(|v| v.len()).sum::<usize>(), 150);

        let bow_other = vocab.transform_bow_only(&images[3]);
        assert!(OrbVocabulary::score(&bow_a, &bow_other) < 0.9);
    }

    #[test]
    fn test_text_roundtrip_preserves_quantization() {
        let images: Vec<Vec<Descriptor>> = (0..3).map(|s| random_descriptors(100, s + 10)).collect();
        let vocab = OrbVocabulary::train(&images, 4, 3, 7).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small_voc.txt");
        vocab.save_to_text(&path).unwrap();
        let loaded = OrbVocabulary::load_from_text(&path).unwrap();

        assert_eq!(loaded.num_nodes(), vocab.num_nodes());
        assert_eq!(loaded.num_words(), vocab.num_words());
        assert_eq!(loaded.identifier(), "small_voc");
        for d in &images[1] {
            assert_eq!(loaded.transform_descriptor(d, 0).0, vocab.transform_descriptor(d, 0).0);
        }
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("corrupt.txt");
        std::fs::write(&path, "10 6 0 0\n0 1 12 13 garbage\n").unwrap();
        assert!(matches!(
            OrbVocabulary::load_from_text(&path),
            Err(VocabularyError::Parse(_))
        ));

        let path = dir.path().join("header_only.txt");
        std::fs::write(&path, "10 6 0 0\n").unwrap();
        assert!(matches!(OrbVocabulary::load_from_text(&path), Err(VocabularyError::Empty)));

        assert!(matches!(
            OrbVocabulary::load_from_text(dir.path().join("missing.txt")),
            Err(VocabularyError::Io(_))
        ));
    }
}
