//! Keypoint extractors.
//!
//! Every variant shares the same detection core (scale pyramid, cell-wise
//! FAST with a fallback threshold, quadtree distribution) and differs in how
//! descriptors are computed. The variant is chosen when the session is built
//! and never changes afterwards: distances between descriptors of different
//! variants are meaningless.

use std::fmt;
use std::str::FromStr;

use image::imageops;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::brief::{compute_descriptor, ic_angle, PATCH_SIZE};
use super::fast::compute_scores;
use super::keypoint::{Descriptor, KeyPoint};
use super::pyramid::{build_pyramid, ScalePyramid};
use super::quadtree::distribute;

/// Pixels skipped at each level border (descriptor reach plus margin).
pub const EDGE_THRESHOLD: usize = 19;
/// FAST cell size in pixels.
const CELL_SIZE: usize = 30;
/// Sigma of the Gaussian applied before descriptor sampling.
const DESCRIPTOR_BLUR_SIGMA: f32 = 2.0;

/// Catalogue of supported extractor configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExtractorType {
    /// FAST corners, oriented rotated-BRIEF descriptors.
    FastOrb { n_features: usize },
    /// FAST corners, upright BRIEF descriptors.
    FastBrief { n_features: usize },
}

impl ExtractorType {
    /// Presets offered for interactive selection.
    pub const PRESETS: [ExtractorType; 8] = [
        ExtractorType::FastOrb { n_features: 1000 },
        ExtractorType::FastOrb { n_features: 2000 },
        ExtractorType::FastOrb { n_features: 4000 },
        ExtractorType::FastOrb { n_features: 6000 },
        ExtractorType::FastBrief { n_features: 1000 },
        ExtractorType::FastBrief { n_features: 2000 },
        ExtractorType::FastBrief { n_features: 4000 },
        ExtractorType::FastBrief { n_features: 6000 },
    ];

    pub fn n_features(&self) -> usize {
        match *self {
            ExtractorType::FastOrb { n_features } | ExtractorType::FastBrief { n_features } => {
                n_features
            }
        }
    }

    /// Name of the descriptor family. Two extractors are compatible iff
    /// their families match.
    pub fn descriptor_family(&self) -> &'static str {
        match self {
            ExtractorType::FastOrb { .. } => "ORBS",
            ExtractorType::FastBrief { .. } => "BRIEF",
        }
    }

    pub fn is_compatible_with(&self, other: &ExtractorType) -> bool {
        self.descriptor_family() == other.descriptor_family()
    }
}

impl Default for ExtractorType {
    fn default() -> Self {
        ExtractorType::FastOrb { n_features: 1000 }
    }
}

impl fmt::Display for ExtractorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAST-{}-{}", self.descriptor_family(), self.n_features())
    }
}

impl TryFrom<String> for ExtractorType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ExtractorType> for String {
    fn from(t: ExtractorType) -> Self {
        t.to_string()
    }
}

impl FromStr for ExtractorType {
    type Err = String;

    /// Parses `FAST-ORBS-<n>` and `FAST-BRIEF-<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let (fast, family, count) = (parts.next(), parts.next(), parts.next());
        if fast != Some("FAST") {
            return Err(format!("unknown extractor '{}'", s));
        }
        let n_features = count
            .and_then(|c| c.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| format!("invalid keypoint count in '{}'", s))?;
        match family {
            Some("ORBS") => Ok(ExtractorType::FastOrb { n_features }),
            Some("BRIEF") => Ok(ExtractorType::FastBrief { n_features }),
            _ => Err(format!("unknown descriptor family in '{}'", s)),
        }
    }
}

/// Detection parameters common to all variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    #[serde(rename = "type")]
    pub extractor_type: ExtractorType,
    pub scale_factor: f64,
    pub num_levels: usize,
    /// FAST threshold tried first in every cell.
    pub ini_th_fast: u8,
    /// Fallback threshold for cells where nothing passed `ini_th_fast`.
    pub min_th_fast: u8,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            extractor_type: ExtractorType::default(),
            scale_factor: 1.2,
            num_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Output of one extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl ExtractedFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Uniform contract of every extractor variant.
pub trait KeypointExtractor {
    fn extract(&self, image: &GrayImage) -> ExtractedFeatures;
    fn pyramid(&self) -> &ScalePyramid;
}

/// Detection shared by all variants.
#[derive(Debug, Clone)]
struct DetectorCore {
    n_features: usize,
    ini_th_fast: u8,
    min_th_fast: u8,
    pyramid: ScalePyramid,
    features_per_level: Vec<usize>,
}

impl DetectorCore {
    fn new(config: &ExtractorConfig) -> Self {
        let n_features = config.extractor_type.n_features();
        let pyramid = ScalePyramid::new(config.scale_factor, config.num_levels);
        let features_per_level = pyramid.features_per_level(n_features);
        Self {
            n_features,
            ini_th_fast: config.ini_th_fast,
            min_th_fast: config.min_th_fast.min(config.ini_th_fast),
            pyramid,
            features_per_level,
        }
    }

    /// Detect and distribute keypoints on one level. Coordinates stay in level pixels.
    fn detect_level(&self, image: &GrayImage, level: usize) -> Vec<KeyPoint> {
        let (w, h) = image.dimensions();
        let (w, h) = (w as usize, h as usize);
        let min_border = EDGE_THRESHOLD;
        if w <= 2 * min_border + 1 || h <= 2 * min_border + 1 {
            return Vec::new();
        }
        let (max_x, max_y) = (w - min_border, h - min_border);

        let scores = compute_scores(image, min_border, self.min_th_fast);

        let n_cols = ((max_x - min_border) / CELL_SIZE).max(1);
        let n_rows = ((max_y - min_border) / CELL_SIZE).max(1);
        let cell_w = (max_x - min_border + n_cols - 1) / n_cols;
        let cell_h = (max_y - min_border + n_rows - 1) / n_rows;

        let mut candidates = Vec::new();
        for row in 0..n_rows {
            let y0 = min_border + row * cell_h;
            let y1 = (y0 + cell_h).min(max_y);
            for col in 0..n_cols {
                let x0 = min_border + col * cell_w;
                let x1 = (x0 + cell_w).min(max_x);

                let found = collect_cell(&scores, x0, x1, y0, y1, self.ini_th_fast, level);
                if found.is_empty() {
                    candidates.extend(collect_cell(
                        &scores,
                        x0,
                        x1,
                        y0,
                        y1,
                        self.min_th_fast,
                        level,
                    ));
                } else {
                    candidates.extend(found);
                }
            }
        }

        distribute(
            candidates,
            min_border as f32,
            max_x as f32,
            min_border as f32,
            max_y as f32,
            self.features_per_level[level],
        )
    }

    /// Detect over the whole pyramid. `oriented` selects rotated descriptors.
    fn run(&self, image: &GrayImage, oriented: bool) -> ExtractedFeatures {
        let levels = build_pyramid(image, &self.pyramid);
        let mut out = ExtractedFeatures::default();

        for (level, level_image) in levels.iter().enumerate() {
            let mut keys = self.detect_level(level_image, level);
            if keys.is_empty() {
                continue;
            }

            let smoothed = imageops::blur(level_image, DESCRIPTOR_BLUR_SIGMA);
            let scale = self.pyramid.scale(level) as f32;

            for kp in keys.iter_mut() {
                let (x, y) = (kp.x as i32, kp.y as i32);
                kp.angle = if oriented { ic_angle(level_image, x, y) } else { 0.0 };
                let desc = compute_descriptor(&smoothed, x, y, kp.angle);

                kp.x *= scale;
                kp.y *= scale;
                kp.size = PATCH_SIZE as f32 * scale;
                out.keypoints.push(*kp);
                out.descriptors.push(desc);
            }
        }

        debug!(
            "[Extractor] {} keypoints (target {})",
            out.keypoints.len(),
            self.n_features
        );
        out
    }
}

fn collect_cell(
    scores: &super::fast::ScoreMap,
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
    threshold: u8,
    level: usize,
) -> Vec<KeyPoint> {
    let mut keys = Vec::new();
    for y in y0..y1 {
        for x in x0..x1 {
            if scores.is_local_max(x, y, threshold) {
                let mut kp = KeyPoint::new(x as f32, y as f32, level);
                kp.response = scores.get(x, y) as f32;
                keys.push(kp);
            }
        }
    }
    keys
}

/// FAST + oriented BRIEF.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    core: DetectorCore,
}

impl KeypointExtractor for OrbExtractor {
    fn extract(&self, image: &GrayImage) -> ExtractedFeatures {
        self.core.run(image, true)
    }

    fn pyramid(&self) -> &ScalePyramid {
        &self.core.pyramid
    }
}

/// FAST + upright BRIEF.
#[derive(Debug, Clone)]
pub struct BriefExtractor {
    core: DetectorCore,
}

impl KeypointExtractor for BriefExtractor {
    fn extract(&self, image: &GrayImage) -> ExtractedFeatures {
        self.core.run(image, false)
    }

    fn pyramid(&self) -> &ScalePyramid {
        &self.core.pyramid
    }
}

/// The extractor selected for a session.
#[derive(Debug, Clone)]
pub enum FeatureExtractor {
    Orb(OrbExtractor),
    Brief(BriefExtractor),
}

impl FeatureExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        let core = DetectorCore::new(config);
        match config.extractor_type {
            ExtractorType::FastOrb { .. } => FeatureExtractor::Orb(OrbExtractor { core }),
            ExtractorType::FastBrief { .. } => FeatureExtractor::Brief(BriefExtractor { core }),
        }
    }

    pub fn extract(&self, image: &GrayImage) -> ExtractedFeatures {
        match self {
            FeatureExtractor::Orb(e) => e.extract(image),
            FeatureExtractor::Brief(e) => e.extract(image),
        }
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        match self {
            FeatureExtractor::Orb(e) => e.pyramid(),
            FeatureExtractor::Brief(e) => e.pyramid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::textured_image;
    use image::Luma;

    #[test]
    fn test_extractor_type_names() {
        let t = ExtractorType::FastOrb { n_features: 2000 };
        assert_eq!(t.to_string(), "FAST-ORBS-2000");
        assert_eq!("FAST-BRIEF-1000".parse::<ExtractorType>(), Ok(ExtractorType::FastBrief { n_features: 1000 }));
        assert!("FAST-SURF-1000".parse::<ExtractorType>().is_err());
        assert!("FAST-ORBS-abc".parse::<ExtractorType>().is_err());
        for preset in ExtractorType::PRESETS {
            assert_eq!(preset.to_string().parse::<ExtractorType>(), Ok(preset));
        }
    }

    #[test]
    fn test_compatibility_follows_descriptor_family() {
        let a = ExtractorType::FastOrb { n_features: 1000 };
        let b = ExtractorType::FastOrb { n_features: 4000 };
        let c = ExtractorType::FastBrief { n_features: 1000 };
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn test_blank_image_yields_no_features() {
        let extractor = FeatureExtractor::new(&ExtractorConfig::default());
        let img = GrayImage::from_pixel(320, 240, Luma([128]));
        let out = extractor.extract(&img);
        assert!(out.is_empty());
    }

    #[test]
    fn test_tiny_image_does_not_panic() {
        let extractor = FeatureExtractor::new(&ExtractorConfig::default());
        let img = GrayImage::new(16, 16);
        assert!(extractor.extract(&img).is_empty());
    }

    #[test]
    fn test_textured_image_features_are_spread() {
        let extractor = FeatureExtractor::new(&ExtractorConfig::default());
        let img = textured_image(320, 240, 7);
        let out = extractor.extract(&img);
        assert_eq!(out.keypoints.len(), out.descriptors.len());
        assert!(out.len() > 300, "only {} keypoints", out.len());

        // Every image quadrant receives a fair share.
        let mut quadrants = [0usize; 4];
        for kp in &out.keypoints {
            let q = (kp.x >= 160.0) as usize + 2 * (kp.y >= 120.0) as usize;
            quadrants[q] += 1;
        }
        let min = *quadrants.iter().min().unwrap();
        assert!(min * 4 > out.len() / 4, "quadrants {:?}", quadrants);
        assert!(out.keypoints.iter().any(|k| k.octave > 0));
    }

    #[test]
    fn test_same_image_gives_same_features() {
        let extractor = FeatureExtractor::new(&ExtractorConfig::default());
        let img = textured_image(200, 160, 3);
        let a = extractor.extract(&img);
        let b = extractor.extract(&img);
        assert_eq!(a.keypoints, b.keypoints);
        assert_eq!(a.descriptors, b.descriptors);
    }
}
