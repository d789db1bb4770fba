//! Scale pyramid parameters and image pyramid construction.

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Per-level scale factors derived from `scale_factor` and `num_levels`.
///
/// Frames and keyframes carry a copy so that matching and map-point scale
/// prediction use the same numbers the extractor used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub num_levels: usize,
    pub log_scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        let num_levels = num_levels.max(1);
        let mut scale_factors = Vec::with_capacity(num_levels);
        let mut s = 1.0;
        for _ in 0..num_levels {
            scale_factors.push(s);
            s *= scale_factor;
        }
        let inv_scale_factors = scale_factors.iter().map(|s| 1.0 / s).collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s2| 1.0 / s2).collect();

        Self {
            scale_factor,
            num_levels,
            log_scale_factor: scale_factor.ln(),
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    #[inline]
    pub fn scale(&self, level: usize) -> f64 {
        self.scale_factors[level.min(self.num_levels - 1)]
    }

    #[inline]
    pub fn sigma2(&self, level: usize) -> f64 {
        self.level_sigma2[level.min(self.num_levels - 1)]
    }

    #[inline]
    pub fn inv_sigma2(&self, level: usize) -> f64 {
        self.inv_level_sigma2[level.min(self.num_levels - 1)]
    }

    /// Ratio between the finest and the coarsest level.
    pub fn max_scale(&self) -> f64 {
        self.scale_factors[self.num_levels - 1]
    }

    /// Keypoint budget per level: geometric series in `1/scale_factor`,
    /// the remainder going to the coarsest level.
    pub fn features_per_level(&self, n_features: usize) -> Vec<usize> {
        let factor = 1.0 / self.scale_factor;
        let denom = 1.0 - factor.powi(self.num_levels as i32);
        let mut per_level = Vec::with_capacity(self.num_levels);
        let mut desired = if denom.abs() < 1e-12 {
            n_features as f64 / self.num_levels as f64
        } else {
            n_features as f64 * (1.0 - factor) / denom
        };

        let mut sum = 0;
        for _ in 0..self.num_levels.saturating_sub(1) {
            let n = desired.round() as usize;
            per_level.push(n);
            sum += n;
            desired *= factor;
        }
        per_level.push(n_features.saturating_sub(sum));
        per_level
    }
}

/// Build the image pyramid. Level `l` has size `round(size / scale^l)`.
pub fn build_pyramid(image: &GrayImage, pyramid: &ScalePyramid) -> Vec<GrayImage> {
    let (w0, h0) = image.dimensions();
    let mut levels = Vec::with_capacity(pyramid.num_levels);
    levels.push(image.clone());

    for level in 1..pyramid.num_levels {
        let inv = pyramid.inv_scale_factors[level];
        let w = ((w0 as f64 * inv).round() as u32).max(1);
        let h = ((h0 as f64 * inv).round() as u32).max(1);
        let resized = imageops::resize(&levels[level - 1], w, h, FilterType::Triangle);
        levels.push(resized);
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scale_factors() {
        let p = ScalePyramid::new(1.2, 8);
        assert_eq!(p.scale_factors.len(), 8);
        assert_relative_eq!(p.scale(0), 1.0);
        assert_relative_eq!(p.scale(2), 1.44, epsilon = 1e-12);
        assert_relative_eq!(p.inv_sigma2(1), 1.0 / 1.44, epsilon = 1e-12);
        assert_relative_eq!(p.max_scale(), 1.2f64.powi(7), epsilon = 1e-12);
    }

    #[test]
    fn test_features_per_level_sums_to_target() {
        let p = ScalePyramid::new(1.2, 8);
        let levels = p.features_per_level(1000);
        assert_eq!(levels.iter().sum::<usize>(), 1000);
        assert!(levels[0] > levels[7]);
    }

    #[test]
    fn test_pyramid_sizes() {
        let p = ScalePyramid::new(1.2, 4);
        let img = GrayImage::new(120, 100);
        let levels = build_pyramid(&img, &p);
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[1].dimensions(), (100, 83));
    }
}
