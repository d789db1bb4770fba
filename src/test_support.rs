//! Synthetic scenes for tests.
//!
//! A [`Scene`] is three fronto-parallel textured bands at different depths,
//! stacked vertically and separated by flat gaps. A view at offset `d` is the
//! camera translated sideways by `d * FAR_DEPTH / fx`: the far band moves by
//! `d` pixels, the middle one by `1.5 d` and the near one by `2 d`. The bands
//! never occlude each other, so every feature keeps its descriptor.

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tracking::frame::CameraModel;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

/// Pinhole camera matching [`WIDTH`] × [`HEIGHT`] frames without distortion.
pub fn test_camera() -> CameraModel {
    CameraModel::pinhole(300.0, 300.0, 160.0, 120.0, WIDTH, HEIGHT)
}

/// Multi-scale block noise with overlaid rectangles: dense, distinctive corners.
pub fn textured_image(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut layers = Vec::new();
    for block in [3u32, 7, 17] {
        let cols = width / block + 1;
        let rows = height / block + 1;
        let values: Vec<u8> = (0..cols * rows).map(|_| rng.gen()).collect();
        layers.push((block, cols, values));
    }

    let mut img = GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0u32;
        for (block, cols, values) in &layers {
            acc += values[((y / block) * cols + x / block) as usize] as u32;
        }
        Luma([(acc / layers.len() as u32) as u8])
    });

    let n_rects = (width * height / 400) as usize;
    for _ in 0..n_rects {
        let w = rng.gen_range(3..14);
        let h = rng.gen_range(3..14);
        let x0 = rng.gen_range(0..width.saturating_sub(w).max(1));
        let y0 = rng.gen_range(0..height.saturating_sub(h).max(1));
        let v: u8 = if rng.gen_bool(0.5) {
            rng.gen_range(0..60)
        } else {
            rng.gen_range(195..=255)
        };
        for y in y0..(y0 + h).min(height) {
            for x in x0..(x0 + w).min(width) {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    img
}

/// Depth of the far band. The other bands sit at `FAR_DEPTH / gain`.
pub const FAR_DEPTH: f64 = 4.0;

/// `(first row, end row, pixel shift per unit of offset)`.
const BANDS: [(u32, u32, f64); 3] = [(0, 72, 2.0), (88, 152, 1.5), (168, 240, 1.0)];
const GAP_INTENSITY: u8 = 128;

pub struct Scene {
    textures: Vec<GrayImage>,
}

/// A layered scene wide enough for lateral motion up to `WIDTH / 2` offset.
pub fn world(seed: u64) -> Scene {
    let textures = (0..BANDS.len() as u64)
        .map(|b| textured_image(WIDTH * 2, HEIGHT, seed * 31 + b))
        .collect();
    Scene { textures }
}

/// Frame seen after a lateral camera motion of `offset_x` far-band pixels.
pub fn view(scene: &Scene, offset_x: u32) -> GrayImage {
    let mut img = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([GAP_INTENSITY]));
    for (texture, &(v0, v1, gain)) in scene.textures.iter().zip(&BANDS) {
        let shift = (offset_x as f64 * gain).round() as u32;
        for v in v0..v1 {
            for u in 0..WIDTH {
                let x = (u + shift).min(texture.width() - 1);
                img.put_pixel(u, v, *texture.get_pixel(x, v));
            }
        }
    }
    img
}

/// A texture-less frame.
pub fn blank() -> GrayImage {
    GrayImage::from_pixel(WIDTH, HEIGHT, Luma([128]))
}
