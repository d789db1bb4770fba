//! Intensity-centroid orientation and (rotated) BRIEF descriptors.
//!
//! The 256 test pairs are drawn once from an isotropic Gaussian
//! (σ = patch / 5, clipped to the 31×31 patch) with a fixed integer
//! generator, so descriptors are identical across builds and platforms.
//! Map files depend on that.

use std::sync::OnceLock;

use image::GrayImage;

use super::keypoint::{Descriptor, DESCRIPTOR_BYTES};

pub const PATCH_SIZE: i32 = 31;
pub const HALF_PATCH_SIZE: i32 = 15;
/// Pattern coordinates are clipped to ±PATTERN_RADIUS.
const PATTERN_RADIUS: i32 = 13;
const PATTERN_SEED: u64 = 0x0_5EED_0B5E_55ED;

/// (x1, y1, x2, y2) per test.
type Pattern = [[i8; 4]; DESCRIPTOR_BYTES * 8];

fn pattern() -> &'static Pattern {
    static PATTERN: OnceLock<Pattern> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state = PATTERN_SEED;
        let sigma = PATCH_SIZE as f64 / 5.0;
        let mut pattern = [[0i8; 4]; DESCRIPTOR_BYTES * 8];
        for test in pattern.iter_mut() {
            loop {
                let coords: [i8; 4] = std::array::from_fn(|_| {
                    let g = gaussian(&mut state) * sigma;
                    g.round().clamp(-PATTERN_RADIUS as f64, PATTERN_RADIUS as f64) as i8
                });
                // A test comparing a pixel with itself carries no information.
                if coords[0] != coords[2] || coords[1] != coords[3] {
                    *test = coords;
                    break;
                }
            }
        }
        pattern
    })
}

/// splitmix64 step.
fn next_u64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Approximately standard normal sample (Irwin–Hall, 12 uniforms).
fn gaussian(state: &mut u64) -> f64 {
    let mut sum = 0.0;
    for _ in 0..12 {
        sum += (next_u64(state) >> 11) as f64 / (1u64 << 53) as f64;
    }
    sum - 6.0
}

/// Half-widths of the circular patch per row offset.
fn umax() -> &'static [i32; (HALF_PATCH_SIZE + 1) as usize] {
    static UMAX: OnceLock<[i32; (HALF_PATCH_SIZE + 1) as usize]> = OnceLock::new();
    UMAX.get_or_init(|| {
        let mut umax = [0i32; (HALF_PATCH_SIZE + 1) as usize];
        let r = HALF_PATCH_SIZE as f64;
        for (v, u) in umax.iter_mut().enumerate() {
            let v = v as f64;
            *u = (r * r - v * v).max(0.0).sqrt().round() as i32;
        }
        umax
    })
}

/// Orientation in degrees from the intensity centroid of the circular patch.
///
/// `(x, y)` must be at least `HALF_PATCH_SIZE` pixels from the image border.
pub fn ic_angle(image: &GrayImage, x: i32, y: i32) -> f32 {
    let width = image.width() as i32;
    let data = image.as_raw();
    let at = |u: i32, v: i32| data[((y + v) * width + (x + u)) as usize] as i64;
    let umax = umax();

    let mut m01: i64 = 0;
    let mut m10: i64 = 0;

    for u in -HALF_PATCH_SIZE..=HALF_PATCH_SIZE {
        m10 += u as i64 * at(u, 0);
    }

    for v in 1..=HALF_PATCH_SIZE {
        let d = umax[v as usize];
        let mut v_sum: i64 = 0;
        for u in -d..=d {
            let below = at(u, v);
            let above = at(u, -v);
            v_sum += below - above;
            m10 += u as i64 * (below + above);
        }
        m01 += v as i64 * v_sum;
    }

    let angle = (m01 as f64).atan2(m10 as f64).to_degrees();
    (if angle < 0.0 { angle + 360.0 } else { angle }) as f32
}

/// Compute the descriptor at `(x, y)` of a smoothed level image.
///
/// `angle_deg` rotates the pattern; pass 0 for upright BRIEF. The caller
/// guarantees a border of at least 19 pixels.
pub fn compute_descriptor(smoothed: &GrayImage, x: i32, y: i32, angle_deg: f32) -> Descriptor {
    let width = smoothed.width() as i32;
    let data = smoothed.as_raw();
    let (sin, cos) = (angle_deg as f64).to_radians().sin_cos();

    let sample = |px: i8, py: i8| {
        let (px, py) = (px as f64, py as f64);
        let col = (px * cos - py * sin).round() as i32;
        let row = (px * sin + py * cos).round() as i32;
        data[((y + row) * width + (x + col)) as usize]
    };

    let mut desc = Descriptor::zeros();
    for (i, test) in pattern().iter().enumerate() {
        if sample(test[0], test[1]) < sample(test[2], test[3]) {
            desc.set_bit(i);
        }
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_pattern_is_deterministic_and_inside_patch() {
        let p = pattern();
        assert!(p
            .iter()
            .flatten()
            .all(|&c| (c as i32).abs() <= PATTERN_RADIUS));
        // Not degenerate: tests differ from each other.
        let distinct: std::collections::HashSet<_> = p.iter().collect();
        assert!(distinct.len() > 250);
    }

    #[test]
    fn test_ic_angle_points_towards_bright_side() {
        // Bright right half: centroid along +x, angle near 0 degrees.
        let mut img = GrayImage::from_pixel(64, 64, Luma([10]));
        for y in 0..64 {
            for x in 33..64 {
                img.put_pixel(x, y, Luma([200]));
            }
        }
        let a = ic_angle(&img, 32, 32);
        assert!(a < 5.0 || a > 355.0, "angle {}", a);

        // Bright bottom half: image y grows downwards, angle near 90.
        let mut img = GrayImage::from_pixel(64, 64, Luma([10]));
        for y in 33..64 {
            for x in 0..64 {
                img.put_pixel(x, y, Luma([200]));
            }
        }
        let a = ic_angle(&img, 32, 32);
        assert!((a - 90.0).abs() < 5.0, "angle {}", a);
    }

    #[test]
    fn test_descriptor_of_uniform_patch_is_zero() {
        let img = GrayImage::from_pixel(64, 64, Luma([77]));
        let d = compute_descriptor(&img, 32, 32, 45.0);
        assert_eq!(d, Descriptor::zeros());
    }
}
