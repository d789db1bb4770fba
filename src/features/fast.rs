//! FAST-9 segment test on a 16-pixel Bresenham circle.
//!
//! The score is the largest threshold for which the pixel still passes the
//! test, so a single score map serves both the initial and the fallback
//! threshold of cell-wise detection.

use image::GrayImage;

/// Circle offsets (dx, dy), clockwise from the top.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const ARC_LENGTH: usize = 9;

/// Dense FAST scores for a level image. Zero means "not a corner at `min_threshold`".
pub struct ScoreMap {
    pub width: usize,
    pub height: usize,
    scores: Vec<u8>,
}

impl ScoreMap {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.scores[y * self.width + x]
    }

    /// True if `(x, y)` scores above `threshold` and no 8-neighbor beats it.
    pub fn is_local_max(&self, x: usize, y: usize, threshold: u8) -> bool {
        let s = self.get(x, y);
        if s <= threshold {
            return false;
        }
        if x == 0 || y == 0 || x + 1 >= self.width || y + 1 >= self.height {
            return false;
        }
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = (x as i32 + dx) as usize;
                let ny = (y as i32 + dy) as usize;
                let n = self.get(nx, ny);
                // Ties broken towards the earlier pixel in raster order.
                if n > s || (n == s && (dy < 0 || (dy == 0 && dx < 0))) {
                    return false;
                }
            }
        }
        true
    }
}

/// Compute FAST scores inside `[border, size - border)`.
pub fn compute_scores(image: &GrayImage, border: usize, min_threshold: u8) -> ScoreMap {
    let (w, h) = image.dimensions();
    let (width, height) = (w as usize, h as usize);
    let mut scores = vec![0u8; width * height];
    let border = border.max(3);

    if width <= 2 * border || height <= 2 * border {
        return ScoreMap {
            width,
            height,
            scores,
        };
    }

    let data = image.as_raw();
    let offsets: [isize; 16] =
        std::array::from_fn(|i| CIRCLE[i].1 as isize * width as isize + CIRCLE[i].0 as isize);

    for y in border..height - border {
        for x in border..width - border {
            let idx = y * width + x;
            let c = data[idx] as i16;
            let t = min_threshold as i16;

            // Quick rejection: a 9-arc covers at least two of the four cardinal pixels.
            let mut bright = 0;
            let mut dark = 0;
            for k in [0usize, 4, 8, 12] {
                let p = data[(idx as isize + offsets[k]) as usize] as i16;
                if p > c + t {
                    bright += 1;
                } else if p < c - t {
                    dark += 1;
                }
            }
            if bright < 2 && dark < 2 {
                continue;
            }

            let diffs: [i16; 16] =
                std::array::from_fn(|k| data[(idx as isize + offsets[k]) as usize] as i16 - c);
            let score = segment_score(&diffs);
            if score > min_threshold as i16 {
                scores[idx] = score.min(255) as u8;
            }
        }
    }

    ScoreMap {
        width,
        height,
        scores,
    }
}

/// Max over all 9-arcs of the minimum absolute contrast along the arc,
/// for arcs that are uniformly brighter or uniformly darker.
fn segment_score(diffs: &[i16; 16]) -> i16 {
    let mut best = 0i16;
    for start in 0..16 {
        let mut min_bright = i16::MAX;
        let mut min_dark = i16::MAX;
        for k in 0..ARC_LENGTH {
            let d = diffs[(start + k) % 16];
            min_bright = min_bright.min(d);
            min_dark = min_dark.min(-d);
        }
        best = best.max(min_bright).max(min_dark);
    }
    best - 1
}
