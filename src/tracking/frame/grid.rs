//! Spatial grid for fast keypoint lookup.

use crate::features::KeyPoint;

/// Spatial grid for O(1) feature lookup.
///
/// The grid divides the image into GRID_COLS × GRID_ROWS cells.
/// Each cell stores indices of features whose keypoints fall within that cell.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Stored as row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let grid_element_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];

        for (idx, kp) in keypoints.iter().enumerate() {
            let x = kp.x as f64;
            let y = kp.y as f64;
            // Undistortion can push keypoints slightly outside the image.
            if x < 0.0 || y < 0.0 || x >= img_width || y >= img_height {
                continue;
            }
            let cell_x = ((x * grid_element_width_inv) as usize).min(Self::GRID_COLS - 1);
            let cell_y = ((y * grid_element_height_inv) as usize).min(Self::GRID_ROWS - 1);
            cells[cell_y * Self::GRID_COLS + cell_x].push(idx);
        }

        Self {
            cells,
            grid_element_width_inv,
            grid_element_height_inv,
        }
    }

    /// Feature indices within radius `r` of `(x, y)`, optionally restricted
    /// to pyramid levels `min_level..=max_level`.
    pub fn get_features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let mut indices = Vec::new();

        let min_cell_x = ((x - r) * self.grid_element_width_inv).floor().max(0.0) as usize;
        let max_cell_x = ((x + r) * self.grid_element_width_inv).ceil();
        let min_cell_y = ((y - r) * self.grid_element_height_inv).floor().max(0.0) as usize;
        let max_cell_y = ((y + r) * self.grid_element_height_inv).ceil();
        if max_cell_x < 0.0 || max_cell_y < 0.0 {
            return indices;
        }
        let max_cell_x = (max_cell_x as usize).min(Self::GRID_COLS - 1);
        let max_cell_y = (max_cell_y as usize).min(Self::GRID_ROWS - 1);
        if min_cell_x > max_cell_x || min_cell_y > max_cell_y {
            return indices;
        }

        let r2 = r * r;
        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &idx in &self.cells[cell_y * Self::GRID_COLS + cell_x] {
                    let kp = &keypoints[idx];
                    if min_level.map_or(false, |l| kp.octave < l)
                        || max_level.map_or(false, |l| kp.octave > l)
                    {
                        continue;
                    }
                    let dx = kp.x as f64 - x;
                    let dy = kp.y as f64 - y;
                    if dx * dx + dy * dy <= r2 {
                        indices.push(idx);
                    }
                }
            }
        }
        indices
    }
}
