//! Motion Estimation
//!
//! Block matching between two feature maps. Both maps are collapsed to their
//! channel mean, every block of the current map is searched for in the reference
//! map, and the winning displacement is written to all positions of the block.
//!
//! ## Offset convention
//!
//! Offsets are `[B, 2, h, w]`: channel 0 is the horizontal component `u`, channel 1
//! the vertical component `v`. A position `(x, y)` of the current map is predicted
//! by the reference at `(x - u, y - v)`, which is what
//! [`FeatureWarper::backward_warp`](super::warp::FeatureWarper::backward_warp)
//! samples.

use crate::error::{Error, Result};
use ndarray::{s, Array2, Array4, ArrayView2, Axis, Zip};
use rayon::prelude::*;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Default block size on the feature grid
pub const DEFAULT_BLOCK_SIZE: usize = 4;

/// Default search range on the feature grid
pub const DEFAULT_SEARCH_RANGE: usize = 2;

/// Minimum block size
pub const MIN_BLOCK_SIZE: usize = 1;

/// Cost added per unit of displacement; ties resolve towards zero motion
const MOTION_LAMBDA: f32 = 0.01;

// ─────────────────────────────────────────────────────────────────────────────
// Motion Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for block matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionConfig {
    /// Side length of the matching blocks
    pub block_size: usize,
    /// Maximum displacement searched in each direction
    pub search_range: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            search_range: DEFAULT_SEARCH_RANGE,
        }
    }
}

impl MotionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set block size
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(MIN_BLOCK_SIZE);
        self
    }

    /// Builder: set search range
    pub fn with_search_range(mut self, range: usize) -> Self {
        self.search_range = range;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Matcher
// ─────────────────────────────────────────────────────────────────────────────

/// Block-matching motion estimator over feature maps
#[derive(Debug, Clone, Default)]
pub struct BlockMatcher {
    config: MotionConfig,
}

impl BlockMatcher {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Dense offsets `[B, 2, h, w]` from `reference` to `current`
    pub fn estimate(&self, reference: &Array4<f32>, current: &Array4<f32>) -> Result<Array4<f32>> {
        if reference.shape() != current.shape() {
            return Err(Error::shape_mismatch(
                "BlockMatcher",
                reference.shape(),
                current.shape(),
            ));
        }
        let (batch, _, height, width) = current.dim();

        let fields: Vec<Array2<(i32, i32)>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let cur = channel_mean(current, b);
                let prev = channel_mean(reference, b);
                block_match(&cur, &prev, self.config.block_size, self.config.search_range)
            })
            .collect();

        let bs = self.config.block_size.max(MIN_BLOCK_SIZE);
        let mut offsets = Array4::zeros((batch, 2, height, width));
        for (b, field) in fields.iter().enumerate() {
            for y in 0..height {
                for x in 0..width {
                    let (u, v) = field[[y / bs, x / bs]];
                    offsets[[b, 0, y, x]] = u as f32;
                    offsets[[b, 1, y, x]] = v as f32;
                }
            }
        }
        Ok(offsets)
    }
}

fn channel_mean(x: &Array4<f32>, batch: usize) -> Array2<f32> {
    let item = x.index_axis(Axis(0), batch);
    item.mean_axis(Axis(0))
        .unwrap_or_else(|| Array2::zeros((item.shape()[1], item.shape()[2])))
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Matching Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Block-based motion search using Sum of Absolute Differences (SAD)
///
/// Returns one `(u, v)` per block on a `ceil(H / block) x ceil(W / block)` grid.
pub fn block_match(
    current: &Array2<f32>,
    reference: &Array2<f32>,
    block_size: usize,
    search_range: usize,
) -> Array2<(i32, i32)> {
    let (height, width) = current.dim();
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let grid_h = height.div_ceil(block_size);
    let grid_w = width.div_ceil(block_size);

    Array2::from_shape_fn((grid_h, grid_w), |(my, mx)| {
        search_best_match(
            current,
            reference,
            my * block_size,
            mx * block_size,
            block_size,
            search_range,
        )
    })
}

/// Search for the best matching block using SAD plus a small motion penalty
fn search_best_match(
    current: &Array2<f32>,
    reference: &Array2<f32>,
    block_y: usize,
    block_x: usize,
    block_size: usize,
    search_range: usize,
) -> (i32, i32) {
    let (height, width) = current.dim();

    let mut best_cost = f32::MAX;
    let mut best_dy = 0i32;
    let mut best_dx = 0i32;

    let search_range = search_range as i32;

    let by_end = (block_y + block_size).min(height);
    let bx_end = (block_x + block_size).min(width);
    let block_h = by_end - block_y;
    let block_w = bx_end - block_x;

    let current_block = current.slice(s![block_y..by_end, block_x..bx_end]);

    for dy in -search_range..=search_range {
        for dx in -search_range..=search_range {
            let ref_y = block_y as i32 + dy;
            let ref_x = block_x as i32 + dx;

            if ref_y < 0 || ref_x < 0 {
                continue;
            }

            let ref_y = ref_y as usize;
            let ref_x = ref_x as usize;

            if ref_y + block_h > height || ref_x + block_w > width {
                continue;
            }

            let ref_block = reference.slice(s![ref_y..ref_y + block_h, ref_x..ref_x + block_w]);

            let motion_cost = ((dy * dy + dx * dx) as f32).sqrt() * MOTION_LAMBDA;
            let total_cost = sad(&current_block, &ref_block) + motion_cost;

            if total_cost < best_cost {
                best_cost = total_cost;
                best_dy = dy;
                best_dx = dx;
            }
        }
    }

    // The block came from (x + dx, y + dy): motion is the negated displacement
    (-best_dx, -best_dy)
}

/// Sum of Absolute Differences between two blocks
pub fn sad(block1: &ArrayView2<f32>, block2: &ArrayView2<f32>) -> f32 {
    let mut sum = 0.0f32;

    Zip::from(block1).and(block2).for_each(|&a, &b| {
        sum += (a - b).abs();
    });

    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(h: usize, w: usize, shift_x: i32) -> Array4<f32> {
        Array4::from_shape_fn((1, 2, h, w), |(_, c, y, x)| {
            let xs = x as i32 - shift_x;
            ((xs * 7 + y as i32 * 13 + c as i32 * 3) % 17) as f32 / 17.0
        })
    }

    #[test]
    fn test_sad_identical_blocks() {
        let block = Array2::from_elem((4, 4), 0.5f32);
        assert_eq!(sad(&block.view(), &block.view()), 0.0);
    }

    #[test]
    fn test_sad_different_blocks() {
        let a = Array2::zeros((4, 4));
        let b = Array2::ones((4, 4));
        assert_eq!(sad(&a.view(), &b.view()), 16.0);
    }

    #[test]
    fn test_static_scene_has_zero_motion() {
        let frame = textured(8, 8, 0);
        let offsets = BlockMatcher::default().estimate(&frame, &frame).unwrap();
        assert_eq!(offsets.shape(), &[1, 2, 8, 8]);
        assert!(offsets.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shift_is_detected() {
        // current(x) = reference(x - 1): content moved one position right
        let reference = textured(8, 12, 0);
        let current = textured(8, 12, 1);
        let offsets = BlockMatcher::new(MotionConfig::new().with_block_size(4))
            .estimate(&reference, &current)
            .unwrap();
        // interior block
        assert_eq!(offsets[[0, 0, 4, 5]], 1.0);
        assert_eq!(offsets[[0, 1, 4, 5]], 0.0);
    }

    #[test]
    fn test_block_grid_covers_odd_sizes() {
        let a = Array2::zeros((5, 7));
        let field = block_match(&a, &a, 4, 1);
        assert_eq!(field.dim(), (2, 2));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = BlockMatcher::default()
            .estimate(&Array4::zeros((1, 2, 4, 4)), &Array4::zeros((1, 2, 4, 6)))
            .unwrap_err();
        assert!(err.is_shape_error());
    }
}
