//! Feature Warping Module
//!
//! Motion compensation on feature maps: each output position samples the
//! reference at its motion-displaced location (backward warping).
//!
//! For position `(x, y)` with offsets `(u, v)`:
//!
//! ```text
//!   sample_x = x - u(x, y)
//!   sample_y = y - v(x, y)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use ndarray::Array4;
//! use vsrvc::transforms::{BorderMode, FeatureWarper, WarpConfig};
//!
//! let warper = FeatureWarper::new(WarpConfig::default().with_border_mode(BorderMode::Zeros));
//! let reference = Array4::<f32>::ones((1, 4, 8, 8));
//! let offsets = Array4::<f32>::zeros((1, 2, 8, 8));
//! let aligned = warper.backward_warp(&reference, &offsets).unwrap();
//! assert_eq!(aligned, reference);
//! ```

use crate::error::{Error, Result};
use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use serde::Deserialize;

// -------------------------------------------------------------------------
// Interpolation Mode
// -------------------------------------------------------------------------

/// Interpolation method for sub-pixel sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Nearest neighbour
    Nearest,
    /// Bilinear (default)
    #[default]
    Bilinear,
}

/// Border handling for samples outside the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    /// Out-of-bounds samples read zero
    Zeros,
    /// Clamp to the nearest edge position (default)
    #[default]
    Replicate,
}

// -------------------------------------------------------------------------
// Warp Configuration
// -------------------------------------------------------------------------

/// Configuration for feature warping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarpConfig {
    /// Interpolation method for sub-pixel sampling
    pub interpolation: Interpolation,
    /// Border handling for out-of-bounds coordinates
    pub border_mode: BorderMode,
}

impl WarpConfig {
    /// Create a new warp configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set interpolation method
    pub fn with_interpolation(mut self, interp: Interpolation) -> Self {
        self.interpolation = interp;
        self
    }

    /// Builder: set border mode
    pub fn with_border_mode(mut self, mode: BorderMode) -> Self {
        self.border_mode = mode;
        self
    }
}

// -------------------------------------------------------------------------
// Feature Warper
// -------------------------------------------------------------------------

/// Backward warper for `[B, C, h, w]` feature maps
#[derive(Debug, Clone, Default)]
pub struct FeatureWarper {
    config: WarpConfig,
}

impl FeatureWarper {
    pub fn new(config: WarpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WarpConfig {
        &self.config
    }

    /// Warp `reference` with `offsets` (`[B, 2, h, w]`, channel 0 horizontal)
    ///
    /// Pure: the same inputs always give bit-identical output.
    pub fn backward_warp(&self, reference: &Array4<f32>, offsets: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = reference.dim();
        if offsets.dim() != (batch, 2, height, width) {
            return Err(Error::shape_mismatch(
                "FeatureWarper offsets",
                &[batch, 2, height, width],
                offsets.shape(),
            ));
        }

        let items: Vec<Array3<f32>> = (0..batch)
            .into_par_iter()
            .map(|b| {
                self.warp_item(
                    reference.index_axis(Axis(0), b),
                    offsets.index_axis(Axis(0), b),
                )
            })
            .collect();

        let mut output = Array4::zeros((batch, channels, height, width));
        for (b, item) in items.into_iter().enumerate() {
            output.index_axis_mut(Axis(0), b).assign(&item);
        }
        Ok(output)
    }

    fn warp_item(&self, reference: ArrayView3<f32>, offsets: ArrayView3<f32>) -> Array3<f32> {
        let (channels, height, width) = reference.dim();
        let mut output = Array3::zeros((channels, height, width));

        for c in 0..channels {
            let ref_slice = reference.slice(s![c, .., ..]);
            for y in 0..height {
                for x in 0..width {
                    let sample_x = x as f32 - offsets[[0, y, x]];
                    let sample_y = y as f32 - offsets[[1, y, x]];

                    output[[c, y, x]] = match self.config.interpolation {
                        Interpolation::Nearest => {
                            nearest_sample(&ref_slice, sample_y, sample_x, self.config.border_mode)
                        }
                        Interpolation::Bilinear => {
                            bilinear_sample(&ref_slice, sample_y, sample_x, self.config.border_mode)
                        }
                    };
                }
            }
        }

        output
    }
}

// -------------------------------------------------------------------------
// Sampling Functions
// -------------------------------------------------------------------------

fn nearest_sample(image: &ArrayView2<f32>, y: f32, x: f32, border_mode: BorderMode) -> f32 {
    let (height, width) = image.dim();
    let (yi, xi) = apply_border_mode(y.round() as i32, x.round() as i32, height, width, border_mode);
    safe_get(image, yi, xi)
}

/// Bilinear sample:
///   f(x, y) = f(0,0)(1-dx)(1-dy) + f(1,0)dx(1-dy) + f(0,1)(1-dx)dy + f(1,1)dx*dy
fn bilinear_sample(image: &ArrayView2<f32>, y: f32, x: f32, border_mode: BorderMode) -> f32 {
    let (height, width) = image.dim();

    let y0 = y.floor() as i32;
    let x0 = x.floor() as i32;
    let y1 = y0 + 1;
    let x1 = x0 + 1;

    let fy = y - y0 as f32;
    let fx = x - x0 as f32;

    let corner = |cy: i32, cx: i32| {
        let (by, bx) = apply_border_mode(cy, cx, height, width, border_mode);
        safe_get(image, by, bx)
    };

    let v00 = corner(y0, x0);
    let v01 = corner(y0, x1);
    let v10 = corner(y1, x0);
    let v11 = corner(y1, x1);

    v00 * (1.0 - fx) * (1.0 - fy) + v01 * fx * (1.0 - fy) + v10 * (1.0 - fx) * fy + v11 * fx * fy
}

/// Returns adjusted (y, x), or (-1, -1) for an out-of-bounds sample in zeros mode
fn apply_border_mode(y: i32, x: i32, height: usize, width: usize, mode: BorderMode) -> (i32, i32) {
    let h = height as i32;
    let w = width as i32;

    match mode {
        BorderMode::Zeros => {
            if y < 0 || y >= h || x < 0 || x >= w {
                (-1, -1)
            } else {
                (y, x)
            }
        }
        BorderMode::Replicate => (y.clamp(0, (h - 1).max(0)), x.clamp(0, (w - 1).max(0))),
    }
}

fn safe_get(image: &ArrayView2<f32>, y: i32, x: i32) -> f32 {
    if y < 0 || x < 0 {
        return 0.0;
    }
    image.get((y as usize, x as usize)).copied().unwrap_or(0.0)
}
