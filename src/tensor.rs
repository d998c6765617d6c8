//! Tensor helpers shared by the transforms and the orchestrator
//!
//! Videos travel as `Array5<f32>` shaped `[B, N, C, H, W]`; single frames and
//! feature maps as `Array4<f32>` shaped `[B, C, H, W]`.

use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, Array5, ArrayView3, Axis};
use rayon::prelude::*;

/// Take frame `index` out of a video as an owned `[B, C, H, W]` tensor
pub fn frame_at(video: &Array5<f32>, index: usize) -> Result<Array4<f32>> {
    let frames = video.shape()[1];
    if index >= frames {
        return Err(Error::invalid_window("frame_at", index + 1, frames));
    }
    Ok(video.index_axis(Axis(1), index).to_owned())
}

/// Take the frames `start..=end` as an owned window
pub fn window(video: &Array5<f32>, start: usize, end: usize) -> Result<Array5<f32>> {
    let frames = video.shape()[1];
    if start > end || end >= frames {
        return Err(Error::invalid_window("window", end + 1, frames));
    }
    Ok(video.slice(s![.., start..=end, .., .., ..]).to_owned())
}

/// Stack per-frame tensors along a new temporal axis (axis 1)
pub fn stack_frames(frames: &[Array4<f32>]) -> Result<Array5<f32>> {
    if frames.is_empty() {
        return Err(Error::invalid_window("stack_frames", 1, 0));
    }
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    ndarray::stack(Axis(1), &views).map_err(|_| {
        Error::shape_mismatch(
            "stack_frames",
            frames[0].shape(),
            frames
                .iter()
                .map(|f| f.shape())
                .find(|s| *s != frames[0].shape())
                .unwrap_or(frames[0].shape()),
        )
    })
}

/// Fold the temporal axis into channels: `[B, N, C, H, W] -> [B, N*C, H, W]`
pub fn flatten_window(window: &Array5<f32>) -> Result<Array4<f32>> {
    let (b, n, c, h, w) = window.dim();
    window
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((b, n * c, h, w))
        .map_err(|e| Error::internal(format!("flatten_window reshape failed: {}", e)))
}

/// Fail with a shape error unless both tensors have identical shapes
pub fn ensure_same_shape(context: &str, expected: &Array4<f32>, actual: &Array4<f32>) -> Result<()> {
    if expected.shape() != actual.shape() {
        return Err(Error::shape_mismatch(context, expected.shape(), actual.shape()));
    }
    Ok(())
}

/// Fail with a shape error unless the spatial dimensions are even
pub fn ensure_even_spatial(context: &str, x: &Array4<f32>) -> Result<()> {
    let (_, _, h, w) = x.dim();
    if h == 0 || w == 0 || h % 2 != 0 || w % 2 != 0 {
        return Err(Error::shape_mismatch(
            context,
            &[x.shape()[0], x.shape()[1], h + h % 2, w + w % 2],
            x.shape(),
        ));
    }
    Ok(())
}

/// 2x2 average pooling with stride 2; odd borders average the pixels present
pub fn avg_pool2(x: &Array4<f32>) -> Array4<f32> {
    let (b, c, h, w) = x.dim();
    let oh = h.div_ceil(2);
    let ow = w.div_ceil(2);
    let mut out = Array4::zeros((b, c, oh, ow));

    for ((bi, ci, y, xo), value) in out.indexed_iter_mut() {
        let y0 = y * 2;
        let x0 = xo * 2;
        let y1 = (y0 + 2).min(h);
        let x1 = (x0 + 2).min(w);
        let mut sum = 0.0f32;
        for sy in y0..y1 {
            for sx in x0..x1 {
                sum += x[[bi, ci, sy, sx]];
            }
        }
        *value = sum / ((y1 - y0) * (x1 - x0)) as f32;
    }

    out
}

/// 2x bilinear upsampling with half-pixel centres (`align_corners = false`)
pub fn upsample_bilinear2(x: &Array4<f32>) -> Array4<f32> {
    let (b, c, h, w) = x.dim();
    let th = h * 2;
    let tw = w * 2;
    let mut out = Array4::zeros((b, c, th, tw));
    if h == 0 || w == 0 {
        return out;
    }

    for ((bi, ci, y, xo), value) in out.indexed_iter_mut() {
        let src_y = ((y as f32 + 0.5) / 2.0 - 0.5).clamp(0.0, (h - 1) as f32);
        let src_x = ((xo as f32 + 0.5) / 2.0 - 0.5).clamp(0.0, (w - 1) as f32);

        let y0 = src_y.floor() as usize;
        let x0 = src_x.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let x1 = (x0 + 1).min(w - 1);

        let fy = src_y - y0 as f32;
        let fx = src_x - x0 as f32;

        let v00 = x[[bi, ci, y0, x0]];
        let v01 = x[[bi, ci, y0, x1]];
        let v10 = x[[bi, ci, y1, x0]];
        let v11 = x[[bi, ci, y1, x1]];

        *value = v00 * (1.0 - fx) * (1.0 - fy)
            + v01 * fx * (1.0 - fy)
            + v10 * (1.0 - fx) * fy
            + v11 * fx * fy;
    }

    out
}

/// Nearest-neighbour upsampling of a pooled map back onto a `height x width` grid
pub fn upsample_nearest_to(x: &Array4<f32>, height: usize, width: usize) -> Array4<f32> {
    let (b, c, h, w) = x.dim();
    let mut out = Array4::zeros((b, c, height, width));
    if h == 0 || w == 0 {
        return out;
    }
    for ((bi, ci, y, xo), value) in out.indexed_iter_mut() {
        *value = x[[bi, ci, (y / 2).min(h - 1), (xo / 2).min(w - 1)]];
    }
    out
}

/// Per-pixel linear map across channels (a 1x1 convolution)
///
/// `weight` is `[C_out, C_in]`, `bias` is `[C_out]`. Batch items are mapped in
/// parallel; every output element depends on one batch item only, so the result
/// does not depend on scheduling.
pub fn project_channels(
    x: &Array4<f32>,
    weight: &Array2<f32>,
    bias: &Array1<f32>,
) -> Result<Array4<f32>> {
    let (b, c_in, h, w) = x.dim();
    let (c_out, w_in) = weight.dim();
    if w_in != c_in {
        return Err(Error::shape_mismatch(
            "project_channels",
            &[b, w_in, h, w],
            x.shape(),
        ));
    }
    if bias.len() != c_out {
        return Err(Error::shape_mismatch("project_channels bias", &[c_out], bias.shape()));
    }

    let items: Vec<Result<Array3<f32>>> = (0..b)
        .into_par_iter()
        .map(|bi| {
            let item = x.index_axis(Axis(0), bi);
            let flat = item
                .to_shape((c_in, h * w))
                .map_err(|e| Error::internal(format!("project_channels reshape failed: {}", e)))?;
            let mut mapped = weight.dot(&flat);
            mapped += &bias.view().insert_axis(Axis(1));
            mapped
                .into_shape_with_order((c_out, h, w))
                .map_err(|e| Error::internal(format!("project_channels reshape failed: {}", e)))
        })
        .collect();

    let items = items.into_iter().collect::<Result<Vec<_>>>()?;
    if items.is_empty() {
        return Ok(Array4::zeros((0, c_out, h, w)));
    }
    let views: Vec<ArrayView3<f32>> = items.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| Error::internal(format!("project_channels stack failed: {}", e)))
}

/// Concatenate two feature maps along the channel axis
pub fn concat_channels(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
    ndarray::concatenate(Axis(1), &[a.view(), b.view()]).map_err(|_| {
        Error::shape_mismatch("concat_channels", a.shape(), b.shape())
    })
}
