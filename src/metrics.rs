//! Quality metrics and task losses
//!
//! PSNR and SSIM over batches of images `[B, C, H, W]` or videos
//! `[B, N, C, H, W]` with values in `[0, 1]`, computed per batch item and then
//! aggregated. SSIM uses 8x8 blocks with a stride of 4.
//!
//! ```
//! use ndarray::Array4;
//! use vsrvc::metrics::{psnr, Aggregate};
//!
//! let a = Array4::<f32>::from_elem((2, 3, 8, 8), 0.5).into_dyn();
//! let b = a.mapv(|v| v + 0.1);
//! let value = psnr(&a, &b, Aggregate::Mean).unwrap().scalar().unwrap();
//! assert!((value - 20.0).abs() < 1e-3);
//! ```

use crate::codec::TaskPrediction;
use crate::error::{Error, Result};
use ndarray::{Array4, ArrayD, ArrayView2, ArrayViewD, Axis};

/// Signal peak of normalized frames
pub const DATA_RANGE: f64 = 1.0;

/// Upper clamp of reported PSNR values
pub const MAX_REPORTED_PSNR: f64 = 255.0;

const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const SSIM_BLOCK: usize = 8;
const SSIM_STRIDE: usize = 4;

/// How per-item values are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Mean,
    Sum,
    /// Keep one value per batch item
    None,
}

impl Aggregate {
    fn apply(self, values: Vec<f64>) -> MetricValue {
        match self {
            Aggregate::Mean => {
                let n = values.len().max(1) as f64;
                MetricValue::Scalar(values.iter().sum::<f64>() / n)
            }
            Aggregate::Sum => MetricValue::Scalar(values.iter().sum()),
            Aggregate::None => MetricValue::PerItem(values),
        }
    }
}

/// Result of an aggregated metric
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    PerItem(Vec<f64>),
}

impl MetricValue {
    pub fn scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::PerItem(_) => None,
        }
    }

    /// Values as a slice-like vector; a scalar becomes one element
    pub fn values(&self) -> Vec<f64> {
        match self {
            MetricValue::Scalar(v) => vec![*v],
            MetricValue::PerItem(v) => v.clone(),
        }
    }
}

fn check_pair(context: &str, input: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<()> {
    let rank = input.ndim();
    if rank != 4 && rank != 5 {
        return Err(Error::invalid_rank(context, 4, rank));
    }
    if input.shape() != target.shape() {
        return Err(Error::shape_mismatch(context, target.shape(), input.shape()));
    }
    Ok(())
}

fn mse(input: &ArrayViewD<f32>, target: &ArrayViewD<f32>) -> f64 {
    let n = input.len().max(1) as f64;
    input
        .iter()
        .zip(target.iter())
        .map(|(&a, &b)| {
            let d = a as f64 - b as f64;
            d * d
        })
        .sum::<f64>()
        / n
}

fn mse_to_psnr(mse: f64) -> f64 {
    if mse == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (DATA_RANGE * DATA_RANGE / mse).log10()
    }
}

/// Peak signal-to-noise ratio in dB, one value per batch item
pub fn psnr(input: &ArrayD<f32>, target: &ArrayD<f32>, aggregate: Aggregate) -> Result<MetricValue> {
    check_pair("psnr", input, target)?;
    let values = input
        .axis_iter(Axis(0))
        .zip(target.axis_iter(Axis(0)))
        .map(|(a, b)| mse_to_psnr(mse(&a, &b)))
        .collect();
    Ok(aggregate.apply(values))
}

/// Structural similarity, one value per batch item
///
/// A video item averages over its frames; an image item over its channels.
pub fn ssim(input: &ArrayD<f32>, target: &ArrayD<f32>, aggregate: Aggregate) -> Result<MetricValue> {
    check_pair("ssim", input, target)?;
    let (h, w) = (input.shape()[input.ndim() - 2], input.shape()[input.ndim() - 1]);
    let planes_per_item = input.len() / (input.shape()[0].max(1) * (h * w).max(1));

    let values = input
        .axis_iter(Axis(0))
        .zip(target.axis_iter(Axis(0)))
        .map(|(a, b)| {
            let a = a.to_shape((planes_per_item, h, w)).map(|v| v.to_owned());
            let b = b.to_shape((planes_per_item, h, w)).map(|v| v.to_owned());
            match (a, b) {
                (Ok(a), Ok(b)) => {
                    let total: f64 = a
                        .axis_iter(Axis(0))
                        .zip(b.axis_iter(Axis(0)))
                        .map(|(pa, pb)| ssim_plane(&pa, &pb))
                        .sum();
                    Ok(total / planes_per_item.max(1) as f64)
                }
                _ => Err(Error::internal("ssim reshape failed")),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(aggregate.apply(values))
}

/// Mean SSIM of one plane; planes smaller than a block use one whole-plane block
fn ssim_plane(reference: &ArrayView2<f32>, distorted: &ArrayView2<f32>) -> f64 {
    let (h, w) = reference.dim();
    let bh = SSIM_BLOCK.min(h);
    let bw = SSIM_BLOCK.min(w);
    if bh == 0 || bw == 0 {
        return 1.0;
    }
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);

    let mut total = 0.0;
    let mut count = 0usize;
    for y in (0..=h - bh).step_by(SSIM_STRIDE) {
        for x in (0..=w - bw).step_by(SSIM_STRIDE) {
            total += ssim_block(reference, distorted, y, x, bh, bw, c1, c2);
            count += 1;
        }
    }
    total / count.max(1) as f64
}

#[allow(clippy::too_many_arguments)]
fn ssim_block(
    reference: &ArrayView2<f32>,
    distorted: &ArrayView2<f32>,
    y: usize,
    x: usize,
    bh: usize,
    bw: usize,
    c1: f64,
    c2: f64,
) -> f64 {
    let mut ref_sum = 0.0;
    let mut dist_sum = 0.0;
    let mut ref_sq_sum = 0.0;
    let mut dist_sq_sum = 0.0;
    let mut ref_dist_sum = 0.0;
    for dy in 0..bh {
        for dx in 0..bw {
            let r = reference[[y + dy, x + dx]] as f64;
            let d = distorted[[y + dy, x + dx]] as f64;
            ref_sum += r;
            dist_sum += d;
            ref_sq_sum += r * r;
            dist_sq_sum += d * d;
            ref_dist_sum += r * d;
        }
    }
    let count = (bh * bw) as f64;
    let mu_ref = ref_sum / count;
    let mu_dist = dist_sum / count;
    let var_ref = ref_sq_sum / count - mu_ref * mu_ref;
    let var_dist = dist_sq_sum / count - mu_dist * mu_dist;
    let covar = ref_dist_sum / count - mu_ref * mu_dist;

    let numerator = (2.0 * mu_ref * mu_dist + c1) * (2.0 * covar + c2);
    let denominator = (mu_ref * mu_ref + mu_dist * mu_dist + c1) * (var_ref + var_dist + c2);
    numerator / denominator
}

/// Mean absolute error
pub fn l1(input: &Array4<f32>, target: &Array4<f32>) -> Result<f64> {
    if input.shape() != target.shape() {
        return Err(Error::shape_mismatch("l1", target.shape(), input.shape()));
    }
    let n = input.len().max(1) as f64;
    Ok(input
        .iter()
        .zip(target.iter())
        .map(|(&a, &b)| (a as f64 - b as f64).abs())
        .sum::<f64>()
        / n)
}

/// Bits per pixel of a `[B, _, H, W]` reconstruction
pub fn bpp(total_bits: f64, reconstruction: &Array4<f32>) -> f64 {
    let (b, _, h, w) = reconstruction.dim();
    let pixels = b * h * w;
    if pixels == 0 {
        return 0.0;
    }
    total_bits / pixels as f64
}

/// Distortion plus rate: `L1 + bpp / lmbda`
#[derive(Debug, Clone, Copy)]
pub struct RateDistortionLoss {
    pub lmbda: f64,
}

impl RateDistortionLoss {
    pub fn new(lmbda: f64) -> Self {
        Self { lmbda }
    }

    pub fn compute(&self, prediction: &TaskPrediction, target: &Array4<f32>) -> Result<f64> {
        let distortion = l1(&prediction.output, target)?;
        Ok(distortion + bpp(prediction.total_bits(), &prediction.output) / self.lmbda)
    }
}

/// Scaled L1 of a super-resolved frame
#[derive(Debug, Clone, Copy)]
pub struct SuperResolutionLoss {
    pub lmbda: f64,
}

impl SuperResolutionLoss {
    pub fn new(lmbda: f64) -> Self {
        Self { lmbda }
    }

    pub fn compute(&self, prediction: &Array4<f32>, target: &Array4<f32>) -> Result<f64> {
        Ok(self.lmbda * l1(prediction, target)?)
    }
}

/// Running, batch-weighted PSNR and SSIM
#[derive(Debug, Clone, Default)]
pub struct QualityMetrics {
    psnr_record: Vec<f64>,
    ssim_record: Vec<f64>,
    batch_sizes: Vec<usize>,
}

impl QualityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch
    pub fn update(&mut self, prediction: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<()> {
        let p = psnr(prediction, target, Aggregate::Mean)?.scalar().unwrap_or(0.0);
        let s = ssim(prediction, target, Aggregate::Mean)?.scalar().unwrap_or(0.0);
        self.psnr_record.push(p.clamp(0.0, MAX_REPORTED_PSNR));
        self.ssim_record.push(s.clamp(0.0, 1.0));
        self.batch_sizes.push(prediction.shape()[0]);
        Ok(())
    }

    /// `[psnr, ssim]`, each weighted by batch size
    pub fn score(&self) -> [f64; 2] {
        let total: usize = self.batch_sizes.iter().sum();
        if total == 0 {
            return [0.0, 0.0];
        }
        let weighted = |record: &[f64]| {
            record
                .iter()
                .zip(&self.batch_sizes)
                .map(|(v, &b)| v * b as f64)
                .sum::<f64>()
                / total as f64
        };
        [weighted(&self.psnr_record), weighted(&self.ssim_record)]
    }

    pub fn reinit(&mut self) {
        self.psnr_record.clear();
        self.ssim_record.clear();
        self.batch_sizes.clear();
    }
}

/// Quality of the compression task plus its mean bitrate
#[derive(Debug, Clone, Default)]
pub struct CompressionTaskMetrics {
    quality: QualityMetrics,
    bpp_record: Vec<f64>,
}

impl CompressionTaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, prediction: &TaskPrediction, target: &Array4<f32>) -> Result<()> {
        self.quality
            .update(&prediction.output.clone().into_dyn(), &target.clone().into_dyn())?;
        self.bpp_record
            .push(bpp(prediction.total_bits(), &prediction.output));
        Ok(())
    }

    /// `[psnr, ssim, bpp]`
    pub fn score(&self) -> [f64; 3] {
        let [p, s] = self.quality.score();
        let mean_bpp = if self.bpp_record.is_empty() {
            0.0
        } else {
            self.bpp_record.iter().sum::<f64>() / self.bpp_record.len() as f64
        };
        [p, s, mean_bpp]
    }

    pub fn reinit(&mut self) {
        self.quality.reinit();
        self.bpp_record.clear();
    }
}
