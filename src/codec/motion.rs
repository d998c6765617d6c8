//! Motion Codec
//!
//! Estimates offsets between two feature maps, codes them with their own entropy
//! sub-model and aligns the reference features with (decoded) offsets.
//!
//! ```text
//!   reference, current --BlockMatcher--> offsets --HyperpriorCompressor--> record
//!   record --decompress--> offsets --FeatureWarper(reference)--> aligned
//! ```

use crate::bitstream::BitstreamRecord;
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use crate::tensor::ensure_same_shape;
use crate::transforms::{BlockMatcher, FeatureWarper, MotionConfig, WarpConfig};
use ndarray::Array4;
use tracing::trace;

/// Channels of an offset field (horizontal, vertical)
pub const OFFSET_CHANNELS: usize = 2;

/// Quantization gain of the offsets: quarter-position precision
pub const MOTION_QUANT_GAIN: f32 = 4.0;

/// In-memory motion pass result
#[derive(Debug, Clone)]
pub struct MotionEstimate {
    /// Reference features aligned with the quantized offsets
    pub aligned: Array4<f32>,
    /// Estimated bits of the offset latent
    pub prior_bits: f64,
    /// Estimated bits of the offset side information
    pub hyperprior_bits: f64,
}

/// Motion estimator, offset entropy model and compensator
#[derive(Debug, Clone)]
pub struct MotionCodec {
    estimator: BlockMatcher,
    compressor: HyperpriorCompressor,
    compensator: FeatureWarper,
}

impl MotionCodec {
    pub fn new(motion: MotionConfig, warp: WarpConfig) -> Self {
        Self {
            estimator: BlockMatcher::new(motion),
            compressor: HyperpriorCompressor::with_gain(OFFSET_CHANNELS, MOTION_QUANT_GAIN),
            compensator: FeatureWarper::new(warp),
        }
    }

    pub fn motion_config(&self) -> &MotionConfig {
        self.estimator.config()
    }

    pub fn warp_config(&self) -> &WarpConfig {
        self.compensator.config()
    }

    /// Offsets `[B, 2, h, w]` from `reference` to `current`
    pub fn estimate(&self, reference: &Array4<f32>, current: &Array4<f32>) -> Result<Array4<f32>> {
        self.estimator.estimate(reference, current)
    }

    /// Estimate and code the offsets between two feature maps
    pub fn compress(&self, reference: &Array4<f32>, current: &Array4<f32>) -> Result<BitstreamRecord> {
        let offsets = self.estimate(reference, current)?;
        let record = self.compressor.compress(&offsets)?;
        trace!(bytes = record.num_bytes(), "motion compressed");
        Ok(record)
    }

    /// Decode offsets
    pub fn decompress(&self, record: &BitstreamRecord) -> Result<Array4<f32>> {
        if record.shape.channels != OFFSET_CHANNELS {
            return Err(Error::decoding_failed(format!(
                "motion record has {} channels, expected {}",
                record.shape.channels, OFFSET_CHANNELS
            )));
        }
        self.compressor.decompress(record)
    }

    /// Warp `reference` by `offsets`
    pub fn align_features(&self, reference: &Array4<f32>, offsets: &Array4<f32>) -> Result<Array4<f32>> {
        self.compensator.backward_warp(reference, offsets)
    }

    /// In-memory pass: estimate, quantize and align, with rate estimates
    pub fn forward(&self, reference: &Array4<f32>, current: &Array4<f32>) -> Result<MotionEstimate> {
        ensure_same_shape("MotionCodec::forward", reference, current)?;
        let offsets = self.estimate(reference, current)?;
        let rate = self.compressor.estimate(&offsets)?;
        Ok(MotionEstimate {
            aligned: self.align_features(reference, &rate.reconstruction)?,
            prior_bits: rate.prior_bits,
            hyperprior_bits: rate.hyperprior_bits,
        })
    }
}

impl Default for MotionCodec {
    fn default() -> Self {
        Self::new(MotionConfig::default(), WarpConfig::default())
    }
}

impl Parameterized for MotionCodec {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        prefixed("motion_compressor", self.compressor.named_parameters())
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        prefixed("motion_compressor", self.compressor.named_parameters_mut())
    }
}

impl EntropyModels for MotionCodec {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        vec![&self.compressor]
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        vec![&mut self.compressor]
    }
}
