//! Encoder implementations
//!
//! An encoder maps a window of frames `[B, N, 3, H, W]` to the [`Representation`]
//! shared by every task decoder. Three classes are registered:
//!
//! | class                        | window         | representation                        |
//! |------------------------------|----------------|---------------------------------------|
//! | `VSRVCEncoder`               | sliding window | current features                      |
//! | `VSRVCResidualEncoder`       | 2              | reference + current features          |
//! | `VSRVCMotionResidualEncoder` | 2              | aligned reference + current + motion  |

use super::{MotionCodec, MotionSideInfo, Representation};
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use crate::tensor::{flatten_window, frame_at, stack_frames};
use crate::transforms::{BorderMode, FeatureExtractor, Interpolation, MotionConfig, WarpConfig};
use ndarray::{Array4, Array5};
use serde::Deserialize;
use std::fmt;
use tracing::trace;

/// Registered encoder class names
pub const ENCODER_CLASSES: &[&str] = &[
    "VSRVCEncoder",
    "VSRVCResidualEncoder",
    "VSRVCMotionResidualEncoder",
];

/// Encoder trait for turning frame windows into representations
pub trait Encoder: Parameterized + EntropyModels + Send + Sync + fmt::Debug {
    /// Registry name
    fn class_name(&self) -> &'static str;

    /// Frames per input window
    fn window_size(&self) -> usize;

    /// Channels of the produced features
    fn out_channels(&self) -> usize;

    /// Features of a single frame
    fn extract_feats(&self, frame: &Array4<f32>) -> Result<Array4<f32>>;

    /// In-memory pass
    fn forward(&self, window: &Array5<f32>) -> Result<Representation>;

    /// Bitstream pass; `previous_reconstruction` replaces the first frame of the
    /// window as reference source when given
    fn compress(
        &self,
        window: &Array5<f32>,
        previous_reconstruction: Option<&Array4<f32>>,
    ) -> Result<Representation>;

    /// Motion codec, for motion-compensated encoders
    fn motion_codec(&self) -> Option<&MotionCodec> {
        None
    }
}

fn check_window(class: &str, window: &Array5<f32>, expected: usize) -> Result<()> {
    let frames = window.shape()[1];
    if frames != expected {
        return Err(Error::invalid_window(class, expected, frames));
    }
    Ok(())
}

fn parse_kwargs<T>(class: &str, kwargs: &serde_json::Value) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if kwargs.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(kwargs.clone())
        .map_err(|e| Error::invalid_config(format!("{} kwargs: {}", class, e)))
}

fn check_channels(class: &str, in_channels: usize, out_channels: usize) -> Result<()> {
    if in_channels == 0 || out_channels == 0 {
        return Err(Error::invalid_config(format!(
            "{}: channel counts must be > 0 (in {}, out {})",
            class, in_channels, out_channels
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Intra encoder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VSRVCEncoderKwargs {
    sliding_window: usize,
    in_channels: usize,
    out_channels: usize,
}

impl Default for VSRVCEncoderKwargs {
    fn default() -> Self {
        Self {
            sliding_window: 1,
            in_channels: 3,
            out_channels: 64,
        }
    }
}

/// Keyframe encoder over a sliding window of frames
///
/// The window is folded into channels before feature extraction, so the
/// extractor sees `3 * sliding_window` input channels.
#[derive(Debug, Clone)]
pub struct VSRVCEncoder {
    sliding_window: usize,
    feat_extractor: FeatureExtractor,
}

impl VSRVCEncoder {
    pub fn new(sliding_window: usize, in_channels: usize, out_channels: usize) -> Self {
        Self {
            sliding_window,
            feat_extractor: FeatureExtractor::new(in_channels * sliding_window, out_channels),
        }
    }

    pub fn sliding_window(&self) -> usize {
        self.sliding_window
    }
}

impl Encoder for VSRVCEncoder {
    fn class_name(&self) -> &'static str {
        "VSRVCEncoder"
    }

    fn window_size(&self) -> usize {
        self.sliding_window
    }

    fn out_channels(&self) -> usize {
        self.feat_extractor.out_channels()
    }

    fn extract_feats(&self, frame: &Array4<f32>) -> Result<Array4<f32>> {
        if self.sliding_window == 1 {
            return self.feat_extractor.extract(frame);
        }
        let repeated = vec![frame.clone(); self.sliding_window];
        self.feat_extractor
            .extract(&flatten_window(&stack_frames(&repeated)?)?)
    }

    fn forward(&self, window: &Array5<f32>) -> Result<Representation> {
        check_window(self.class_name(), window, self.sliding_window)?;
        let current = self.feat_extractor.extract(&flatten_window(window)?)?;
        let frame = frame_at(window, self.sliding_window - 1)?;
        Ok(Representation::intra(current, frame))
    }

    fn compress(
        &self,
        window: &Array5<f32>,
        previous_reconstruction: Option<&Array4<f32>>,
    ) -> Result<Representation> {
        if previous_reconstruction.is_some() {
            return Err(Error::not_supported(
                "VSRVCEncoder codes keyframes only and takes no previous reconstruction",
            ));
        }
        self.forward(window)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Residual encoders
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ResidualEncoderKwargs {
    in_channels: usize,
    out_channels: usize,
}

impl Default for ResidualEncoderKwargs {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 64,
        }
    }
}

/// Reference and current frames of a two-frame window, plus the current raw frame
struct PairFeatures {
    reference: Array4<f32>,
    current: Array4<f32>,
    frame: Array4<f32>,
}

fn pair_features(
    class: &str,
    extractor: &FeatureExtractor,
    window: &Array5<f32>,
    previous_reconstruction: Option<&Array4<f32>>,
) -> Result<PairFeatures> {
    check_window(class, window, 2)?;
    let frame = frame_at(window, 1)?;
    let reference = match previous_reconstruction {
        Some(recon) => extractor.extract(recon)?,
        None => extractor.extract(&frame_at(window, 0)?)?,
    };
    Ok(PairFeatures {
        reference,
        current: extractor.extract(&frame)?,
        frame,
    })
}

/// Predicted-frame encoder without motion compensation
#[derive(Debug, Clone)]
pub struct VSRVCResidualEncoder {
    feat_extractor: FeatureExtractor,
}

impl VSRVCResidualEncoder {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            feat_extractor: FeatureExtractor::new(in_channels, out_channels),
        }
    }
}

impl Encoder for VSRVCResidualEncoder {
    fn class_name(&self) -> &'static str {
        "VSRVCResidualEncoder"
    }

    fn window_size(&self) -> usize {
        2
    }

    fn out_channels(&self) -> usize {
        self.feat_extractor.out_channels()
    }

    fn extract_feats(&self, frame: &Array4<f32>) -> Result<Array4<f32>> {
        self.feat_extractor.extract(frame)
    }

    fn forward(&self, window: &Array5<f32>) -> Result<Representation> {
        self.compress(window, None)
    }

    fn compress(
        &self,
        window: &Array5<f32>,
        previous_reconstruction: Option<&Array4<f32>>,
    ) -> Result<Representation> {
        let pair = pair_features(
            self.class_name(),
            &self.feat_extractor,
            window,
            previous_reconstruction,
        )?;
        Ok(Representation {
            reference: Some(pair.reference),
            current: pair.current,
            frame: pair.frame,
            motion: None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MotionEncoderKwargs {
    in_channels: usize,
    out_channels: usize,
    block_size: usize,
    search_range: usize,
    interpolation: Interpolation,
    border_mode: BorderMode,
}

impl Default for MotionEncoderKwargs {
    fn default() -> Self {
        let motion = MotionConfig::default();
        Self {
            in_channels: 3,
            out_channels: 64,
            block_size: motion.block_size,
            search_range: motion.search_range,
            interpolation: Interpolation::default(),
            border_mode: BorderMode::default(),
        }
    }
}

/// Predicted-frame encoder with motion compensation
///
/// On the bitstream path the reference is aligned with the *decoded* offsets, the
/// same ones the decoder will warp with.
#[derive(Debug, Clone)]
pub struct VSRVCMotionResidualEncoder {
    feat_extractor: FeatureExtractor,
    motion: MotionCodec,
}

impl VSRVCMotionResidualEncoder {
    pub fn new(in_channels: usize, out_channels: usize, motion: MotionConfig, warp: WarpConfig) -> Self {
        Self {
            feat_extractor: FeatureExtractor::new(in_channels, out_channels),
            motion: MotionCodec::new(motion, warp),
        }
    }
}

impl Encoder for VSRVCMotionResidualEncoder {
    fn class_name(&self) -> &'static str {
        "VSRVCMotionResidualEncoder"
    }

    fn window_size(&self) -> usize {
        2
    }

    fn out_channels(&self) -> usize {
        self.feat_extractor.out_channels()
    }

    fn extract_feats(&self, frame: &Array4<f32>) -> Result<Array4<f32>> {
        self.feat_extractor.extract(frame)
    }

    fn forward(&self, window: &Array5<f32>) -> Result<Representation> {
        let pair = pair_features(self.class_name(), &self.feat_extractor, window, None)?;
        let estimate = self.motion.forward(&pair.reference, &pair.current)?;
        Ok(Representation {
            reference: Some(estimate.aligned),
            current: pair.current,
            frame: pair.frame,
            motion: Some(MotionSideInfo {
                record: None,
                prior_bits: estimate.prior_bits,
                hyperprior_bits: estimate.hyperprior_bits,
            }),
        })
    }

    fn compress(
        &self,
        window: &Array5<f32>,
        previous_reconstruction: Option<&Array4<f32>>,
    ) -> Result<Representation> {
        let pair = pair_features(
            self.class_name(),
            &self.feat_extractor,
            window,
            previous_reconstruction,
        )?;
        let record = self.motion.compress(&pair.reference, &pair.current)?;
        let offsets = self.motion.decompress(&record)?;
        let aligned = self.motion.align_features(&pair.reference, &offsets)?;
        trace!(motion_bytes = record.num_bytes(), "motion side information coded");
        Ok(Representation {
            reference: Some(aligned),
            current: pair.current,
            frame: pair.frame,
            motion: Some(MotionSideInfo {
                prior_bits: (record.prior.len() * 8) as f64,
                hyperprior_bits: (record.hyperprior.len() * 8) as f64,
                record: Some(record),
            }),
        })
    }

    fn motion_codec(&self) -> Option<&MotionCodec> {
        Some(&self.motion)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters and entropy models
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! extractor_only {
    ($ty:ty) => {
        impl Parameterized for $ty {
            fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
                prefixed("feat_extractor", self.feat_extractor.named_parameters())
            }

            fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
                prefixed("feat_extractor", self.feat_extractor.named_parameters_mut())
            }
        }

        impl EntropyModels for $ty {
            fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
                Vec::new()
            }

            fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
                Vec::new()
            }
        }
    };
}

extractor_only!(VSRVCEncoder);
extractor_only!(VSRVCResidualEncoder);

impl Parameterized for VSRVCMotionResidualEncoder {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut params = prefixed("feat_extractor", self.feat_extractor.named_parameters());
        params.extend(prefixed("motion", self.motion.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut params = prefixed("feat_extractor", self.feat_extractor.named_parameters_mut());
        params.extend(prefixed("motion", self.motion.named_parameters_mut()));
        params
    }
}

impl EntropyModels for VSRVCMotionResidualEncoder {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        self.motion.entropy_models()
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        self.motion.entropy_models_mut()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Create an encoder by class name
pub fn create_encoder(class: &str, kwargs: &serde_json::Value) -> Result<Box<dyn Encoder>> {
    match class {
        "VSRVCEncoder" => {
            let args: VSRVCEncoderKwargs = parse_kwargs(class, kwargs)?;
            check_channels(class, args.in_channels, args.out_channels)?;
            if args.sliding_window == 0 {
                return Err(Error::invalid_config("VSRVCEncoder: sliding_window must be >= 1"));
            }
            Ok(Box::new(VSRVCEncoder::new(
                args.sliding_window,
                args.in_channels,
                args.out_channels,
            )))
        }
        "VSRVCResidualEncoder" => {
            let args: ResidualEncoderKwargs = parse_kwargs(class, kwargs)?;
            check_channels(class, args.in_channels, args.out_channels)?;
            Ok(Box::new(VSRVCResidualEncoder::new(args.in_channels, args.out_channels)))
        }
        "VSRVCMotionResidualEncoder" => {
            let args: MotionEncoderKwargs = parse_kwargs(class, kwargs)?;
            check_channels(class, args.in_channels, args.out_channels)?;
            if args.block_size == 0 {
                return Err(Error::invalid_config(
                    "VSRVCMotionResidualEncoder: block_size must be >= 1",
                ));
            }
            let motion = MotionConfig::default()
                .with_block_size(args.block_size)
                .with_search_range(args.search_range);
            let warp = WarpConfig::new()
                .with_interpolation(args.interpolation)
                .with_border_mode(args.border_mode);
            Ok(Box::new(VSRVCMotionResidualEncoder::new(
                args.in_channels,
                args.out_channels,
                motion,
                warp,
            )))
        }
        _ => Err(Error::unknown_capability("encoder", class, ENCODER_CLASSES)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn video(frames: usize) -> Array5<f32> {
        Array5::from_shape_fn((1, frames, 3, 8, 8), |(_, n, c, y, x)| {
            (((x + n) * 7 + y * 3 + c * 5) % 11) as f32 / 11.0
        })
    }

    #[test]
    fn test_registry() {
        for class in ENCODER_CLASSES {
            let encoder = create_encoder(class, &json!({"out_channels": 6})).unwrap();
            assert_eq!(encoder.class_name(), *class);
            assert_eq!(encoder.out_channels(), 6);
        }
        let err = create_encoder("Transformer", &json!({})).unwrap_err();
        assert!(err.is_config_error());
        let err = create_encoder("VSRVCEncoder", &json!({"sliding_window": 0})).unwrap_err();
        assert!(err.is_config_error());
        let err = create_encoder("VSRVCEncoder", &json!({"layers": 2})).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_motion_encoder_warp_kwargs() {
        let encoder = create_encoder(
            "VSRVCMotionResidualEncoder",
            &json!({"interpolation": "nearest", "border_mode": "zeros"}),
        )
        .unwrap();
        assert_eq!(
            encoder.motion_codec().unwrap().warp_config(),
            &WarpConfig::new()
                .with_interpolation(Interpolation::Nearest)
                .with_border_mode(BorderMode::Zeros)
        );

        let defaults = create_encoder("VSRVCMotionResidualEncoder", &json!({})).unwrap();
        assert_eq!(defaults.motion_codec().unwrap().warp_config(), &WarpConfig::default());

        let err = create_encoder("VSRVCMotionResidualEncoder", &json!({"border_mode": "mirror"}))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_intra_window() {
        let encoder = VSRVCEncoder::new(1, 3, 6);
        let rep = encoder.forward(&video(1)).unwrap();
        assert_eq!(rep.current.shape(), &[1, 6, 4, 4]);
        assert_eq!(rep.frame.shape(), &[1, 3, 8, 8]);
        assert!(rep.reference.is_none());
        assert!(encoder.forward(&video(2)).unwrap_err().is_shape_error());

        let frame = frame_at(&video(1), 0).unwrap();
        assert!(encoder.compress(&video(1), Some(&frame)).is_err());
    }

    #[test]
    fn test_sliding_window_features() {
        let encoder = VSRVCEncoder::new(3, 3, 6);
        let rep = encoder.forward(&video(3)).unwrap();
        assert_eq!(rep.frame, frame_at(&video(3), 2).unwrap());
        let single = encoder.extract_feats(&rep.frame).unwrap();
        assert_eq!(single.shape(), rep.current.shape());
    }

    #[test]
    fn test_residual_reference_source() {
        let encoder = VSRVCResidualEncoder::new(3, 6);
        let v = video(2);
        let rep = encoder.compress(&v, None).unwrap();
        let first = frame_at(&v, 0).unwrap();
        assert_eq!(rep.reference.unwrap(), encoder.extract_feats(&first).unwrap());

        let recon = Array4::from_elem((1, 3, 8, 8), 0.5);
        let rep = encoder.compress(&v, Some(&recon)).unwrap();
        assert_eq!(rep.reference.unwrap(), encoder.extract_feats(&recon).unwrap());
        assert!(encoder.forward(&video(3)).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_motion_encoder_aligns_with_decoded_offsets() {
        let mut encoder = VSRVCMotionResidualEncoder::new(3, 3, MotionConfig::default(), WarpConfig::default());
        let v = video(2);
        assert!(encoder.compress(&v, None).unwrap_err().is_calibration_error());

        assert!(encoder.update_entropy_models(None, false, false));
        let rep = encoder.compress(&v, None).unwrap();
        let motion = rep.motion.as_ref().unwrap();
        let record = motion.record.as_ref().unwrap();
        assert_eq!(motion.prior_bits, (record.prior.len() * 8) as f64);

        let codec = encoder.motion_codec().unwrap();
        let reference = encoder.extract_feats(&frame_at(&v, 0).unwrap()).unwrap();
        let aligned = codec
            .align_features(&reference, &codec.decompress(record).unwrap())
            .unwrap();
        assert_eq!(rep.reference.unwrap(), aligned);
    }

    #[test]
    fn test_motion_forward_has_no_record() {
        let encoder = VSRVCMotionResidualEncoder::new(3, 3, MotionConfig::default(), WarpConfig::default());
        let rep = encoder.forward(&video(2)).unwrap();
        let motion = rep.motion.unwrap();
        assert!(motion.record.is_none());
        assert!(motion.prior_bits > 0.0);
    }

    #[test]
    fn test_parameter_names() {
        let encoder = VSRVCMotionResidualEncoder::new(3, 4, MotionConfig::default(), WarpConfig::default());
        let names: Vec<String> = encoder.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"feat_extractor.weight".to_string()));
        assert!(names.contains(&"motion.motion_compressor.gain".to_string()));
    }
}
