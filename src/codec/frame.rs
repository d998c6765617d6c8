//! Frame Codec and the compression-task decoders
//!
//! A [`FrameCodec`] pairs one entropy sub-model with a reconstruction head. Three
//! decoders wrap it, differing in what they code:
//!
//! - [`ICDecoder`]: raw features of a keyframe
//! - [`VCResidualDecoder`]: features minus the previous frame's features
//! - [`VCMotionResidualDecoder`]: features minus the motion-aligned previous features

use super::decoder::{DecoderInput, FrameDecoder, TaskDecoder};
use super::{CodedFrame, Representation, TaskPrediction};
use crate::bitstream::BitstreamRecord;
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use crate::tensor::ensure_same_shape;
use crate::transforms::ReconstructionHead;
use ndarray::Array4;

// ─────────────────────────────────────────────────────────────────────────────
// Frame Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Entropy sub-model plus reconstruction head
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compressor: HyperpriorCompressor,
    reconstruction_head: ReconstructionHead,
}

impl FrameCodec {
    pub fn new(in_channels: usize) -> Self {
        Self {
            compressor: HyperpriorCompressor::new(in_channels),
            reconstruction_head: ReconstructionHead::new(in_channels),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.compressor.channels()
    }

    /// In-memory pass; returns the frame and `[prior_bits, hyperprior_bits]`
    pub fn forward(&self, x: &Array4<f32>, carried: Option<&Array4<f32>>) -> Result<(Array4<f32>, [f64; 2])> {
        let rate = self.compressor.estimate(x)?;
        let features = add_carried(rate.reconstruction, carried)?;
        let frame = self.reconstruction_head.reconstruct(&features)?;
        Ok((frame, [rate.prior_bits, rate.hyperprior_bits]))
    }

    /// Code a tensor; no reconstruction is computed
    pub fn compress(&self, x: &Array4<f32>) -> Result<BitstreamRecord> {
        self.compressor.compress(x)
    }

    /// Decoded features plus the carried baseline, before the head
    pub fn decode_features(&self, carried: Option<&Array4<f32>>, record: &BitstreamRecord) -> Result<Array4<f32>> {
        add_carried(self.compressor.decompress(record)?, carried)
    }

    /// Rebuild the frame
    pub fn decompress(&self, carried: Option<&Array4<f32>>, record: &BitstreamRecord) -> Result<Array4<f32>> {
        self.reconstruction_head
            .reconstruct(&self.decode_features(carried, record)?)
    }
}

fn add_carried(latent: Array4<f32>, carried: Option<&Array4<f32>>) -> Result<Array4<f32>> {
    match carried {
        Some(baseline) => {
            ensure_same_shape("FrameCodec carried baseline", baseline, &latent)?;
            Ok(latent + baseline)
        }
        None => Ok(latent),
    }
}

impl Parameterized for FrameCodec {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut params = prefixed("compressor", self.compressor.named_parameters());
        params.extend(prefixed(
            "reconstruction_head",
            self.reconstruction_head.named_parameters(),
        ));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut params = prefixed("compressor", self.compressor.named_parameters_mut());
        params.extend(prefixed(
            "reconstruction_head",
            self.reconstruction_head.named_parameters_mut(),
        ));
        params
    }
}

impl EntropyModels for FrameCodec {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        vec![&self.compressor]
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        vec![&mut self.compressor]
    }
}

macro_rules! delegate_codec {
    ($ty:ty) => {
        impl Parameterized for $ty {
            fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
                self.codec.named_parameters()
            }

            fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
                self.codec.named_parameters_mut()
            }
        }

        impl EntropyModels for $ty {
            fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
                self.codec.entropy_models()
            }

            fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
                self.codec.entropy_models_mut()
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Intra
// ─────────────────────────────────────────────────────────────────────────────

/// Keyframe decoder: codes the features themselves
#[derive(Debug, Clone)]
pub struct ICDecoder {
    codec: FrameCodec,
}

impl ICDecoder {
    pub fn new(in_channels: usize) -> Self {
        Self {
            codec: FrameCodec::new(in_channels),
        }
    }
}

delegate_codec!(ICDecoder);

impl TaskDecoder for ICDecoder {
    fn module_name(&self) -> &'static str {
        "ICDecoder"
    }

    fn in_channels(&self) -> usize {
        self.codec.in_channels()
    }

    fn forward(&self, rep: &Representation) -> Result<TaskPrediction> {
        let (output, bits) = self.codec.forward(&rep.current, None)?;
        Ok(TaskPrediction {
            output,
            bits: bits.to_vec(),
        })
    }

    fn as_frame_decoder(&self) -> Option<&dyn FrameDecoder> {
        Some(self)
    }
}

impl FrameDecoder for ICDecoder {
    fn input(&self) -> DecoderInput {
        DecoderInput::Intra
    }

    fn compress(&self, rep: &Representation) -> Result<CodedFrame> {
        Ok(CodedFrame {
            content: self.codec.compress(&rep.current)?,
            motion: None,
        })
    }

    fn decompress(&self, _reference: Option<&Array4<f32>>, content: &BitstreamRecord) -> Result<Array4<f32>> {
        self.codec.decompress(None, content)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Residual
// ─────────────────────────────────────────────────────────────────────────────

fn residual(rep: &Representation, context: &str) -> Result<(Array4<f32>, Array4<f32>)> {
    let reference = rep.require_reference(context)?;
    ensure_same_shape(context, reference, &rep.current)?;
    Ok((&rep.current - reference, reference.clone()))
}

/// Predicted-frame decoder: codes the feature residual
#[derive(Debug, Clone)]
pub struct VCResidualDecoder {
    codec: FrameCodec,
}

impl VCResidualDecoder {
    pub fn new(in_channels: usize) -> Self {
        Self {
            codec: FrameCodec::new(in_channels),
        }
    }
}

delegate_codec!(VCResidualDecoder);

impl TaskDecoder for VCResidualDecoder {
    fn module_name(&self) -> &'static str {
        "VCResidualDecoder"
    }

    fn in_channels(&self) -> usize {
        self.codec.in_channels()
    }

    fn forward(&self, rep: &Representation) -> Result<TaskPrediction> {
        let (res, reference) = residual(rep, self.module_name())?;
        let (output, bits) = self.codec.forward(&res, Some(&reference))?;
        Ok(TaskPrediction {
            output,
            bits: bits.to_vec(),
        })
    }

    fn as_frame_decoder(&self) -> Option<&dyn FrameDecoder> {
        Some(self)
    }
}

impl FrameDecoder for VCResidualDecoder {
    fn input(&self) -> DecoderInput {
        DecoderInput::Residual
    }

    fn compress(&self, rep: &Representation) -> Result<CodedFrame> {
        let (res, _) = residual(rep, self.module_name())?;
        Ok(CodedFrame {
            content: self.codec.compress(&res)?,
            motion: None,
        })
    }

    fn decompress(&self, reference: Option<&Array4<f32>>, content: &BitstreamRecord) -> Result<Array4<f32>> {
        let reference = reference.ok_or_else(|| {
            Error::invalid_window("VCResidualDecoder::decompress", 2, 1)
        })?;
        self.codec.decompress(Some(reference), content)
    }
}

/// Predicted-frame decoder over motion-aligned features
///
/// `forward` reports four bit terms: residual prior, residual hyperprior, motion
/// prior, motion hyperprior.
#[derive(Debug, Clone)]
pub struct VCMotionResidualDecoder {
    codec: FrameCodec,
}

impl VCMotionResidualDecoder {
    pub fn new(in_channels: usize) -> Self {
        Self {
            codec: FrameCodec::new(in_channels),
        }
    }
}

delegate_codec!(VCMotionResidualDecoder);

impl TaskDecoder for VCMotionResidualDecoder {
    fn module_name(&self) -> &'static str {
        "VCMotionResidualDecoder"
    }

    fn in_channels(&self) -> usize {
        self.codec.in_channels()
    }

    fn forward(&self, rep: &Representation) -> Result<TaskPrediction> {
        let motion = rep.require_motion(self.module_name())?;
        let (res, aligned) = residual(rep, self.module_name())?;
        let (output, [res_prior, res_hyperprior]) = self.codec.forward(&res, Some(&aligned))?;
        Ok(TaskPrediction {
            output,
            bits: vec![res_prior, res_hyperprior, motion.prior_bits, motion.hyperprior_bits],
        })
    }

    fn as_frame_decoder(&self) -> Option<&dyn FrameDecoder> {
        Some(self)
    }
}

impl FrameDecoder for VCMotionResidualDecoder {
    fn input(&self) -> DecoderInput {
        DecoderInput::MotionResidual
    }

    fn compress(&self, rep: &Representation) -> Result<CodedFrame> {
        let motion = rep
            .require_motion(self.module_name())?
            .record
            .clone()
            .ok_or_else(|| Error::internal("motion side information carries no record"))?;
        let (res, _) = residual(rep, self.module_name())?;
        Ok(CodedFrame {
            content: self.codec.compress(&res)?,
            motion: Some(motion),
        })
    }

    fn decompress(&self, reference: Option<&Array4<f32>>, content: &BitstreamRecord) -> Result<Array4<f32>> {
        let aligned = reference.ok_or_else(|| {
            Error::invalid_window("VCMotionResidualDecoder::decompress", 2, 1)
        })?;
        self.codec.decompress(Some(aligned), content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MotionSideInfo;

    fn features(seed: f32) -> Array4<f32> {
        Array4::from_shape_fn((1, 4, 4, 4), |(_, c, y, x)| {
            (seed + c as f32 * 0.3 + y as f32 * 0.11 + x as f32 * 0.07).sin() * 0.5 + 0.5
        })
    }

    fn frame() -> Array4<f32> {
        Array4::from_elem((1, 3, 8, 8), 0.5)
    }

    fn calibrate<T: EntropyModels>(mut decoder: T) -> T {
        decoder.update_entropy_models(None, true, false);
        decoder
    }

    #[test]
    fn test_frame_codec_forward_and_roundtrip() {
        let mut codec = FrameCodec::new(4);
        let x = features(0.0);
        let (estimated, bits) = codec.forward(&x, None).unwrap();
        assert_eq!(estimated.shape(), &[1, 3, 8, 8]);
        assert!(bits[0] > 0.0 && bits[1] > 0.0);

        codec.update_entropy_models(None, true, false);
        let record = codec.compress(&x).unwrap();
        assert_eq!(codec.decompress(None, &record).unwrap(), estimated);
    }

    #[test]
    fn test_carried_baseline_shape_is_checked() {
        let codec = calibrate(FrameCodec::new(4));
        let record = codec.compress(&features(0.0)).unwrap();
        let wrong = Array4::zeros((1, 4, 2, 2));
        assert!(codec.decompress(Some(&wrong), &record).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_intra_decoder() {
        let decoder = calibrate(ICDecoder::new(4));
        let rep = Representation::intra(features(0.0), frame());
        let coded = decoder.compress(&rep).unwrap();
        assert!(coded.motion.is_none());
        let recon = FrameDecoder::decompress(&decoder, None, &coded.content).unwrap();
        assert_eq!(recon, decoder.forward(&rep).unwrap().output);
    }

    #[test]
    fn test_residual_decoder_needs_reference() {
        let decoder = calibrate(VCResidualDecoder::new(4));
        let rep = Representation::intra(features(0.0), frame());
        assert!(decoder.forward(&rep).unwrap_err().is_shape_error());

        let rep = Representation {
            reference: Some(features(1.0)),
            ..rep
        };
        let coded = decoder.compress(&rep).unwrap();
        let recon = FrameDecoder::decompress(&decoder, rep.reference.as_ref(), &coded.content).unwrap();
        assert_eq!(recon, decoder.forward(&rep).unwrap().output);
        assert!(FrameDecoder::decompress(&decoder, None, &coded.content).is_err());
    }

    #[test]
    fn test_motion_residual_reports_four_terms() {
        let decoder = VCMotionResidualDecoder::new(4);
        let rep = Representation {
            reference: Some(features(1.0)),
            current: features(0.0),
            frame: frame(),
            motion: Some(MotionSideInfo {
                record: None,
                prior_bits: 12.0,
                hyperprior_bits: 3.0,
            }),
        };
        let prediction = decoder.forward(&rep).unwrap();
        assert_eq!(prediction.bits.len(), 4);
        assert_eq!(prediction.bits[2], 12.0);
        assert_eq!(prediction.bits[3], 3.0);

        // no coded motion on the in-memory representation
        let decoder = calibrate(decoder);
        assert!(decoder.compress(&rep).is_err());
    }
}
