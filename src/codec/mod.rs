//! Codec components: encoders, task decoders, frame/motion codecs and GOP scheduling
//!
//! An [`Encoder`] turns a window of frames into a [`Representation`]. Each task of a
//! model owns one [`TaskDecoder`]; the compression task "vc" owns a decoder that
//! can also cross the bitstream boundary ([`FrameDecoder`]). Both kinds are
//! resolved by name through [`create_encoder`] and [`create_decoder`].

pub mod auxiliary;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod gop;
pub mod motion;

pub use auxiliary::{ISRDecoder, VSRResidualDecoder};
pub use decoder::{create_decoder, DecoderInput, FrameDecoder, TaskDecoder, DECODER_MODULES};
pub use encoder::{
    create_encoder, Encoder, VSRVCEncoder, VSRVCMotionResidualEncoder, VSRVCResidualEncoder,
    ENCODER_CLASSES,
};
pub use frame::{FrameCodec, ICDecoder, VCMotionResidualDecoder, VCResidualDecoder};
pub use gop::{FrameRole, GopConfig, GopPolicy, GopStatistics};
pub use motion::{MotionCodec, MotionEstimate, OFFSET_CHANNELS};

use crate::bitstream::BitstreamRecord;
use crate::error::{Error, Result};
use ndarray::Array4;

/// Name of the compression task
pub const COMPRESSION_TASK: &str = "vc";

/// Motion side information attached to a representation
#[derive(Debug, Clone)]
pub struct MotionSideInfo {
    /// Coded offsets; present on the bitstream path only
    pub record: Option<BitstreamRecord>,
    /// Bits of the offset latent (estimated, or actual on the bitstream path)
    pub prior_bits: f64,
    /// Bits of the offset side information
    pub hyperprior_bits: f64,
}

/// Encoder output shared by every task decoder
#[derive(Debug, Clone)]
pub struct Representation {
    /// Reference features: previous frame, or the motion-aligned previous frame
    pub reference: Option<Array4<f32>>,
    /// Features of the current frame
    pub current: Array4<f32>,
    /// Low-quality input frame (last frame of the window)
    pub frame: Array4<f32>,
    /// Motion side information
    pub motion: Option<MotionSideInfo>,
}

impl Representation {
    /// Intra representation: no reference, no motion
    pub fn intra(current: Array4<f32>, frame: Array4<f32>) -> Self {
        Self {
            reference: None,
            current,
            frame,
            motion: None,
        }
    }

    /// Reference features, or a window error naming `context`
    pub fn require_reference(&self, context: &str) -> Result<&Array4<f32>> {
        self.reference
            .as_ref()
            .ok_or_else(|| Error::invalid_window(context, 2, 1))
    }

    /// Motion side information, or an error naming `context`
    pub fn require_motion(&self, context: &str) -> Result<&MotionSideInfo> {
        self.motion
            .as_ref()
            .ok_or_else(|| Error::internal(format!("{} needs motion side information", context)))
    }
}

/// In-memory output of one task decoder
#[derive(Debug, Clone)]
pub struct TaskPrediction {
    /// Predicted frame
    pub output: Array4<f32>,
    /// Estimated bit terms; empty for tasks without a rate
    pub bits: Vec<f64>,
}

impl TaskPrediction {
    /// Sum of all bit terms
    pub fn total_bits(&self) -> f64 {
        self.bits.iter().sum()
    }
}

/// Bitstream output of the compression task for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedFrame {
    /// Feature or residual record
    pub content: BitstreamRecord,
    /// Coded motion, for motion-compensated frames
    pub motion: Option<BitstreamRecord>,
}
