//! Task decoder traits and registry

use super::{CodedFrame, ISRDecoder, ICDecoder, Representation, TaskPrediction};
use super::{VCMotionResidualDecoder, VCResidualDecoder, VSRResidualDecoder};
use crate::bitstream::BitstreamRecord;
use crate::entropy::EntropyModels;
use crate::error::{Error, Result};
use crate::params::Parameterized;
use ndarray::Array4;
use serde::Deserialize;
use std::fmt;

/// Registered decoder module names
pub const DECODER_MODULES: &[&str] = &[
    "ICDecoder",
    "VCResidualDecoder",
    "VCMotionResidualDecoder",
    "ISRDecoder",
    "VSRResidualDecoder",
];

/// What a compression decoder codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderInput {
    /// Raw features of the current frame
    Intra,
    /// Current features minus reference features
    Residual,
    /// Current features minus motion-aligned reference features
    MotionResidual,
}

/// Per-task head fed by the shared representation
pub trait TaskDecoder: Parameterized + EntropyModels + Send + Sync + fmt::Debug {
    /// Registry name
    fn module_name(&self) -> &'static str;

    /// Feature channels expected from the encoder
    fn in_channels(&self) -> usize;

    /// In-memory pass
    fn forward(&self, rep: &Representation) -> Result<TaskPrediction>;

    /// Bitstream capability; only compression heads have one
    fn as_frame_decoder(&self) -> Option<&dyn FrameDecoder> {
        None
    }
}

/// Compression head: crosses the bitstream boundary
pub trait FrameDecoder {
    /// What the content record holds
    fn input(&self) -> DecoderInput;

    /// Code one frame
    fn compress(&self, rep: &Representation) -> Result<CodedFrame>;

    /// Rebuild one frame from its content record; `reference` is the carried
    /// (possibly aligned) reference features of residual decoders
    fn decompress(&self, reference: Option<&Array4<f32>>, content: &BitstreamRecord) -> Result<Array4<f32>>;
}

/// Keyword arguments shared by every decoder module
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderKwargs {
    /// Feature channels produced by the encoder
    pub in_channels: usize,
}

impl Default for DecoderKwargs {
    fn default() -> Self {
        Self { in_channels: 64 }
    }
}

impl DecoderKwargs {
    fn parse(module: &str, kwargs: &serde_json::Value) -> Result<Self> {
        let parsed: Self = if kwargs.is_null() {
            Self::default()
        } else {
            serde_json::from_value(kwargs.clone())
                .map_err(|e| Error::invalid_config(format!("{} kwargs: {}", module, e)))?
        };
        if parsed.in_channels == 0 {
            return Err(Error::invalid_config(format!("{}: in_channels must be > 0", module)));
        }
        Ok(parsed)
    }
}

/// Create a task decoder by module name
pub fn create_decoder(module: &str, kwargs: &serde_json::Value) -> Result<Box<dyn TaskDecoder>> {
    let args = || DecoderKwargs::parse(module, kwargs);
    match module {
        "ICDecoder" => Ok(Box::new(ICDecoder::new(args()?.in_channels))),
        "VCResidualDecoder" => Ok(Box::new(VCResidualDecoder::new(args()?.in_channels))),
        "VCMotionResidualDecoder" => Ok(Box::new(VCMotionResidualDecoder::new(args()?.in_channels))),
        "ISRDecoder" => Ok(Box::new(ISRDecoder::new(args()?.in_channels))),
        "VSRResidualDecoder" => Ok(Box::new(VSRResidualDecoder::new(args()?.in_channels))),
        _ => Err(Error::unknown_capability("decoder", module, DECODER_MODULES)),
    }
}
