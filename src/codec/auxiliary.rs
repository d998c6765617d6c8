//! Auxiliary task decoders (super-resolution)
//!
//! These heads never touch the bitstream: they own no entropy sub-model and
//! report no bit terms.

use super::decoder::TaskDecoder;
use super::{Representation, TaskPrediction};
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::Result;
use crate::params::{ParamMut, ParamRef, Parameterized};
use crate::tensor::concat_channels;
use crate::transforms::SuperResolutionHead;

/// Single-frame super-resolution from the current features
#[derive(Debug, Clone)]
pub struct ISRDecoder {
    head: SuperResolutionHead,
}

impl ISRDecoder {
    pub fn new(in_channels: usize) -> Self {
        Self {
            head: SuperResolutionHead::new(in_channels),
        }
    }
}

impl TaskDecoder for ISRDecoder {
    fn module_name(&self) -> &'static str {
        "ISRDecoder"
    }

    fn in_channels(&self) -> usize {
        self.head.in_channels()
    }

    fn forward(&self, rep: &Representation) -> Result<TaskPrediction> {
        Ok(TaskPrediction {
            output: self.head.upscale(&rep.current, &rep.frame)?,
            bits: Vec::new(),
        })
    }
}

/// Super-resolution from the reference and current features together
#[derive(Debug, Clone)]
pub struct VSRResidualDecoder {
    in_channels: usize,
    head: SuperResolutionHead,
}

impl VSRResidualDecoder {
    pub fn new(in_channels: usize) -> Self {
        Self {
            in_channels,
            head: SuperResolutionHead::new(2 * in_channels),
        }
    }
}

impl TaskDecoder for VSRResidualDecoder {
    fn module_name(&self) -> &'static str {
        "VSRResidualDecoder"
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(&self, rep: &Representation) -> Result<TaskPrediction> {
        let reference = rep.require_reference(self.module_name())?;
        let features = concat_channels(reference, &rep.current)?;
        Ok(TaskPrediction {
            output: self.head.upscale(&features, &rep.frame)?,
            bits: Vec::new(),
        })
    }
}

macro_rules! delegate_head {
    ($ty:ty) => {
        impl Parameterized for $ty {
            fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
                self.head.named_parameters()
            }

            fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
                self.head.named_parameters_mut()
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

delegate_head!(ISRDecoder);
delegate_head!(VSRResidualDecoder);
