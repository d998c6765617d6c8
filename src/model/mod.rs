//! GOP orchestration over assembled models
//!
//! A model is an encoder, one decoder head per task and two multi-task
//! strategies ([`ModelCore`]), plus a GOP policy:
//!
//! - [`IFrameModel`] codes every frame independently
//! - [`PFrameModel`] codes keyframes with the keyframe model it owns and every
//!   other frame relative to the previous one, with or without motion
//!   compensation
//!
//! Per-video state (previous reconstruction, previous features) lives in local
//! variables of `compress`/`decompress`; models themselves only change through
//! [`Model::update`] and checkpoint loading.

pub mod iframe;
pub mod pframe;
pub mod strategy;

pub use iframe::IFrameModel;
pub use pframe::PFrameModel;
pub use strategy::{create_architecture, create_weighting, Architecture, Weighting};

use crate::bitstream::{BitstreamRecord, CompressedVideo, VcRecord};
use crate::codec::{Encoder, FrameDecoder, GopPolicy, TaskDecoder, TaskPrediction, COMPRESSION_TASK};
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use ndarray::{Array4, Array5};
use std::collections::HashSet;
use tracing::debug;

/// Components a [`ModelCore`] is built from
#[derive(Debug)]
pub struct ModelParts {
    pub task_name: Vec<String>,
    pub encoder: Box<dyn Encoder>,
    pub decoders: Vec<(String, Box<dyn TaskDecoder>)>,
    pub architecture: Box<dyn Architecture>,
    pub weighting: Box<dyn Weighting>,
    pub lmbda: f64,
    pub rep_grad: bool,
    pub multi_input: bool,
}

/// Encoder, task heads and strategies shared by every model type
#[derive(Debug)]
pub struct ModelCore {
    task_name: Vec<String>,
    encoder: Box<dyn Encoder>,
    decoders: Vec<Box<dyn TaskDecoder>>,
    architecture: Box<dyn Architecture>,
    weighting: Box<dyn Weighting>,
    lmbda: f64,
    rep_grad: bool,
    multi_input: bool,
}

impl ModelCore {
    /// Validate and assemble; decoders are reordered to task order
    pub fn new(parts: ModelParts) -> Result<Self> {
        let ModelParts {
            task_name,
            encoder,
            decoders,
            architecture,
            weighting,
            lmbda,
            rep_grad,
            multi_input,
        } = parts;

        let mut seen = HashSet::new();
        for task in &task_name {
            if !seen.insert(task.as_str()) {
                return Err(Error::invalid_config(format!("duplicate task '{}'", task)));
            }
        }
        if !seen.contains(COMPRESSION_TASK) {
            return Err(Error::invalid_config(format!(
                "task set {:?} lacks the compression task '{}'",
                task_name, COMPRESSION_TASK
            )));
        }

        let mut slots: Vec<Option<Box<dyn TaskDecoder>>> = task_name.iter().map(|_| None).collect();
        for (task, decoder) in decoders {
            let index = task_name.iter().position(|t| *t == task).ok_or_else(|| {
                Error::invalid_config(format!("decoder given for unknown task '{}'", task))
            })?;
            if slots[index].is_some() {
                return Err(Error::invalid_config(format!("task '{}' has two decoders", task)));
            }
            if decoder.in_channels() != encoder.out_channels() {
                return Err(Error::invalid_config(format!(
                    "decoder '{}' of task '{}' expects {} channels, encoder '{}' produces {}",
                    decoder.module_name(),
                    task,
                    decoder.in_channels(),
                    encoder.class_name(),
                    encoder.out_channels()
                )));
            }
            slots[index] = Some(decoder);
        }
        let decoders = slots
            .into_iter()
            .zip(&task_name)
            .map(|(slot, task)| {
                slot.ok_or_else(|| Error::invalid_config(format!("task '{}' has no decoder", task)))
            })
            .collect::<Result<Vec<_>>>()?;

        let core = Self {
            task_name,
            encoder,
            decoders,
            architecture,
            weighting,
            lmbda,
            rep_grad,
            multi_input,
        };
        if core.vc_decoder().as_frame_decoder().is_none() {
            return Err(Error::invalid_config(format!(
                "decoder '{}' of task '{}' cannot code a bitstream",
                core.vc_decoder().module_name(),
                COMPRESSION_TASK
            )));
        }
        debug!(
            tasks = ?core.task_name,
            encoder = core.encoder.class_name(),
            architecture = core.architecture.name(),
            weighting = core.weighting.name(),
            "model core assembled"
        );
        Ok(core)
    }

    /// Task names, in order
    pub fn tasks(&self) -> &[String] {
        &self.task_name
    }

    /// Task names other than the compression task, in order
    pub fn auxiliary_tasks(&self) -> Vec<&str> {
        self.task_name
            .iter()
            .map(String::as_str)
            .filter(|t| *t != COMPRESSION_TASK)
            .collect()
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    /// Decoder head of `task`
    pub fn decoder(&self, task: &str) -> Option<&dyn TaskDecoder> {
        self.task_name
            .iter()
            .position(|t| t == task)
            .map(|i| self.decoders[i].as_ref())
    }

    fn vc_decoder(&self) -> &dyn TaskDecoder {
        let index = self
            .task_name
            .iter()
            .position(|t| t == COMPRESSION_TASK)
            .unwrap_or(0);
        self.decoders[index].as_ref()
    }

    /// Bitstream side of the compression head
    pub fn vc(&self) -> Result<&dyn FrameDecoder> {
        self.vc_decoder()
            .as_frame_decoder()
            .ok_or_else(|| Error::internal("compression decoder lost its bitstream capability"))
    }

    pub fn architecture(&self) -> &dyn Architecture {
        self.architecture.as_ref()
    }

    pub fn weighting(&self) -> &dyn Weighting {
        self.weighting.as_ref()
    }

    /// Rate-distortion trade-off the model was trained with
    pub fn lmbda(&self) -> f64 {
        self.lmbda
    }

    pub fn rep_grad(&self) -> bool {
        self.rep_grad
    }

    pub fn multi_input(&self) -> bool {
        self.multi_input
    }

    /// Heads paired with their task names, in task order
    pub fn heads(&self) -> impl Iterator<Item = (&str, &dyn TaskDecoder)> {
        self.task_name
            .iter()
            .map(String::as_str)
            .zip(self.decoders.iter().map(|d| d.as_ref()))
    }

    /// In-memory pass over one window: every head runs `forward`
    pub fn forward(&self, window: &Array5<f32>) -> Result<Predictions> {
        let rep = self.encoder.forward(window)?;
        let mut entries = Vec::with_capacity(self.task_name.len());
        for (task, decoder) in self.heads() {
            let task_rep = self.architecture.prepare_rep(task, &rep);
            entries.push((task.to_string(), decoder.forward(task_rep)?));
        }
        Ok(Predictions { entries })
    }

    /// Combine per-task losses (task order) through the weighting strategy
    pub fn weighted_loss(&self, losses: &[f64]) -> Result<f64> {
        if losses.len() != self.task_name.len() {
            return Err(Error::shape_mismatch(
                "weighted_loss",
                &[self.task_name.len()],
                &[losses.len()],
            ));
        }
        self.weighting.combine(losses)
    }
}

impl Parameterized for ModelCore {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut params = prefixed("encoder", self.encoder.named_parameters());
        for (task, decoder) in self.task_name.iter().zip(&self.decoders) {
            params.extend(prefixed(
                &format!("decoders.{}", task),
                decoder.named_parameters(),
            ));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut params = prefixed("encoder", self.encoder.named_parameters_mut());
        for (task, decoder) in self.task_name.iter().zip(self.decoders.iter_mut()) {
            params.extend(prefixed(
                &format!("decoders.{}", task),
                decoder.named_parameters_mut(),
            ));
        }
        params
    }
}

impl EntropyModels for ModelCore {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        let mut models = self.encoder.entropy_models();
        for decoder in &self.decoders {
            models.extend(decoder.entropy_models());
        }
        models
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        let mut models = self.encoder.entropy_models_mut();
        for decoder in self.decoders.iter_mut() {
            models.extend(decoder.entropy_models_mut());
        }
        models
    }
}

/// Per-task outputs of a `forward` pass, in task order
#[derive(Debug, Clone)]
pub struct Predictions {
    entries: Vec<(String, TaskPrediction)>,
}

impl Predictions {
    pub fn get(&self, task: &str) -> Option<&TaskPrediction> {
        self.entries.iter().find(|(t, _)| t == task).map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskPrediction)> {
        self.entries.iter().map(|(t, p)| (t.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bits of every task, summed
    pub fn total_bits(&self) -> f64 {
        self.entries.iter().map(|(_, p)| p.total_bits()).sum()
    }
}

/// Compression record and auxiliary outputs of one independently coded frame
#[derive(Debug, Clone)]
pub struct KeyframeOutput {
    pub content: BitstreamRecord,
    pub auxiliary: Vec<(String, Array4<f32>)>,
}

/// A runnable model of any type
#[derive(Debug)]
pub enum Model {
    IFrame(IFrameModel),
    PFrame(PFrameModel),
}

impl Model {
    /// `model_type` string of the description this model was built from
    pub fn model_type(&self) -> &'static str {
        self.policy().model_type()
    }

    pub fn policy(&self) -> GopPolicy {
        match self {
            Model::IFrame(_) => GopPolicy::Independent,
            Model::PFrame(m) => m.policy(),
        }
    }

    pub fn core(&self) -> &ModelCore {
        match self {
            Model::IFrame(m) => m.core(),
            Model::PFrame(m) => m.core(),
        }
    }

    /// Code a `[B, N, 3, H, W]` video
    pub fn compress(&self, video: &Array5<f32>) -> Result<CompressedVideo> {
        match self {
            Model::IFrame(m) => m.compress(video),
            Model::PFrame(m) => m.compress(video),
        }
    }

    /// Rebuild a video from the records `compress` produced
    pub fn decompress(&self, records: &[VcRecord]) -> Result<Array5<f32>> {
        match self {
            Model::IFrame(m) => m.decompress(records),
            Model::PFrame(m) => m.decompress(records),
        }
    }

    /// In-memory pass over one window
    pub fn forward(&self, window: &Array5<f32>) -> Result<Predictions> {
        self.core().forward(window)
    }

    /// Combine per-task losses through the weighting strategy
    pub fn weighted_loss(&self, losses: &[f64]) -> Result<f64> {
        self.core().weighted_loss(losses)
    }

    /// Calibrate every entropy sub-model; true if any table changed
    pub fn update(&mut self, scale_table: Option<&[f32]>, force: bool, update_quantiles: bool) -> bool {
        match self {
            Model::IFrame(m) => m.update(scale_table, force, update_quantiles),
            Model::PFrame(m) => m.update(scale_table, force, update_quantiles),
        }
    }

    pub fn as_iframe(&self) -> Option<&IFrameModel> {
        match self {
            Model::IFrame(m) => Some(m),
            Model::PFrame(_) => None,
        }
    }

    pub fn as_pframe(&self) -> Option<&PFrameModel> {
        match self {
            Model::PFrame(m) => Some(m),
            Model::IFrame(_) => None,
        }
    }
}

impl Parameterized for Model {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        match self {
            Model::IFrame(m) => m.named_parameters(),
            Model::PFrame(m) => m.named_parameters(),
        }
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        match self {
            Model::IFrame(m) => m.named_parameters_mut(),
            Model::PFrame(m) => m.named_parameters_mut(),
        }
    }
}

impl EntropyModels for Model {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        match self {
            Model::IFrame(m) => m.entropy_models(),
            Model::PFrame(m) => m.entropy_models(),
        }
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        match self {
            Model::IFrame(m) => m.entropy_models_mut(),
            Model::PFrame(m) => m.entropy_models_mut(),
        }
    }
}

/// Builders shared by the model unit tests
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::codec::{create_decoder, create_encoder};
    use serde_json::json;

    pub const CHANNELS: usize = 6;

    pub fn parts(encoder: &str, encoder_kwargs: serde_json::Value, decoders: &[(&str, &str)]) -> ModelParts {
        ModelParts {
            task_name: decoders.iter().map(|(t, _)| t.to_string()).collect(),
            encoder: create_encoder(encoder, &encoder_kwargs).unwrap(),
            decoders: decoders
                .iter()
                .map(|(t, m)| {
                    (
                        t.to_string(),
                        create_decoder(m, &json!({"in_channels": CHANNELS})).unwrap(),
                    )
                })
                .collect(),
            architecture: create_architecture("HPS").unwrap(),
            weighting: create_weighting("EW").unwrap(),
            lmbda: 128.0,
            rep_grad: false,
            multi_input: false,
        }
    }

    pub fn iframe_model(with_sr: bool) -> IFrameModel {
        let mut decoders = vec![("vc", "ICDecoder")];
        if with_sr {
            decoders.push(("vsr", "ISRDecoder"));
        }
        let parts = parts("VSRVCEncoder", json!({"out_channels": CHANNELS}), &decoders);
        IFrameModel::new(ModelCore::new(parts).unwrap()).unwrap()
    }

    pub fn video(frames: usize) -> Array5<f32> {
        Array5::from_shape_fn((1, frames, 3, 8, 8), |(_, n, c, y, x)| {
            let xs = (x + n) % 8;
            ((xs * 7 + y * 3 + c * 5) % 11) as f32 / 11.0
        })
    }
}
