//! Model assembly from a declarative description
//!
//! A model directory holds a `model.json` description and, usually, a JSON
//! checkpoint next to it:
//!
//! ```json
//! {
//!   "model_type": "PFrameWithMotion",
//!   "task_name": ["vc", "vsr"],
//!   "encoder_class": "VSRVCMotionResidualEncoder",
//!   "decoders": [
//!     {"task": "vc", "module": "VCMotionResidualDecoder", "kwargs": {"in_channels": 64}},
//!     {"task": "vsr", "module": "VSRResidualDecoder", "kwargs": {"in_channels": 64}}
//!   ],
//!   "rep_grad": false,
//!   "multi_input": false,
//!   "lmbda": 128.0,
//!   "arch_args": {"iframe_model_path": "../iframe", "keyframe_interval": 8, "adaptation": true},
//!   "checkpoint": "model.ckpt.json",
//!   "weighting": "EW",
//!   "architecture": "HPS"
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the description.

use crate::codec::{create_decoder, create_encoder, GopConfig, GopPolicy};
use crate::error::{Error, Result};
use crate::model::{
    create_architecture, create_weighting, IFrameModel, Model, ModelCore, ModelParts, PFrameModel,
};
use crate::params::{load_state_dict, StateDict};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of a description inside a model directory
pub const MODEL_DESCRIPTION_FILE: &str = "model.json";

/// Supported `model_type` values
pub const MODEL_TYPES: &[&str] = &["IFrame", "PFrame", "PFrameWithMotion"];

/// One task head of a description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderDescription {
    pub task: String,
    pub module: String,
    #[serde(default)]
    pub kwargs: serde_json::Value,
}

/// Parsed `model.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub model_type: String,
    pub task_name: Vec<String>,
    pub encoder_class: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub encoder_kwargs: serde_json::Value,
    pub decoders: Vec<DecoderDescription>,
    #[serde(default)]
    pub rep_grad: bool,
    #[serde(default)]
    pub multi_input: bool,
    pub lmbda: f64,
    #[serde(default)]
    pub arch_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    pub weighting: String,
    pub architecture: String,
}

/// Required `arch_args` of a predictive model
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveArgs {
    pub iframe_model_path: PathBuf,
    pub keyframe_interval: usize,
    pub adaptation: bool,
}

impl ModelDescription {
    /// Parse a description
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a description file
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::model_load_failed(path.display().to_string(), e.to_string()))?;
        Self::from_json(&json)
    }

    /// Write as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Is this a predictive model type (`PFrame*`)?
    pub fn is_predictive(&self) -> bool {
        self.model_type.starts_with("PFrame")
    }

    /// GOP policy named by `model_type`
    pub fn policy(&self) -> Result<GopPolicy> {
        GopPolicy::from_model_type(&self.model_type).ok_or_else(|| Error::UnknownModelType {
            model_type: self.model_type.clone(),
            supported: MODEL_TYPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Required arguments of a predictive model, checked in a fixed order
    pub fn predictive_args(&self) -> Result<PredictiveArgs> {
        let arg = |key: &str| {
            self.arch_args
                .get(key)
                .ok_or_else(|| Error::missing_arch_arg(key))
        };
        let path = arg("iframe_model_path")?;
        let interval = arg("keyframe_interval")?;
        let adaptation = arg("adaptation")?;

        let iframe_model_path = path
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| Error::invalid_config("iframe_model_path must be a string"))?;
        let keyframe_interval = interval
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| Error::invalid_config("keyframe_interval must be a non-negative integer"))?;
        let adaptation = adaptation
            .as_bool()
            .ok_or_else(|| Error::invalid_config("adaptation must be a boolean"))?;

        Ok(PredictiveArgs {
            iframe_model_path,
            keyframe_interval,
            adaptation,
        })
    }

    /// Checkpoint path resolved against `base_dir`
    pub fn checkpoint_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.checkpoint.as_ref().map(|p| base_dir.join(p))
    }

    /// Everything checkable without building a tensor
    pub fn validate(&self) -> Result<()> {
        if self.is_predictive() {
            let args = self.predictive_args()?;
            GopConfig::new(args.keyframe_interval, args.adaptation).validate()?;
        }
        self.policy()?;
        Ok(())
    }

    fn core(&self) -> Result<ModelCore> {
        let encoder = create_encoder(&self.encoder_class, &self.encoder_kwargs)?;
        let decoders = self
            .decoders
            .iter()
            .map(|d| Ok((d.task.clone(), create_decoder(&d.module, &d.kwargs)?)))
            .collect::<Result<Vec<_>>>()?;
        ModelCore::new(ModelParts {
            task_name: self.task_name.clone(),
            encoder,
            decoders,
            architecture: create_architecture(&self.architecture)?,
            weighting: create_weighting(&self.weighting)?,
            lmbda: self.lmbda,
            rep_grad: self.rep_grad,
            multi_input: self.multi_input,
        })
    }
}

impl Model {
    /// Build an uncalibrated model with default parameters; a predictive model
    /// loads its keyframe model from disk, relative to `base_dir`
    pub fn from_description(description: &ModelDescription, base_dir: &Path) -> Result<Self> {
        description.validate()?;
        let policy = description.policy()?;
        let core = description.core()?;
        match policy {
            GopPolicy::Independent => Ok(Model::IFrame(IFrameModel::new(core)?)),
            GopPolicy::Predictive | GopPolicy::PredictiveWithMotion => {
                let args = description.predictive_args()?;
                let iframe_path = base_dir.join(&args.iframe_model_path);
                debug!(path = %iframe_path.display(), "loading keyframe model");
                let iframe_model = load_iframe_model(&iframe_path)?;
                let gop = GopConfig::new(args.keyframe_interval, args.adaptation);
                Ok(Model::PFrame(PFrameModel::new(core, iframe_model, gop, policy)?))
            }
        }
    }
}

/// `path` itself, or `path/model.json` when `path` is a directory
pub fn resolve_description_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MODEL_DESCRIPTION_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Load a model: parse, validate, assemble, load the checkpoint and calibrate
///
/// Checkpoints load strictly for `IFrame` and partially for `PFrame*` models.
/// Every entropy sub-model is calibrated with `update(None, true, false)` before
/// the model is returned.
pub fn load_model(path: impl AsRef<Path>) -> Result<Model> {
    let path = resolve_description_path(path.as_ref());
    let description = ModelDescription::from_file(&path)?;
    load_described(&path, &description)
}

fn load_iframe_model(path: &Path) -> Result<IFrameModel> {
    let path = resolve_description_path(path);
    let description = ModelDescription::from_file(&path)?;
    if description.model_type != "IFrame" {
        return Err(Error::invalid_config(format!(
            "iframe_model_path {} names a '{}' model, expected 'IFrame'",
            path.display(),
            description.model_type
        )));
    }
    match load_described(&path, &description)? {
        Model::IFrame(model) => Ok(model),
        Model::PFrame(_) => Err(Error::internal("IFrame description built a PFrame model")),
    }
}

fn load_described(path: &Path, description: &ModelDescription) -> Result<Model> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut model = Model::from_description(description, base_dir)?;

    match description.checkpoint_path(base_dir) {
        Some(checkpoint) => {
            let strict = !description.is_predictive();
            let dict = StateDict::load(&checkpoint)?;
            let report = load_state_dict(&mut model, &dict, strict)?;
            info!(
                checkpoint = %checkpoint.display(),
                loaded = report.loaded.len(),
                missing = report.missing.len(),
                strict,
                "checkpoint loaded"
            );
        }
        None => warn!(
            model = %path.display(),
            "no checkpoint given, parameters keep their initialization"
        ),
    }

    let updated = model.update(None, true, false);
    info!(
        model_type = description.model_type.as_str(),
        path = %path.display(),
        calibrated = updated,
        "model loaded"
    );
    Ok(model)
}
