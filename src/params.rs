//! Named parameters and checkpoint state dicts
//!
//! Every transform exposes its learnable tensors under a dotted path
//! (`decoders.vc.compressor.gain`). A [`StateDict`] is the serialized form of those
//! tensors; it is stored as JSON.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// A tensor as stored in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    /// Dimensions
    pub shape: Vec<usize>,
    /// Row-major values
    pub data: Vec<f32>,
}

impl StoredTensor {
    /// Store a vector
    pub fn from_vector(values: &Array1<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: values.to_vec(),
        }
    }

    /// Store a matrix
    pub fn from_matrix(values: &Array2<f32>) -> Self {
        let (rows, cols) = values.dim();
        Self {
            shape: vec![rows, cols],
            data: values.iter().copied().collect(),
        }
    }
}

/// Read-only view of one parameter
#[derive(Debug, Clone, Copy)]
pub enum ParamRef<'a> {
    Vector(&'a Array1<f32>),
    Matrix(&'a Array2<f32>),
}

impl ParamRef<'_> {
    /// Parameter dimensions
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParamRef::Vector(v) => v.shape().to_vec(),
            ParamRef::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Copy into checkpoint form
    pub fn to_stored(&self) -> StoredTensor {
        match self {
            ParamRef::Vector(v) => StoredTensor::from_vector(v),
            ParamRef::Matrix(m) => StoredTensor::from_matrix(m),
        }
    }
}

/// Mutable handle to one parameter
#[derive(Debug)]
pub enum ParamMut<'a> {
    Vector(&'a mut Array1<f32>),
    Matrix(&'a mut Array2<f32>),
}

impl ParamMut<'_> {
    /// Parameter dimensions
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParamMut::Vector(v) => v.shape().to_vec(),
            ParamMut::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Overwrite with a stored tensor of the same shape
    fn assign(&mut self, tensor: &StoredTensor) -> bool {
        if tensor.shape != self.shape() {
            return false;
        }
        match self {
            ParamMut::Vector(v) => {
                **v = Array1::from(tensor.data.clone());
                true
            }
            ParamMut::Matrix(m) => {
                match Array2::from_shape_vec((tensor.shape[0], tensor.shape[1]), tensor.data.clone()) {
                    Ok(values) => {
                        **m = values;
                        true
                    }
                    Err(_) => false,
                }
            }
        }
    }
}

/// A module with named learnable tensors
pub trait Parameterized {
    /// Parameters keyed by their path relative to this module
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)>;

    /// Mutable parameters, same keys as [`Parameterized::named_parameters`]
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)>;

    /// Snapshot every parameter
    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        for (name, param) in self.named_parameters() {
            dict.insert(name, param.to_stored());
        }
        dict
    }
}

/// Prefix every name with `prefix.`
pub fn prefixed<T>(prefix: &str, params: Vec<(String, T)>) -> Vec<(String, T)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}.{}", prefix, name), p))
        .collect()
}

/// Checkpoint contents: tensors keyed by parameter path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: BTreeMap<String, StoredTensor>,
}

impl StateDict {
    /// Create an empty state dict
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: StoredTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Look up a tensor
    pub fn get(&self, name: &str) -> Option<&StoredTensor> {
        self.tensors.get(name)
    }

    /// Remove a tensor
    pub fn remove(&mut self, name: &str) -> Option<StoredTensor> {
        self.tensors.remove(name)
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// No tensors stored
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Write as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).map_err(|e| {
            Error::model_load_failed(path.display().to_string(), format!("serialize failed: {}", e))
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a JSON checkpoint
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::model_load_failed(path.display().to_string(), e.to_string())
        })?;
        serde_json::from_str(&json).map_err(|e| {
            Error::model_load_failed(path.display().to_string(), format!("invalid checkpoint: {}", e))
        })
    }
}

/// Outcome of loading a state dict
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Parameters that received checkpoint values
    pub loaded: Vec<String>,
    /// Parameters left at their defaults because the checkpoint lacks them
    pub missing: Vec<String>,
    /// Checkpoint entries without a matching parameter
    pub unexpected: Vec<String>,
    /// Entries skipped because the shapes disagree
    pub mismatched: Vec<String>,
}

impl LoadReport {
    /// Every parameter was loaded and nothing was left over
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Copy checkpoint tensors into a module
///
/// With `strict` any missing, unexpected or mis-shaped entry fails the whole load
/// before a single parameter is touched. Without it, matching entries are loaded
/// and everything else keeps its default initialization.
pub fn load_state_dict<M: Parameterized + ?Sized>(
    module: &mut M,
    dict: &StateDict,
    strict: bool,
) -> Result<LoadReport> {
    let mut params = module.named_parameters_mut();
    let names: BTreeSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();

    let mut report = LoadReport {
        unexpected: dict
            .keys()
            .filter(|k| !names.contains(k))
            .map(str::to_string)
            .collect(),
        ..LoadReport::default()
    };

    for (name, param) in params.iter() {
        match dict.get(name) {
            None => report.missing.push(name.clone()),
            Some(tensor) if tensor.shape != param.shape() => report.mismatched.push(name.clone()),
            Some(_) => {}
        }
    }

    if strict && !report.is_exact() {
        return Err(Error::CheckpointMismatch {
            missing: report.missing,
            unexpected: report.unexpected,
            mismatched: report.mismatched,
        });
    }

    for (name, param) in params.iter_mut() {
        if let Some(tensor) = dict.get(name) {
            if param.assign(tensor) {
                report.loaded.push(name.clone());
            }
        }
    }

    if !report.is_exact() {
        warn!(
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            mismatched = report.mismatched.len(),
            "partial checkpoint load"
        );
    }
    debug!(loaded = report.loaded.len(), strict, "state dict loaded");

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Linear {
        weight: Array2<f32>,
        bias: Array1<f32>,
    }

    impl Linear {
        fn new(out: usize, inp: usize) -> Self {
            Self {
                weight: Array2::zeros((out, inp)),
                bias: Array1::zeros(out),
            }
        }
    }

    impl Parameterized for Linear {
        fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
            vec![
                ("weight".to_string(), ParamRef::Matrix(&self.weight)),
                ("bias".to_string(), ParamRef::Vector(&self.bias)),
            ]
        }

        fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
            vec![
                ("weight".to_string(), ParamMut::Matrix(&mut self.weight)),
                ("bias".to_string(), ParamMut::Vector(&mut self.bias)),
            ]
        }
    }

    fn trained() -> StateDict {
        let mut source = Linear::new(2, 3);
        source.weight.fill(0.5);
        source.bias.fill(-1.0);
        source.state_dict()
    }

    #[test]
    fn test_state_dict_snapshot() {
        let dict = trained();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("weight").unwrap().shape, vec![2, 3]);
        assert_eq!(dict.get("bias").unwrap().data, vec![-1.0, -1.0]);
    }

    #[test]
    fn test_strict_load_exact_match() {
        let mut target = Linear::new(2, 3);
        let report = load_state_dict(&mut target, &trained(), true).unwrap();
        assert!(report.is_exact());
        assert_eq!(report.loaded.len(), 2);
        assert!(target.weight.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_strict_load_rejects_missing_without_touching() {
        let mut dict = trained();
        dict.remove("bias");
        let mut target = Linear::new(2, 3);
        let err = load_state_dict(&mut target, &dict, true).unwrap_err();
        assert!(err.is_model_error());
        assert!(target.weight.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_partial_load_skips_mismatch_and_extras() {
        let mut dict = trained();
        dict.insert("extra", StoredTensor::from_vector(&Array1::zeros(4)));
        let mut target = Linear::new(2, 4);
        let report = load_state_dict(&mut target, &dict, false).unwrap();
        assert_eq!(report.loaded, vec!["bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra".to_string()]);
        assert_eq!(report.mismatched, vec!["weight".to_string()]);
        assert!(target.weight.iter().all(|&v| v == 0.0));
        assert!(target.bias.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let dict = trained();
        dict.save(&path).unwrap();
        assert_eq!(StateDict::load(&path).unwrap(), dict);
    }

    #[test]
    fn test_load_missing_file_is_model_error() {
        let err = StateDict::load(Path::new("/nonexistent/checkpoint.json")).unwrap_err();
        assert!(err.is_model_error());
    }

    #[test]
    fn test_prefixed_names() {
        let names = prefixed("encoder", vec![("weight".to_string(), 1)]);
        assert_eq!(names[0].0, "encoder.weight");
    }
}
