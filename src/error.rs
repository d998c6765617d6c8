//! Error types for the VSRVC codec
//!
//! Every failure surfaces to the caller through [`Error`]. The variants are grouped
//! into the categories the orchestrator cares about: configuration problems found at
//! assembly time, calibration misuse, bitstream decode failures and tensor shape
//! contract violations.

use thiserror::Error;

/// Result type alias for VSRVC operations
pub type Result<T> = std::result::Result<T, Error>;

/// VSRVC error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration value
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for invalidity
        reason: String,
    },

    /// A predictive model description lacks a required `arch_args` entry
    #[error(
        "{key} key doesn't exist in arch_args. \
        Please provide it manually in the model description"
    )]
    MissingArchArg {
        /// Name of the missing key
        key: String,
    },

    /// Unrecognized `model_type`
    #[error("Unrecognized model_type '{model_type}'. Supported are {supported:?}")]
    UnknownModelType {
        /// The rejected model type
        model_type: String,
        /// Model types this build understands
        supported: Vec<String>,
    },

    /// A registry lookup by name failed
    #[error("Unknown {kind} '{name}'. Supported are {supported:?}")]
    UnknownCapability {
        /// Registry that was searched (encoder, decoder, weighting, architecture)
        kind: String,
        /// Requested name
        name: String,
        /// Names registered under this kind
        supported: Vec<String>,
    },

    /// The model description could not be parsed
    #[error("Invalid model description: {reason}")]
    InvalidDescription {
        /// Parser message
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Calibration Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Bitstream operation attempted before `update`
    #[error(
        "{component} is not calibrated. \
        Call update(force=true) before compress/decompress"
    )]
    NotCalibrated {
        /// Which entropy component refused
        component: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Entropy Coding / Decode Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Entropy coding error during encoding
    #[error("Entropy encoding error: {reason}")]
    EntropyEncodingFailed {
        /// Reason for failure
        reason: String,
    },

    /// Entropy coding error during decoding
    #[error("Entropy decoding error: {reason}")]
    EntropyDecodingFailed {
        /// Reason for failure
        reason: String,
    },

    /// Bitstream corrupted or truncated
    #[error("Bitstream corrupted at offset {offset}: {reason}")]
    BitstreamCorrupted {
        /// Byte offset where corruption was detected
        offset: usize,
        /// Reason for corruption detection
        reason: String,
    },

    /// A per-frame record does not match the frame's GOP role
    #[error("Record for frame {frame_index} does not match its role: {reason}")]
    RecordMismatch {
        /// Frame index
        frame_index: usize,
        /// What was expected
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Shape / Contract Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Tensor dimensions disagree
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Operation that detected the mismatch
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// A temporal window of the wrong length was supplied
    #[error("{context} expects a window of {expected} frame(s), got {actual}")]
    InvalidWindow {
        /// Operation that detected the problem
        context: String,
        /// Required number of frames
        expected: usize,
        /// Supplied number of frames
        actual: usize,
    },

    /// Wrong tensor rank
    #[error("{context} expects a {expected}-D tensor, got {actual}-D")]
    InvalidRank {
        /// Operation that detected the problem
        context: String,
        /// Required rank
        expected: usize,
        /// Supplied rank
        actual: usize,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Model / Checkpoint Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Strict checkpoint loading found missing, unexpected or mis-shaped entries
    #[error(
        "Checkpoint does not match model: missing {missing:?}, unexpected {unexpected:?}, \
        mismatched {mismatched:?}"
    )]
    CheckpointMismatch {
        /// Parameters the model has but the checkpoint lacks
        missing: Vec<String>,
        /// Checkpoint entries the model has no slot for
        unexpected: Vec<String>,
        /// Entries whose shapes disagree
        mismatched: Vec<String>,
    },

    /// Failed to load a model or checkpoint
    #[error("Failed to load model '{model_name}': {reason}")]
    ModelLoadFailed {
        /// Name or path of the model
        model_name: String,
        /// Reason for failure
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Generic Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Internal error (catch-all)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation not supported by this component
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a missing `arch_args` key error
    pub fn missing_arch_arg(key: impl Into<String>) -> Self {
        Error::MissingArchArg { key: key.into() }
    }

    /// Create an unknown capability error
    pub fn unknown_capability(kind: impl Into<String>, name: impl Into<String>, supported: &[&str]) -> Self {
        Error::UnknownCapability {
            kind: kind.into(),
            name: name.into(),
            supported: supported.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a not calibrated error
    pub fn not_calibrated(component: impl Into<String>) -> Self {
        Error::NotCalibrated {
            component: component.into(),
        }
    }

    /// Create an entropy encoding error
    pub fn encoding_failed(reason: impl Into<String>) -> Self {
        Error::EntropyEncodingFailed {
            reason: reason.into(),
        }
    }

    /// Create an entropy decoding error
    pub fn decoding_failed(reason: impl Into<String>) -> Self {
        Error::EntropyDecodingFailed {
            reason: reason.into(),
        }
    }

    /// Create a bitstream corrupted error
    pub fn bitstream_corrupted(offset: usize, reason: impl Into<String>) -> Self {
        Error::BitstreamCorrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a record mismatch error
    pub fn record_mismatch(frame_index: usize, reason: impl Into<String>) -> Self {
        Error::RecordMismatch {
            frame_index,
            reason: reason.into(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create an invalid window error
    pub fn invalid_window(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::InvalidWindow {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create an invalid rank error
    pub fn invalid_rank(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::InvalidRank {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Create a model load error
    pub fn model_load_failed(model_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ModelLoadFailed {
            model_name: model_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Error category checks
    // ─────────────────────────────────────────────────────────────────────────

    /// Check if this is a configuration error raised at assembly time
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::MissingArchArg { .. }
                | Error::UnknownModelType { .. }
                | Error::UnknownCapability { .. }
                | Error::InvalidDescription { .. }
        )
    }

    /// Check if this is a calibration error
    pub fn is_calibration_error(&self) -> bool {
        matches!(self, Error::NotCalibrated { .. })
    }

    /// Check if this is a bitstream decode error
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::EntropyDecodingFailed { .. }
                | Error::BitstreamCorrupted { .. }
                | Error::RecordMismatch { .. }
        )
    }

    /// Check if this is a shape or contract error
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Error::ShapeMismatch { .. } | Error::InvalidWindow { .. } | Error::InvalidRank { .. }
        )
    }

    /// Check if this is a model or checkpoint error
    pub fn is_model_error(&self) -> bool {
        matches!(
            self,
            Error::CheckpointMismatch { .. } | Error::ModelLoadFailed { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidDescription {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::missing_arch_arg("adaptation");
        assert!(err.to_string().contains("adaptation"));

        let err = Error::unknown_capability("weighting", "XYZ", &["EW", "GLS"]);
        let msg = err.to_string();
        assert!(msg.contains("XYZ"));
        assert!(msg.contains("EW"));
    }

    #[test]
    fn test_error_categories() {
        let config_err = Error::missing_arch_arg("keyframe_interval");
        assert!(config_err.is_config_error());
        assert!(!config_err.is_decode_error());

        let decode_err = Error::bitstream_corrupted(4, "truncated");
        assert!(decode_err.is_decode_error());
        assert!(!decode_err.is_config_error());

        let calib_err = Error::not_calibrated("GaussianConditional");
        assert!(calib_err.is_calibration_error());

        let shape_err = Error::invalid_window("ResidualEncoder", 2, 3);
        assert!(shape_err.is_shape_error());

        let model_err = Error::CheckpointMismatch {
            missing: vec!["encoder.weight".to_string()],
            unexpected: vec![],
            mismatched: vec![],
        };
        assert!(model_err.is_model_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "model.json");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_conversion_is_config_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert!(err.is_config_error());
    }
}
