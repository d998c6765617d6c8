//! VSRVC - GOP orchestration engine for a learned video codec
//!
//! VSRVC codes videos into per-frame bitstream records and reconstructs them,
//! with super-resolution as optional side tasks sharing the same encoder.
//!
//! # Architecture
//!
//! VSRVC is organized into several key modules:
//!
//! - `entropy`: scale-hyperprior entropy sub-model with ANS coding and calibration
//! - `transforms`: feature extraction, motion estimation/compensation, output heads
//! - `codec`: encoders, task decoders, frame and motion codecs, GOP scheduling
//! - `model`: Independent and Predictive (optionally motion-compensated) orchestration
//! - `loader`: model assembly from `model.json` descriptions and checkpoints
//! - `bitstream`: record types, stream framing and record persistence
//! - `metrics`: PSNR, SSIM, bitrate and task losses
//!
//! # Example
//!
//! ```no_run
//! use ndarray::Array5;
//!
//! let model = vsrvc::load_model("models/pframe")?;
//! let video = Array5::<f32>::zeros((1, 4, 3, 64, 64));
//! let compressed = model.compress(&video)?;
//! let decoded = model.decompress(compressed.records())?;
//! assert_eq!(decoded.shape(), video.shape());
//! # Ok::<(), vsrvc::Error>(())
//! ```

pub mod bitstream;
pub mod codec;
pub mod entropy;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod params;
pub mod tensor;
pub mod transforms;

pub use bitstream::{BitstreamRecord, CompressedVideo, LatentShape, VcRecord};
pub use codec::{FrameRole, GopConfig, GopPolicy};
pub use entropy::{EntropyModels, HyperpriorCompressor};
pub use error::{Error, Result};
pub use loader::{load_model, ModelDescription};
pub use model::{IFrameModel, Model, PFrameModel};
pub use params::{Parameterized, StateDict};

/// VSRVC version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Runtime configuration of the library
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Threads of the global rayon pool used inside transforms
    pub max_threads: Option<usize>,
    /// Enable verbose logging
    pub verbose: bool,
    /// Enable debug output
    pub debug: bool,
}

/// Initialize VSRVC with the given configuration
pub fn init(config: Config) -> Result<()> {
    if let Some(threads) = config.max_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| Error::invalid_config(format!("Failed to initialize thread pool: {}", e)))?;
    }

    if config.verbose || config.debug {
        let level = if config.debug { "debug" } else { "info" };
        // a subscriber installed by the host application wins
        let _ = tracing_subscriber::fmt()
            .with_env_filter(level)
            .try_init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION_MAJOR, 0);
        assert_eq!(VERSION_MINOR, 1);
        assert_eq!(VERSION_PATCH, 0);
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_threads, None);
        assert!(!config.verbose);
        assert!(!config.debug);
    }

    #[test]
    fn test_init() {
        assert!(init(Config::default()).is_ok());
        let verbose = Config {
            verbose: true,
            ..Config::default()
        };
        assert!(init(verbose.clone()).is_ok());
        assert!(init(verbose).is_ok());
    }
}
