//! Stateless tensor transforms
//!
//! Feature extraction, motion estimation, motion compensation and the output
//! heads. None of them holds per-frame state; the orchestrator threads previous
//! reconstructions and features explicitly.

pub mod feature;
pub mod head;
pub mod motion;
pub mod warp;

pub use feature::FeatureExtractor;
pub use head::{ReconstructionHead, SuperResolutionHead, OUTPUT_CHANNELS};
pub use motion::{block_match, sad, BlockMatcher, MotionConfig};
pub use warp::{BorderMode, FeatureWarper, Interpolation, WarpConfig};
