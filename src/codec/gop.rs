//! GOP (Group of Pictures) scheduling
//!
//! A GOP is the run of frames between two keyframes. The schedule here is purely
//! periodic: frame `i` is a keyframe iff `i % keyframe_interval == 0`, so frame 0
//! always starts the first GOP.
//!
//! **Frame roles:**
//! - **Keyframe**: coded by the intra model, no dependencies
//! - **Predicted**: coded against the previous reconstruction
//!
//! **Policies:**
//! - `Independent`: every frame is a keyframe (IIII...)
//! - `Predictive`: residual coding against the previous frame's features (IPPP IPPP)
//! - `PredictiveWithMotion`: as `Predictive`, with a coded motion field aligning the
//!   reference first
//!
//! ## Usage
//!
//! ```rust
//! use vsrvc::codec::gop::{FrameRole, GopConfig};
//!
//! let config = GopConfig::default()
//!     .with_keyframe_interval(2)
//!     .with_adaptation(true);
//! config.validate().unwrap();
//!
//! assert_eq!(config.role_of(0), FrameRole::Keyframe);
//! assert_eq!(config.role_of(1), FrameRole::Predicted);
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Role of a frame inside the GOP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameRole {
    /// Intra-coded frame
    Keyframe,
    /// Frame predicted from the previous reconstruction
    Predicted,
}

impl FrameRole {
    /// Role of frame `index` under a periodic schedule
    ///
    /// `keyframe_interval` must be at least 1; [`GopConfig::validate`] enforces it
    /// for configured models. An interval of 0 is treated as 1.
    pub fn for_index(index: usize, keyframe_interval: usize) -> Self {
        if index % keyframe_interval.max(1) == 0 {
            FrameRole::Keyframe
        } else {
            FrameRole::Predicted
        }
    }

    /// Is this a keyframe?
    pub fn is_keyframe(&self) -> bool {
        matches!(self, FrameRole::Keyframe)
    }

    /// Get display name
    pub fn name(&self) -> &'static str {
        match self {
            FrameRole::Keyframe => "keyframe",
            FrameRole::Predicted => "predicted",
        }
    }
}

impl fmt::Display for FrameRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How predicted frames are coded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopPolicy {
    /// Every frame coded on its own
    Independent,
    /// Feature residual against the previous frame
    Predictive,
    /// Feature residual against the motion-aligned previous frame
    PredictiveWithMotion,
}

impl GopPolicy {
    /// Policy implied by a `model_type` string, if it names one
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "IFrame" => Some(GopPolicy::Independent),
            "PFrame" => Some(GopPolicy::Predictive),
            "PFrameWithMotion" => Some(GopPolicy::PredictiveWithMotion),
            _ => None,
        }
    }

    /// The `model_type` string of this policy
    pub fn model_type(&self) -> &'static str {
        match self {
            GopPolicy::Independent => "IFrame",
            GopPolicy::Predictive => "PFrame",
            GopPolicy::PredictiveWithMotion => "PFrameWithMotion",
        }
    }

    /// Predicted frames carry a motion record
    pub fn uses_motion(&self) -> bool {
        matches!(self, GopPolicy::PredictiveWithMotion)
    }

    /// Predicted frames exist at all
    pub fn is_predictive(&self) -> bool {
        !matches!(self, GopPolicy::Independent)
    }
}

/// GOP configuration of a predictive model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GopConfig {
    /// Distance between keyframes; 1 makes every frame a keyframe
    pub keyframe_interval: usize,
    /// Encoder predicts from its own re-decoded frames instead of the raw input
    pub adaptation: bool,
}

impl Default for GopConfig {
    fn default() -> Self {
        GopConfig {
            keyframe_interval: 8,
            adaptation: true,
        }
    }
}

impl GopConfig {
    /// Create a configuration
    pub fn new(keyframe_interval: usize, adaptation: bool) -> Self {
        GopConfig {
            keyframe_interval,
            adaptation,
        }
    }

    /// Set keyframe interval
    pub fn with_keyframe_interval(mut self, interval: usize) -> Self {
        self.keyframe_interval = interval;
        self
    }

    /// Enable or disable encoder-side adaptation
    pub fn with_adaptation(mut self, adaptation: bool) -> Self {
        self.adaptation = adaptation;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.keyframe_interval == 0 {
            return Err(Error::invalid_config("keyframe_interval must be >= 1"));
        }
        Ok(())
    }

    /// Role of frame `index`
    pub fn role_of(&self, index: usize) -> FrameRole {
        FrameRole::for_index(index, self.keyframe_interval)
    }

    /// Roles of the first `num_frames` frames
    pub fn schedule(&self, num_frames: usize) -> Vec<FrameRole> {
        (0..num_frames).map(|i| self.role_of(i)).collect()
    }

    /// Every frame a keyframe
    pub fn all_intra() -> Self {
        GopConfig {
            keyframe_interval: 1,
            adaptation: false,
        }
    }
}

/// Frame-role counts over a coded sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GopStatistics {
    /// Total frames
    pub total_frames: usize,
    /// Keyframes
    pub keyframes: usize,
    /// Predicted frames
    pub predicted_frames: usize,
}

impl GopStatistics {
    /// Count the roles of a sequence
    pub fn from_roles<I: IntoIterator<Item = FrameRole>>(roles: I) -> Self {
        let mut stats = GopStatistics::default();
        for role in roles {
            stats.total_frames += 1;
            match role {
                FrameRole::Keyframe => stats.keyframes += 1,
                FrameRole::Predicted => stats.predicted_frames += 1,
            }
        }
        stats
    }

    /// Average GOP length
    pub fn avg_gop_size(&self) -> f64 {
        if self.keyframes == 0 {
            return 0.0;
        }
        self.total_frames as f64 / self.keyframes as f64
    }

    pub fn summary(&self) -> String {
        format!(
            "GOP Statistics:\n\
             - Total Frames: {}\n\
             - Keyframes: {}\n\
             - Predicted Frames: {}\n\
             - Average GOP Size: {:.2}",
            self.total_frames,
            self.keyframes,
            self.predicted_frames,
            self.avg_gop_size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_is_keyframe() {
        for interval in 1..10 {
            assert!(FrameRole::for_index(0, interval).is_keyframe());
        }
    }

    #[test]
    fn test_keyframe_interval() {
        let config = GopConfig::default().with_keyframe_interval(2);
        assert_eq!(
            config.schedule(4),
            vec![
                FrameRole::Keyframe,
                FrameRole::Predicted,
                FrameRole::Keyframe,
                FrameRole::Predicted
            ]
        );
    }

    #[test]
    fn test_interval_one_is_all_intra() {
        let config = GopConfig::all_intra();
        assert!(config.schedule(5).iter().all(FrameRole::is_keyframe));
    }

    #[test]
    fn test_periodicity() {
        for interval in 1..7 {
            let config = GopConfig::new(interval, true);
            for i in 0..40 {
                assert_eq!(config.role_of(i).is_keyframe(), i % interval == 0);
            }
        }
    }

    #[test]
    fn test_gop_config_validation() {
        assert!(GopConfig::default().validate().is_ok());
        let err = GopConfig::default().with_keyframe_interval(0).validate().unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_policy_model_types() {
        for policy in [
            GopPolicy::Independent,
            GopPolicy::Predictive,
            GopPolicy::PredictiveWithMotion,
        ] {
            assert_eq!(GopPolicy::from_model_type(policy.model_type()), Some(policy));
        }
        assert_eq!(GopPolicy::from_model_type("BFrame"), None);
        assert!(GopPolicy::PredictiveWithMotion.uses_motion());
        assert!(!GopPolicy::Predictive.uses_motion());
        assert!(!GopPolicy::Independent.is_predictive());
    }

    #[test]
    fn test_gop_statistics() {
        let stats = GopStatistics::from_roles(GopConfig::new(3, true).schedule(7));
        assert_eq!(stats.total_frames, 7);
        assert_eq!(stats.keyframes, 3);
        assert_eq!(stats.predicted_frames, 4);
        assert!(stats.summary().contains("Keyframes: 3"));
    }
}
