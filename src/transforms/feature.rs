//! Feature extraction: frames to half-resolution feature maps

use crate::error::{Error, Result};
use crate::params::{ParamMut, ParamRef, Parameterized};
use crate::tensor::{avg_pool2, ensure_even_spatial, project_channels};
use ndarray::{Array1, Array2, Array4};

/// Stride-2 feature extractor
///
/// Pools every 2x2 neighbourhood and maps the input channels to `out_channels`
/// with a learned 1x1 projection. Default weights route output channel `o` to
/// input channel `o % in_channels`, so untrained features are a pooled copy of
/// the input.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl FeatureExtractor {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        let mut weight = Array2::zeros((out_channels, in_channels));
        if in_channels > 0 {
            for o in 0..out_channels {
                weight[[o, o % in_channels]] = 1.0;
            }
        }
        Self {
            weight,
            bias: Array1::zeros(out_channels),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    /// `[B, C_in, H, W] -> [B, C_out, H/2, W/2]`; H and W must be even
    pub fn extract(&self, frame: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, c, h, w) = frame.dim();
        if c != self.in_channels() {
            return Err(Error::shape_mismatch(
                "FeatureExtractor",
                &[b, self.in_channels(), h, w],
                frame.shape(),
            ));
        }
        ensure_even_spatial("FeatureExtractor", frame)?;
        project_channels(&avg_pool2(frame), &self.weight, &self.bias)
    }
}

impl Parameterized for FeatureExtractor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_shape_and_default_routing() {
        let extractor = FeatureExtractor::new(3, 5);
        let frame = Array4::from_shape_fn((2, 3, 4, 6), |(_, c, _, _)| c as f32 * 0.25);
        let features = extractor.extract(&frame).unwrap();
        assert_eq!(features.shape(), &[2, 5, 2, 3]);
        // channel 4 copies input channel 1
        assert!((features[[1, 4, 1, 2]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_extract_rejects_bad_input() {
        let extractor = FeatureExtractor::new(3, 4);
        assert!(extractor
            .extract(&Array4::zeros((1, 2, 4, 4)))
            .unwrap_err()
            .is_shape_error());
        assert!(extractor
            .extract(&Array4::zeros((1, 3, 5, 4)))
            .unwrap_err()
            .is_shape_error());
    }
}
