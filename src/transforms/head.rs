//! Output heads: feature maps back to pixels

use crate::error::{Error, Result};
use crate::params::{ParamMut, ParamRef, Parameterized};
use crate::tensor::{project_channels, upsample_bilinear2};
use ndarray::{Array1, Array2, Array4};

/// Number of colour channels a head produces
pub const OUTPUT_CHANNELS: usize = 3;

/// Half-resolution features to a full-resolution frame
///
/// A 1x1 projection to three colour channels followed by 2x bilinear upsampling.
/// Untrained, output colour `k` is the mean of the feature channels `c` with
/// `c % 3 == k`.
#[derive(Debug, Clone)]
pub struct ReconstructionHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl ReconstructionHead {
    pub fn new(in_channels: usize) -> Self {
        let mut weight = Array2::zeros((OUTPUT_CHANNELS, in_channels));
        for k in 0..OUTPUT_CHANNELS {
            let members: Vec<usize> = (0..in_channels).filter(|c| c % OUTPUT_CHANNELS == k).collect();
            for &c in &members {
                weight[[k, c]] = 1.0 / members.len() as f32;
            }
        }
        Self {
            weight,
            bias: Array1::zeros(OUTPUT_CHANNELS),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    /// `[B, C, h, w] -> [B, 3, 2h, 2w]`
    pub fn reconstruct(&self, features: &Array4<f32>) -> Result<Array4<f32>> {
        Ok(upsample_bilinear2(&project_channels(features, &self.weight, &self.bias)?))
    }
}

impl Parameterized for ReconstructionHead {
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

/// 2x super-resolution head
///
/// Output is the bilinearly upsampled low-quality frame plus a detail term: the
/// features projected to colour and upsampled 4x. The detail projection starts at
/// zero.
#[derive(Debug, Clone)]
pub struct SuperResolutionHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl SuperResolutionHead {
    pub fn new(in_channels: usize) -> Self {
        Self {
            weight: Array2::zeros((OUTPUT_CHANNELS, in_channels)),
            bias: Array1::zeros(OUTPUT_CHANNELS),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    /// `features: [B, C, H/2, W/2]`, `frame: [B, 3, H, W]` to `[B, 3, 2H, 2W]`
    pub fn upscale(&self, features: &Array4<f32>, frame: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, _, h, w) = features.dim();
        let (fb, fc, fh, fw) = frame.dim();
        if fb != b || fc != OUTPUT_CHANNELS || fh != h * 2 || fw != w * 2 {
            return Err(Error::shape_mismatch(
                "SuperResolutionHead frame",
                &[b, OUTPUT_CHANNELS, h * 2, w * 2],
                frame.shape(),
            ));
        }

        let detail = project_channels(features, &self.weight, &self.bias)?;
        let detail = upsample_bilinear2(&upsample_bilinear2(&detail));
        Ok(upsample_bilinear2(frame) + &detail)
    }
}

impl Parameterized for SuperResolutionHead {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        vec![
            ("conv_last.weight".to_string(), ParamRef::Matrix(&self.weight)),
            ("conv_last.bias".to_string(), ParamRef::Vector(&self.bias)),
        ]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        vec![
            ("conv_last.weight".to_string(), ParamMut::Matrix(&mut self.weight)),
            ("conv_last.bias".to_string(), ParamMut::Vector(&mut self.bias)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::FeatureExtractor;

    #[test]
    fn test_reconstruction_of_flat_frame() {
        let frame = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, _, _)| 0.2 + c as f32 * 0.3);
        let features = FeatureExtractor::new(3, 6).extract(&frame).unwrap();
        let recon = ReconstructionHead::new(6).reconstruct(&features).unwrap();
        assert_eq!(recon.shape(), frame.shape());
        for (a, b) in recon.iter().zip(frame.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_super_resolution_shape() {
        let head = SuperResolutionHead::new(4);
        let features = Array4::ones((2, 4, 3, 5));
        let frame = Array4::from_elem((2, 3, 6, 10), 0.5);
        let out = head.upscale(&features, &frame).unwrap();
        assert_eq!(out.shape(), &[2, 3, 12, 20]);
        assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-6));

        let wrong = Array4::zeros((2, 3, 5, 10));
        assert!(head.upscale(&features, &wrong).unwrap_err().is_shape_error());
    }
}
