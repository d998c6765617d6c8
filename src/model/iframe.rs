//! Independent policy: every frame is a keyframe

use super::{KeyframeOutput, ModelCore};
use crate::bitstream::{BitstreamRecord, CompressedVideo, VcRecord};
use crate::codec::{DecoderInput, FrameRole, COMPRESSION_TASK};
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{ParamMut, ParamRef, Parameterized};
use crate::tensor::{frame_at, stack_frames};
use ndarray::{Array4, Array5};
use tracing::{debug, trace};

/// Keyframe-only model
#[derive(Debug)]
pub struct IFrameModel {
    core: ModelCore,
}

impl IFrameModel {
    pub fn new(core: ModelCore) -> Result<Self> {
        let input = core.vc()?.input();
        if input != DecoderInput::Intra {
            return Err(Error::invalid_config(format!(
                "IFrame model needs an intra compression decoder, got {:?}",
                input
            )));
        }
        Ok(Self { core })
    }

    pub fn core(&self) -> &ModelCore {
        &self.core
    }

    /// Frames the encoder consumes per keyframe
    pub fn window_size(&self) -> usize {
        self.core.encoder().window_size()
    }

    /// Encoder window ending at frame `index`; positions before the first frame
    /// repeat frame 0
    pub fn keyframe_window(&self, video: &Array5<f32>, index: usize) -> Result<Array5<f32>> {
        let size = self.window_size();
        let frames = (0..size)
            .map(|k| frame_at(video, (index + k + 1).saturating_sub(size)))
            .collect::<Result<Vec<_>>>()?;
        stack_frames(&frames)
    }

    /// Code one window: the compression head codes, auxiliary heads run forward
    pub fn compress_one(&self, window: &Array5<f32>) -> Result<KeyframeOutput> {
        let rep = self.core.encoder().compress(window, None)?;
        let mut content = None;
        let mut auxiliary = Vec::new();
        for (task, decoder) in self.core.heads() {
            let task_rep = self.core.architecture().prepare_rep(task, &rep);
            if task == COMPRESSION_TASK {
                content = Some(self.core.vc()?.compress(task_rep)?.content);
            } else {
                auxiliary.push((task.to_string(), decoder.forward(task_rep)?.output));
            }
        }
        let content = content.ok_or_else(|| Error::internal("no compression head ran"))?;
        Ok(KeyframeOutput { content, auxiliary })
    }

    /// Rebuild one keyframe
    pub fn decompress_one(&self, content: &BitstreamRecord) -> Result<Array4<f32>> {
        self.core.vc()?.decompress(None, content)
    }

    /// Code every frame independently
    pub fn compress(&self, video: &Array5<f32>) -> Result<CompressedVideo> {
        let num_frames = video.shape()[1];
        if num_frames == 0 {
            return Err(Error::invalid_window("IFrameModel::compress", 1, 0));
        }
        let mut out = CompressedVideo::new(&self.core.auxiliary_tasks());
        for index in 0..num_frames {
            let coded = self.compress_one(&self.keyframe_window(video, index)?)?;
            trace!(frame = index, bytes = coded.content.num_bytes(), "keyframe coded");
            out.push_record(VcRecord::Keyframe {
                content: coded.content,
                motion: None,
            });
            for (task, output) in coded.auxiliary {
                out.push_auxiliary(&task, output)?;
            }
        }
        debug!(frames = num_frames, bytes = out.total_bytes(), "video compressed");
        Ok(out)
    }

    /// Rebuild every frame and stack them along the frame axis
    pub fn decompress(&self, records: &[VcRecord]) -> Result<Array5<f32>> {
        if records.is_empty() {
            return Err(Error::invalid_window("IFrameModel::decompress", 1, 0));
        }
        let first_shape = records[0].content().shape;
        let frames = records
            .iter()
            .enumerate()
            .map(|(index, record)| match record {
                VcRecord::Keyframe {
                    content,
                    motion: None,
                } if content.shape != first_shape => Err(Error::record_mismatch(
                    index,
                    format!(
                        "keyframe shape {:?} differs from the first frame {:?}",
                        content.shape.to_vec(),
                        first_shape.to_vec()
                    ),
                )),
                VcRecord::Keyframe {
                    content,
                    motion: None,
                } => self.decompress_one(content),
                VcRecord::Keyframe { motion: Some(_), .. } => Err(Error::record_mismatch(
                    index,
                    "keyframe-only model got a motion stream",
                )),
                VcRecord::Predicted { .. } => Err(Error::record_mismatch(
                    index,
                    format!("expected a {} record, got {}", FrameRole::Keyframe, record.role()),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        stack_frames(&frames)
    }

    /// Calibrate every entropy sub-model; true if any table changed
    pub fn update(&mut self, scale_table: Option<&[f32]>, force: bool, update_quantiles: bool) -> bool {
        let updated = self.update_entropy_models(scale_table, force, update_quantiles);
        debug!(updated, force, "IFrame model calibrated");
        updated
    }
}

impl Parameterized for IFrameModel {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        self.core.named_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        self.core.named_parameters_mut()
    }
}

impl EntropyModels for IFrameModel {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        self.core.entropy_models()
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        self.core.entropy_models_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{iframe_model, parts, video, CHANNELS};
    use crate::model::ModelCore;
    use serde_json::json;

    fn calibrated(with_sr: bool) -> IFrameModel {
        let mut model = iframe_model(with_sr);
        model.update(None, true, false);
        model
    }

    #[test]
    fn test_roundtrip_shape() {
        let model = calibrated(true);
        let v = video(3);
        let compressed = model.compress(&v).unwrap();
        assert_eq!(compressed.num_frames(), 3);
        assert!(compressed.records().iter().all(|r| r.role() == FrameRole::Keyframe));
        assert_eq!(compressed.auxiliary("vsr").unwrap().len(), 3);
        assert!(compressed.reconstructions().is_none());

        let decoded = model.decompress(compressed.records()).unwrap();
        assert_eq!(decoded.shape(), v.shape());
    }

    #[test]
    fn test_decompress_one_matches_forward() {
        let model = calibrated(false);
        let window = model.keyframe_window(&video(1), 0).unwrap();
        let coded = model.compress_one(&window).unwrap();
        let forward = model.core().forward(&window).unwrap();
        assert_eq!(
            model.decompress_one(&coded.content).unwrap(),
            forward.get("vc").unwrap().output
        );
    }

    #[test]
    fn test_sliding_window_pads_with_first_frame() {
        let parts = parts(
            "VSRVCEncoder",
            json!({"sliding_window": 3, "out_channels": CHANNELS}),
            &[("vc", "ICDecoder")],
        );
        let model = IFrameModel::new(ModelCore::new(parts).unwrap()).unwrap();
        let v = video(4);
        let window = model.keyframe_window(&v, 1).unwrap();
        assert_eq!(window.shape()[1], 3);
        assert_eq!(frame_at(&window, 0).unwrap(), frame_at(&v, 0).unwrap());
        assert_eq!(frame_at(&window, 1).unwrap(), frame_at(&v, 0).unwrap());
        assert_eq!(frame_at(&window, 2).unwrap(), frame_at(&v, 1).unwrap());
    }

    #[test]
    fn test_compress_requires_calibration() {
        let model = iframe_model(false);
        assert!(model.compress(&video(1)).unwrap_err().is_calibration_error());
    }

    #[test]
    fn test_empty_inputs() {
        let model = calibrated(false);
        assert!(model.compress(&video(0)).unwrap_err().is_shape_error());
        assert!(model.decompress(&[]).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_rejects_predicted_records() {
        let model = calibrated(false);
        let compressed = model.compress(&video(2)).unwrap();
        let mut records = compressed.records().to_vec();
        records[1] = VcRecord::Predicted {
            content: records[1].content().clone(),
            motion: None,
        };
        assert!(model.decompress(&records).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut model = iframe_model(false);
        assert!(model.update(None, false, false));
        assert!(!model.update(None, false, false));
        assert!(model.update(None, true, false));
    }

    #[test]
    fn test_rejects_residual_compression_head() {
        let parts = parts(
            "VSRVCEncoder",
            json!({"out_channels": CHANNELS}),
            &[("vc", "VCResidualDecoder")],
        );
        let err = IFrameModel::new(ModelCore::new(parts).unwrap()).unwrap_err();
        assert!(err.is_config_error());
    }
}
