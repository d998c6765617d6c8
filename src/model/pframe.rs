//! Predictive policies: keyframes through the owned keyframe model, every other
//! frame relative to the previous one
//!
//! With `adaptation` the encoder re-decodes every frame it codes and uses that
//! reconstruction as the next reference, exactly as the decoder will. Without it
//! the encoder references the raw previous frame, which is faster but lets the
//! decoder drift.

use super::{IFrameModel, ModelCore};
use crate::bitstream::{BitstreamRecord, CompressedVideo, LatentShape, VcRecord};
use crate::codec::{
    DecoderInput, FrameRole, GopConfig, GopPolicy, GopStatistics, MotionCodec, COMPRESSION_TASK,
    OFFSET_CHANNELS,
};
use crate::entropy::{EntropyModels, HyperpriorCompressor};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use crate::tensor::{stack_frames, window};
use ndarray::{Array4, Array5};
use tracing::{debug, trace};

/// Predicted-frame model owning its keyframe model
#[derive(Debug)]
pub struct PFrameModel {
    core: ModelCore,
    iframe_model: IFrameModel,
    gop: GopConfig,
    policy: GopPolicy,
}

impl PFrameModel {
    pub fn new(
        core: ModelCore,
        iframe_model: IFrameModel,
        gop: GopConfig,
        policy: GopPolicy,
    ) -> Result<Self> {
        gop.validate()?;
        let expected_input = match policy {
            GopPolicy::Predictive => DecoderInput::Residual,
            GopPolicy::PredictiveWithMotion => DecoderInput::MotionResidual,
            GopPolicy::Independent => {
                return Err(Error::invalid_config(
                    "PFrame model needs a predictive policy",
                ))
            }
        };
        let input = core.vc()?.input();
        if input != expected_input {
            return Err(Error::invalid_config(format!(
                "{} needs a {:?} compression decoder, got {:?}",
                policy.model_type(),
                expected_input,
                input
            )));
        }
        let encoder = core.encoder();
        if encoder.window_size() != 2 {
            return Err(Error::invalid_config(format!(
                "{} needs a two-frame encoder, '{}' takes {}",
                policy.model_type(),
                encoder.class_name(),
                encoder.window_size()
            )));
        }
        if policy.uses_motion() != encoder.motion_codec().is_some() {
            return Err(Error::invalid_config(format!(
                "{} and encoder '{}' disagree on motion compensation",
                policy.model_type(),
                encoder.class_name()
            )));
        }
        for task in core.auxiliary_tasks() {
            if iframe_model.core().decoder(task).is_none() {
                return Err(Error::invalid_config(format!(
                    "task '{}' has no head in the keyframe model",
                    task
                )));
            }
        }
        debug!(
            policy = policy.model_type(),
            keyframe_interval = gop.keyframe_interval,
            adaptation = gop.adaptation,
            "PFrame model assembled"
        );
        Ok(Self {
            core,
            iframe_model,
            gop,
            policy,
        })
    }

    pub fn core(&self) -> &ModelCore {
        &self.core
    }

    pub fn iframe_model(&self) -> &IFrameModel {
        &self.iframe_model
    }

    pub fn gop(&self) -> &GopConfig {
        &self.gop
    }

    pub fn policy(&self) -> GopPolicy {
        self.policy
    }

    /// Role counts for a video of `num_frames` frames
    pub fn gop_statistics(&self, num_frames: usize) -> GopStatistics {
        GopStatistics::from_roles(self.gop.schedule(num_frames))
    }

    fn motion(&self) -> Result<&MotionCodec> {
        self.core
            .encoder()
            .motion_codec()
            .ok_or_else(|| Error::internal("motion policy without a motion codec"))
    }

    /// Code a video; adaptive encodes also return the encoder-side reconstructions
    pub fn compress(&self, video: &Array5<f32>) -> Result<CompressedVideo> {
        let num_frames = video.shape()[1];
        if num_frames == 0 {
            return Err(Error::invalid_window("PFrameModel::compress", 1, 0));
        }
        let adaptation = self.gop.adaptation;
        let vc = self.core.vc()?;
        let mut out = CompressedVideo::new(&self.core.auxiliary_tasks());
        let mut previous_reconstruction: Option<Array4<f32>> = None;

        for index in 0..num_frames {
            match self.gop.role_of(index) {
                FrameRole::Keyframe => {
                    let keyframe_window = self.iframe_model.keyframe_window(video, index)?;
                    let coded = self.iframe_model.compress_one(&keyframe_window)?;
                    if adaptation {
                        let recon = self.iframe_model.decompress_one(&coded.content)?;
                        out.push_reconstruction(recon.clone());
                        previous_reconstruction = Some(recon);
                    }
                    trace!(frame = index, bytes = coded.content.num_bytes(), "keyframe coded");
                    out.push_record(VcRecord::Keyframe {
                        content: coded.content,
                        motion: self.policy.uses_motion().then(BitstreamRecord::empty),
                    });
                    for (task, output) in coded.auxiliary {
                        if self.core.decoder(&task).is_some() {
                            out.push_auxiliary(&task, output)?;
                        }
                    }
                }
                FrameRole::Predicted => {
                    let pair = window(video, index - 1, index)?;
                    let reference = if adaptation {
                        previous_reconstruction.as_ref()
                    } else {
                        None
                    };
                    let rep = self.core.encoder().compress(&pair, reference)?;
                    for (task, decoder) in self.core.heads() {
                        let task_rep = self.core.architecture().prepare_rep(task, &rep);
                        if task != COMPRESSION_TASK {
                            out.push_auxiliary(task, decoder.forward(task_rep)?.output)?;
                            continue;
                        }
                        let coded = vc.compress(task_rep)?;
                        if adaptation {
                            let recon = vc.decompress(task_rep.reference.as_ref(), &coded.content)?;
                            out.push_reconstruction(recon.clone());
                            previous_reconstruction = Some(recon);
                        }
                        trace!(
                            frame = index,
                            bytes = coded.content.num_bytes(),
                            motion_bytes = coded.motion.as_ref().map_or(0, BitstreamRecord::num_bytes),
                            "predicted frame coded"
                        );
                        out.push_record(VcRecord::Predicted {
                            content: coded.content,
                            motion: coded.motion,
                        });
                    }
                }
            }
        }

        debug!(
            policy = self.policy.model_type(),
            frames = num_frames,
            bytes = out.total_bytes(),
            "video compressed"
        );
        Ok(out)
    }

    fn check_record(&self, index: usize, record: &VcRecord) -> Result<FrameRole> {
        let role = self.gop.role_of(index);
        if record.role() != role {
            return Err(Error::record_mismatch(
                index,
                format!("expected a {} record, got {}", role, record.role()),
            ));
        }
        match (self.policy.uses_motion(), record.motion()) {
            (false, None) => {}
            (false, Some(_)) => {
                return Err(Error::record_mismatch(index, "unexpected motion stream"));
            }
            (true, None) => {
                return Err(Error::record_mismatch(index, "missing motion stream"));
            }
            (true, Some(motion)) => {
                if motion.is_sentinel() != role.is_keyframe() {
                    return Err(Error::record_mismatch(
                        index,
                        format!("motion sentinel does not match a {} record", role),
                    ));
                }
            }
        }
        Ok(role)
    }

    /// Rebuild a video; predicted frames decode against the features of the
    /// previous reconstruction
    pub fn decompress(&self, records: &[VcRecord]) -> Result<Array5<f32>> {
        if records.is_empty() {
            return Err(Error::invalid_window("PFrameModel::decompress", 1, 0));
        }
        let vc = self.core.vc()?;
        let encoder = self.core.encoder();
        let mut frames = Vec::with_capacity(records.len());
        let mut previous_features: Option<Array4<f32>> = None;

        let keyframe_shape = records[0].content().shape;

        for (index, record) in records.iter().enumerate() {
            let recon = match self.check_record(index, record)? {
                FrameRole::Keyframe => {
                    check_latent_shape(index, "keyframe", record.content(), keyframe_shape)?;
                    self.iframe_model.decompress_one(record.content())?
                }
                FrameRole::Predicted => {
                    let features = previous_features
                        .as_ref()
                        .ok_or_else(|| Error::internal("predicted frame before any keyframe"))?;
                    let expected = LatentShape::of(features);
                    check_latent_shape(index, "content", record.content(), expected)?;
                    let reference = match record.motion() {
                        Some(coded) => {
                            check_latent_shape(
                                index,
                                "motion",
                                coded,
                                LatentShape {
                                    channels: OFFSET_CHANNELS,
                                    ..expected
                                },
                            )?;
                            let motion = self.motion()?;
                            let offsets = motion.decompress(coded)?;
                            motion.align_features(features, &offsets)?
                        }
                        None => features.clone(),
                    };
                    vc.decompress(Some(&reference), record.content())?
                }
            };
            previous_features = Some(encoder.extract_feats(&recon)?);
            frames.push(recon);
        }
        stack_frames(&frames)
    }

    /// Calibrate every entropy sub-model, the keyframe model's included
    pub fn update(&mut self, scale_table: Option<&[f32]>, force: bool, update_quantiles: bool) -> bool {
        let mut updated = self.core.update_entropy_models(scale_table, force, update_quantiles);
        updated |= self.iframe_model.update(scale_table, force, update_quantiles);
        debug!(updated, force, policy = self.policy.model_type(), "PFrame model calibrated");
        updated
    }
}

fn check_latent_shape(
    index: usize,
    stream: &str,
    record: &BitstreamRecord,
    expected: LatentShape,
) -> Result<()> {
    if record.shape != expected {
        return Err(Error::record_mismatch(
            index,
            format!(
                "{} shape {:?} does not match the reference {:?}",
                stream,
                record.shape.to_vec(),
                expected.to_vec()
            ),
        ));
    }
    Ok(())
}

impl Parameterized for PFrameModel {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut params = self.core.named_parameters();
        params.extend(prefixed("iframe_model", self.iframe_model.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut params = self.core.named_parameters_mut();
        params.extend(prefixed("iframe_model", self.iframe_model.named_parameters_mut()));
        params
    }
}

impl EntropyModels for PFrameModel {
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor> {
        let mut models = self.core.entropy_models();
        models.extend(self.iframe_model.entropy_models());
        models
    }

    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor> {
        let mut models = self.core.entropy_models_mut();
        models.extend(self.iframe_model.entropy_models_mut());
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::{iframe_model, parts, video, CHANNELS};
    use crate::tensor::frame_at;
    use serde_json::json;

    fn pframe(policy: GopPolicy, interval: usize, adaptation: bool, with_sr: bool) -> PFrameModel {
        let (encoder, vc) = match policy {
            GopPolicy::PredictiveWithMotion => ("VSRVCMotionResidualEncoder", "VCMotionResidualDecoder"),
            _ => ("VSRVCResidualEncoder", "VCResidualDecoder"),
        };
        let mut decoders = vec![("vc", vc)];
        if with_sr {
            decoders.push(("vsr", "VSRResidualDecoder"));
        }
        let core = ModelCore::new(parts(encoder, json!({"out_channels": CHANNELS}), &decoders)).unwrap();
        let mut model = PFrameModel::new(
            core,
            iframe_model(with_sr),
            GopConfig::new(interval, adaptation),
            policy,
        )
        .unwrap();
        model.update(None, true, false);
        model
    }

    #[test]
    fn test_schedule_follows_interval() {
        let model = pframe(GopPolicy::Predictive, 2, true, false);
        let compressed = model.compress(&video(4)).unwrap();
        let roles: Vec<FrameRole> = compressed.records().iter().map(VcRecord::role).collect();
        assert_eq!(roles, model.gop().schedule(4));
        assert_eq!(model.gop_statistics(4).keyframes, 2);
    }

    #[test]
    fn test_adaptive_decode_is_drift_free() {
        for policy in [GopPolicy::Predictive, GopPolicy::PredictiveWithMotion] {
            let model = pframe(policy, 3, true, false);
            let compressed = model.compress(&video(5)).unwrap();
            let decoded = model.decompress(compressed.records()).unwrap();
            let encoder_side = compressed.reconstructions().unwrap();
            assert_eq!(encoder_side.len(), 5);
            for (index, recon) in encoder_side.iter().enumerate() {
                assert_eq!(&frame_at(&decoded, index).unwrap(), recon, "{:?} frame {}", policy, index);
            }
        }
    }

    #[test]
    fn test_motion_slots() {
        let model = pframe(GopPolicy::PredictiveWithMotion, 2, true, false);
        let compressed = model.compress(&video(4)).unwrap();
        for (index, record) in compressed.records().iter().enumerate() {
            let motion = record.motion().unwrap();
            assert_eq!(motion.is_sentinel(), index % 2 == 0);
        }
    }

    #[test]
    fn test_no_adaptation_still_decodes() {
        let model = pframe(GopPolicy::Predictive, 4, false, true);
        let v = video(3);
        let compressed = model.compress(&v).unwrap();
        assert!(compressed.reconstructions().is_none());
        assert_eq!(compressed.auxiliary("vsr").unwrap().len(), 3);
        assert_eq!(model.decompress(compressed.records()).unwrap().shape(), v.shape());
    }

    #[test]
    fn test_record_role_mismatch() {
        let model = pframe(GopPolicy::Predictive, 2, true, false);
        let compressed = model.compress(&video(2)).unwrap();
        let mut records = compressed.records().to_vec();
        records.swap(0, 1);
        assert!(model.decompress(&records).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_missing_motion_slot() {
        let model = pframe(GopPolicy::PredictiveWithMotion, 2, true, false);
        let compressed = model.compress(&video(2)).unwrap();
        let mut records = compressed.records().to_vec();
        records[1] = VcRecord::Predicted {
            content: records[1].content().clone(),
            motion: None,
        };
        assert!(model.decompress(&records).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_policy_and_encoder_must_agree() {
        let core = ModelCore::new(parts(
            "VSRVCResidualEncoder",
            json!({"out_channels": CHANNELS}),
            &[("vc", "VCMotionResidualDecoder")],
        ))
        .unwrap();
        let err = PFrameModel::new(
            core,
            iframe_model(false),
            GopConfig::default(),
            GopPolicy::PredictiveWithMotion,
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_auxiliary_task_needs_keyframe_head() {
        let core = ModelCore::new(parts(
            "VSRVCResidualEncoder",
            json!({"out_channels": CHANNELS}),
            &[("vc", "VCResidualDecoder"), ("vsr", "VSRResidualDecoder")],
        ))
        .unwrap();
        let err = PFrameModel::new(core, iframe_model(false), GopConfig::default(), GopPolicy::Predictive)
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_update_covers_keyframe_model() {
        let core = ModelCore::new(parts(
            "VSRVCMotionResidualEncoder",
            json!({"out_channels": CHANNELS}),
            &[("vc", "VCMotionResidualDecoder")],
        ))
        .unwrap();
        let mut model = PFrameModel::new(
            core,
            iframe_model(false),
            GopConfig::default(),
            GopPolicy::PredictiveWithMotion,
        )
        .unwrap();
        assert_eq!(model.entropy_models().len(), 3);
        assert!(model.update(None, false, false));
        assert!(model.iframe_model().entropy_models_calibrated());
        assert!(!model.update(None, false, false));
        assert!(model
            .state_dict()
            .get("iframe_model.decoders.vc.compressor.gain")
            .is_some());
    }
}
