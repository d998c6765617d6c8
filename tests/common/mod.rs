//! Common test utilities for VSRVC integration tests
//!
//! Helpers for synthetic videos and for writing model directories
//! (`model.json` plus checkpoint) into temporary folders.

#![allow(dead_code)]

use ndarray::Array5;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use vsrvc::{Model, ModelDescription, Parameterized};

/// Feature channels of every fixture model
pub const CHANNELS: usize = 6;

/// Name of the checkpoint file written next to each description
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

// ============================================================================
// Video Generation
// ============================================================================

/// Create a `[batch, frames, 3, height, width]` video with values in `[0, 1]`
///
/// The content slides one pixel to the right per frame, so consecutive frames
/// are related by a small global motion.
pub fn create_test_video(batch: usize, frames: usize, height: usize, width: usize) -> Array5<f32> {
    Array5::from_shape_fn((batch, frames, 3, height, width), |(b, n, c, y, x)| {
        let xs = (x + width - n % width) % width;
        (((xs * 7 + y * 3 + c * 5 + b) % 17) as f32 / 17.0) * 0.8 + 0.1
    })
}

/// Small default video: 1 x frames x 3 x 16 x 16
pub fn small_video(frames: usize) -> Array5<f32> {
    create_test_video(1, frames, 16, 16)
}

// ============================================================================
// Model Descriptions
// ============================================================================

/// Description of a keyframe model with an optional super-resolution task
pub fn iframe_description(with_sr: bool) -> Value {
    let mut tasks = vec!["vc"];
    let mut decoders = vec![json!({"task": "vc", "module": "ICDecoder", "kwargs": {"in_channels": CHANNELS}})];
    if with_sr {
        tasks.push("vsr");
        decoders.push(json!({"task": "vsr", "module": "ISRDecoder", "kwargs": {"in_channels": CHANNELS}}));
    }
    json!({
        "model_type": "IFrame",
        "task_name": tasks,
        "encoder_class": "VSRVCEncoder",
        "encoder_kwargs": {"sliding_window": 1, "out_channels": CHANNELS},
        "decoders": decoders,
        "rep_grad": false,
        "multi_input": false,
        "lmbda": 128.0,
        "arch_args": {},
        "weighting": "EW",
        "architecture": "HPS"
    })
}

/// Description of a predictive model; `model_type` is `PFrame` or `PFrameWithMotion`
pub fn pframe_description(
    model_type: &str,
    iframe_model_path: &str,
    keyframe_interval: usize,
    adaptation: bool,
    with_sr: bool,
) -> Value {
    let (encoder, vc) = if model_type == "PFrameWithMotion" {
        ("VSRVCMotionResidualEncoder", "VCMotionResidualDecoder")
    } else {
        ("VSRVCResidualEncoder", "VCResidualDecoder")
    };
    let mut tasks = vec!["vc"];
    let mut decoders = vec![json!({"task": "vc", "module": vc, "kwargs": {"in_channels": CHANNELS}})];
    if with_sr {
        tasks.push("vsr");
        decoders.push(json!({"task": "vsr", "module": "VSRResidualDecoder", "kwargs": {"in_channels": CHANNELS}}));
    }
    json!({
        "model_type": model_type,
        "task_name": tasks,
        "encoder_class": encoder,
        "encoder_kwargs": {"out_channels": CHANNELS},
        "decoders": decoders,
        "rep_grad": false,
        "multi_input": false,
        "lmbda": 256.0,
        "arch_args": {
            "iframe_model_path": iframe_model_path,
            "keyframe_interval": keyframe_interval,
            "adaptation": adaptation
        },
        "weighting": "EW",
        "architecture": "HPS"
    })
}

// ============================================================================
// Model Directories
// ============================================================================

/// Write `description` to `dir/model.json`, creating `dir`
pub fn write_description(dir: &Path, description: &Value) -> PathBuf {
    fs::create_dir_all(dir).expect("create model dir");
    let path = dir.join("model.json");
    fs::write(&path, serde_json::to_string_pretty(description).unwrap()).expect("write model.json");
    path
}

/// Write a model directory whose checkpoint is the model's own initial state
///
/// The description is written first without a checkpoint, assembled, and then
/// rewritten with a `checkpoint` entry pointing at the saved state dict.
pub fn write_model_dir(dir: &Path, description: &Value) -> PathBuf {
    let path = write_description(dir, description);
    let parsed: ModelDescription = serde_json::from_value(description.clone()).unwrap();
    let model = Model::from_description(&parsed, dir).expect("assemble fixture model");
    model
        .state_dict()
        .save(&dir.join(CHECKPOINT_FILE))
        .expect("save checkpoint");

    let mut with_checkpoint = description.clone();
    with_checkpoint["checkpoint"] = json!(CHECKPOINT_FILE);
    write_description(dir, &with_checkpoint);
    path
}

/// Write `root/iframe` and `root/<model_type>` model directories; returns the
/// predictive model directory
pub fn write_pframe_setup(
    root: &Path,
    model_type: &str,
    keyframe_interval: usize,
    adaptation: bool,
    with_sr: bool,
) -> PathBuf {
    write_model_dir(&root.join("iframe"), &iframe_description(with_sr));
    let dir = root.join(model_type);
    write_model_dir(
        &dir,
        &pframe_description(model_type, "../iframe", keyframe_interval, adaptation, with_sr),
    );
    dir
}
