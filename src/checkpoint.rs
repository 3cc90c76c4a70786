//! Checkpoint loading.
//!
//! Two on-disk formats resolve to the same module:
//!
//! - **PyTorch** (`*.pth`, `*.pt`): `state_dict` of torchvision `efficientnet_b0`
//!   with `classifier[1]` replaced by a `num_classes`-way `Linear`.
//! - **Named MessagePack** (`*.mpk`): burn record written by [`save_checkpoint`].

use std::path::Path;

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::{debug, info};

use crate::efficientnet::{EfficientNet, EfficientNetConfig, EfficientNetRecord};
use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    PyTorch,
    NamedMpk,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("pth") | Some("pt") => Ok(CheckpointFormat::PyTorch),
            Some("mpk") => Ok(CheckpointFormat::NamedMpk),
            _ => Err(LoadError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Key remapping from the torchvision `features.N...` layout to the module tree.
///
/// `features.{s}.{b}.block.{j}` becomes `blocks.{offset(s) + b}.{part}`, where
/// the block sub-modules are `[expand,] depthwise, se, project`.
fn pytorch_load_args(path: &Path, config: &EfficientNetConfig) -> LoadArgs {
    let head = config.stages.len() + 1;
    let mut args = LoadArgs::new(path.to_path_buf())
        .with_key_remap(r"^features\.0\.0\.(.+)$", "stem.conv.${1}")
        .with_key_remap(r"^features\.0\.1\.(.+)$", "stem.norm.${1}")
        .with_key_remap(&format!(r"^features\.{head}\.0\.(.+)$"), "head_conv.conv.${1}")
        .with_key_remap(&format!(r"^features\.{head}\.1\.(.+)$"), "head_conv.norm.${1}")
        .with_key_remap(r"^classifier\.1\.(.+)$", "classifier.${1}");

    for ((s, stage), offset) in config.stages.iter().enumerate().zip(config.stage_offsets()) {
        let parts: &[&str] = if stage.expand_ratio == 1 {
            &["depthwise", "se", "project"]
        } else {
            &["expand", "depthwise", "se", "project"]
        };
        for b in 0..stage.layers {
            for (j, part) in parts.iter().enumerate() {
                args = args.with_key_remap(
                    &format!(r"^features\.{}\.{b}\.block\.{j}\.(.+)$", s + 1),
                    &format!("blocks.{}.{part}.${{1}}", offset + b),
                );
            }
        }
    }

    args.with_key_remap(
        r"^(.+\.(?:expand|depthwise|project))\.0\.(.+)$",
        "${1}.conv.${2}",
    )
    .with_key_remap(
        r"^(.+\.(?:expand|depthwise|project))\.1\.(.+)$",
        "${1}.norm.${2}",
    )
}

/// Load a checkpoint into a freshly initialised network and check it matches
/// `config`.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    config: &EfficientNetConfig,
    device: &B::Device,
) -> Result<EfficientNet<B>, LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }
    let format = CheckpointFormat::from_path(path)?;
    debug!("Reading {:?} checkpoint from {:?}", format, path);

    let record: EfficientNetRecord<B> = match format {
        CheckpointFormat::PyTorch => PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(pytorch_load_args(path, config), device)
            .map_err(|e| LoadError::Record(e.to_string()))?,
        CheckpointFormat::NamedMpk => NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(path.to_path_buf(), device)
            .map_err(|e| LoadError::Record(e.to_string()))?,
    };

    let fresh = config.init::<B>(device);
    let expected_params = fresh.num_params();
    let model = fresh.load_record(record);
    verify(&model, config, expected_params)?;

    info!(
        "Loaded {} parameters from {:?}",
        model.num_params(),
        path
    );
    Ok(model)
}

/// Shape checks a record load cannot do on its own.
fn verify<B: Backend>(
    model: &EfficientNet<B>,
    config: &EfficientNetConfig,
    expected_params: usize,
) -> Result<(), LoadError> {
    let stem = model.stem.conv.weight.val().dims();
    if stem[..2] != [config.stem_channels, 3] {
        return Err(LoadError::Incompatible(format!(
            "stem conv weight is {stem:?}, expected [{}, 3, 3, 3]",
            config.stem_channels
        )));
    }
    let head = model.classifier.weight.val().dims();
    if head != [config.head_channels, config.num_classes] {
        return Err(LoadError::Incompatible(format!(
            "classifier maps {} features to {} classes, expected {} to {}",
            head[0], head[1], config.head_channels, config.num_classes
        )));
    }
    let actual = model.num_params();
    if actual != expected_params {
        return Err(LoadError::Incompatible(format!(
            "{actual} parameters, expected {expected_params}"
        )));
    }
    Ok(())
}

/// Write `model` as a named MessagePack record (`.mpk` is appended if missing).
pub fn save_checkpoint<B: Backend>(model: &EfficientNet<B>, path: &Path) -> Result<(), LoadError> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
        .record(model.clone().into_record(), path.to_path_buf())
        .map_err(|e| LoadError::Record(e.to_string()))
}
