//! Error types for every stage of the diagnosis pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Checkpoint could not be turned into a usable network.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported checkpoint format: {0} (expected .pth, .pt or .mpk)")]
    UnsupportedFormat(PathBuf),

    #[error("failed to read checkpoint record: {0}")]
    Record(String),

    #[error("checkpoint does not match the expected architecture: {0}")]
    Incompatible(String),
}

/// Forward pass failed.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("input tensor has shape {actual:?}, expected {expected:?}")]
    Shape {
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("tensor conversion failed: {0}")]
    Tensor(String),
}

/// Grad-CAM could not produce a heatmap.
#[derive(Error, Debug)]
pub enum GradCamError {
    #[error("layer '{layer}' is not exposed by the network (available: {available:?})")]
    UnknownLayer {
        layer: String,
        available: Vec<String>,
    },

    #[error("no gradient reached layer '{0}'")]
    MissingGradient(String),

    #[error("target class {target} out of range for {num_classes} classes")]
    TargetOutOfRange { target: usize, num_classes: usize },

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Client payload could not be turned into an image tensor.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image payload is too short")]
    PayloadTooShort,

    #[error("invalid base64 image payload")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid image data")]
    Image(#[from] image::ImageError),

    #[error("image has zero width or height")]
    EmptyImage,

    #[error("unsupported preprocessing method '{0}'")]
    UnsupportedPreprocessing(String),

    #[error("preprocessing failed: {0}")]
    Preprocess(String),
}

#[derive(Error, Debug)]
pub enum VisualizeError {
    #[error("heatmap is {heatmap:?} but image is {image:?}")]
    SizeMismatch {
        heatmap: (usize, usize),
        image: (u32, u32),
    },

    #[error("failed to read font: {0}")]
    Font(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Request-level failure in the diagnosis service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("model not loaded")]
    ModelNotLoaded,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    GradCam(#[from] GradCamError),

    #[error(transparent)]
    Visualize(#[from] VisualizeError),

    #[error("worker task failed: {0}")]
    Join(String),
}
