pub mod api;
pub mod checkpoint;
pub mod classifier;
pub mod cli;
pub mod conv;
pub mod efficientnet;
pub mod error;
pub mod gradcam;
pub mod labels;
pub mod logging;
pub mod mbconv;
pub mod postprocess;
pub mod preprocess;
pub mod service;
pub mod visualize;

pub use crate::api::{cors_layer, router};
pub use crate::classifier::{Classifier, ClassifierConfig};
pub use crate::efficientnet::{EfficientNet, EfficientNetConfig};
pub use crate::error::{DecodeError, GradCamError, InferenceError, LoadError, ServiceError};
pub use crate::gradcam::{FeatureTap, Heatmap, grad_cam, grad_cam_split};
pub use crate::labels::{DrGrade, RiskLevel};
pub use crate::postprocess::Prediction;
pub use crate::preprocess::{PreprocessConfig, PreprocessMethod, Processor};
pub use crate::service::{Diagnosis, DiagnosisRequest, DiagnosisService};
