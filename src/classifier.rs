use std::path::Path;
use std::sync::{Mutex, PoisonError};

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::prelude::*;
use ndarray::Array4;
use tracing::debug;

use crate::checkpoint::load_checkpoint;
use crate::efficientnet::{EfficientNet, EfficientNetConfig, FEATURES_LAYER};
use crate::error::{GradCamError, InferenceError, LoadError};
use crate::gradcam::{Heatmap, grad_cam_split};
use crate::postprocess::Prediction;
use crate::preprocess::PreprocessConfig;

pub type InferenceBackend = NdArray<f32>;
pub type ExplainBackend = Autodiff<InferenceBackend>;

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub network: EfficientNetConfig,
    pub preprocess: PreprocessConfig,
    /// Layer Grad-CAM reads activations from.
    pub gradcam_layer: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            network: EfficientNetConfig::default(),
            preprocess: PreprocessConfig::default(),
            gradcam_layer: FEATURES_LAYER.to_string(),
        }
    }
}

impl ClassifierConfig {
    /// Reduced network at 32x32 input.
    pub fn tiny() -> Self {
        Self {
            network: EfficientNetConfig::tiny(crate::labels::NUM_CLASSES),
            preprocess: PreprocessConfig::default().with_size(32, 32),
            gradcam_layer: FEATURES_LAYER.to_string(),
        }
    }

    pub fn with_gradcam_layer(mut self, layer: impl Into<String>) -> Self {
        self.gradcam_layer = layer.into();
        self
    }

    /// `gradcam_layer` must be one of the network's tap layers.
    pub fn validate(&self) -> Result<(), GradCamError> {
        let available = self.network.tap_layers();
        if available.contains(&self.gradcam_layer) {
            return Ok(());
        }
        Err(GradCamError::UnknownLayer {
            layer: self.gradcam_layer.clone(),
            available,
        })
    }
}

/// A loaded network, ready for inference and explanation.
///
/// Burn modules are `Send` but not `Sync`, so each call clones the module
/// under a short lock. Tensor storage is shared by the clone.
#[derive(Debug)]
pub struct Classifier {
    config: ClassifierConfig,
    device: NdArrayDevice,
    inference: Mutex<EfficientNet<InferenceBackend>>,
    explain: Mutex<EfficientNet<ExplainBackend>>,
}

impl Classifier {
    pub fn load(path: &Path, config: ClassifierConfig) -> Result<Self, LoadError> {
        let device = NdArrayDevice::default();
        let model = load_checkpoint::<ExplainBackend>(path, &config.network, &device)?;
        Ok(Self::from_model(model, config))
    }

    /// Wrap an already initialised network.
    pub fn from_model(model: EfficientNet<ExplainBackend>, config: ClassifierConfig) -> Self {
        Self {
            config,
            device: NdArrayDevice::default(),
            inference: Mutex::new(model.valid()),
            explain: Mutex::new(model),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn check_shape(&self, input: &Array4<f32>) -> Result<[usize; 4], InferenceError> {
        let expected = self.config.preprocess.input_shape();
        if input.shape() != expected {
            return Err(InferenceError::Shape {
                actual: input.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }
        Ok(expected)
    }

    fn to_tensor<B: Backend<Device = NdArrayDevice>>(
        &self,
        input: &Array4<f32>,
        shape: [usize; 4],
    ) -> Tensor<B, 4> {
        let data = TensorData::new(input.iter().copied().collect::<Vec<f32>>(), shape);
        Tensor::from_data(data, &self.device)
    }

    /// Classify one preprocessed `[1, 3, H, W]` image.
    pub fn predict(&self, input: &Array4<f32>) -> Result<Prediction, InferenceError> {
        let shape = self.check_shape(input)?;
        let model = self
            .inference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let logits = model
            .forward(self.to_tensor::<InferenceBackend>(input, shape))
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Tensor(format!("{e:?}")))?;
        debug!("logits: {:?}", logits);
        Prediction::from_logits(logits)
    }

    /// Grad-CAM heatmap for `target` at the configured layer. Layers up to
    /// the tap run on the inference copy; only the rest is differentiated.
    pub fn explain(&self, input: &Array4<f32>, target: usize) -> Result<Heatmap, GradCamError> {
        self.explain_layer(input, target, &self.config.gradcam_layer)
    }

    pub fn explain_layer(
        &self,
        input: &Array4<f32>,
        target: usize,
        layer: &str,
    ) -> Result<Heatmap, GradCamError> {
        let shape = self.check_shape(input)?;
        let trunk = self
            .inference
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let model = self
            .explain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let [_, _, height, width] = shape;
        grad_cam_split(
            &trunk,
            &model,
            self.to_tensor::<InferenceBackend>(input, shape),
            target,
            layer,
            [height, width],
        )
    }
}
