//! Gradient-weighted class activation mapping.
//!
//! The algorithm only needs a network that can be split at a named layer:
//! run up to the layer, then run the rest from a (possibly gradient-tracked)
//! activation. [`FeatureTap`] is that capability.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::Array2;

use crate::error::{GradCamError, InferenceError};

/// A network that exposes named intermediate activations.
pub trait FeatureTap<B: Backend> {
    /// Layer names accepted by `forward_to` / `forward_from`.
    fn tap_layers(&self) -> Vec<String>;

    /// Forward `input` up to and including `layer`. `None` if the layer is unknown.
    fn forward_to(&self, input: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 4>>;

    /// Forward from the output of `layer` to the class logits.
    fn forward_from(&self, activation: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 2>>;
}

/// Saliency map in `[0, 1]`, row-major `[height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    values: Array2<f32>,
}

impl Heatmap {
    /// Upsample a coarse non-negative map to `[height, width]` and min-max normalise.
    pub fn from_coarse(coarse: &Array2<f32>, [height, width]: [usize; 2]) -> Self {
        let (h, w) = coarse.dim();
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(w as u32, h as u32, |x, y| Luma([coarse[[y as usize, x as usize]]]));
        let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Triangle);

        let mut values = Array2::from_shape_fn((height, width), |(y, x)| {
            resized.get_pixel(x as u32, y as u32)[0]
        });
        normalize_unit(&mut values);
        Self { values }
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// `(height, width)`
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[[y, x]]
    }
}

/// Min-max normalise in place. A flat map becomes all zeros.
pub fn normalize_unit(values: &mut Array2<f32>) {
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !range.is_finite() || range <= 1e-12 {
        values.fill(0.0);
    } else {
        values.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    }
}

/// Channel weights are the spatial mean of the gradient; the map is the
/// ReLU of the weighted channel sum. Uses batch item 0.
///
/// # Shapes
///   - activation, gradient [batch, channels, h, w]
///   - output [h, w]
pub fn class_activation_map<B: Backend>(
    activation: Tensor<B, 4>,
    gradient: Tensor<B, 4>,
) -> Tensor<B, 2> {
    let [batch, channels, h, w] = activation.dims();
    let activation = activation.narrow(0, 0, batch.min(1));
    let weights = gradient.narrow(0, 0, batch.min(1)).mean_dim(3).mean_dim(2);
    debug_assert_eq!(weights.dims(), [1, channels, 1, 1]);
    let cam = (activation * weights).sum_dim(1);
    cam.clamp_min(0.0).reshape([h, w])
}

fn unknown_layer<B: Backend, M: FeatureTap<B>>(model: &M, layer: &str) -> GradCamError {
    GradCamError::UnknownLayer {
        layer: layer.to_string(),
        available: model.tap_layers(),
    }
}

/// Compute a Grad-CAM heatmap for `target` at `layer`, resized to `output_size`
/// (`[height, width]`).
pub fn grad_cam<B, M>(
    model: &M,
    input: Tensor<B, 4>,
    target: usize,
    layer: &str,
    output_size: [usize; 2],
) -> Result<Heatmap, GradCamError>
where
    B: AutodiffBackend,
    M: FeatureTap<B>,
{
    let activation = model
        .forward_to(input, layer)
        .ok_or_else(|| unknown_layer(model, layer))?
        .inner();
    grad_cam_from(model, activation, target, layer, output_size)
}

/// Like [`grad_cam`], but the layers up to `layer` run on `trunk`, a copy of
/// `model` on the inner backend. Nothing before `layer` is recorded on the
/// autodiff graph.
pub fn grad_cam_split<B, T, M>(
    trunk: &T,
    model: &M,
    input: Tensor<B::InnerBackend, 4>,
    target: usize,
    layer: &str,
    output_size: [usize; 2],
) -> Result<Heatmap, GradCamError>
where
    B: AutodiffBackend,
    T: FeatureTap<B::InnerBackend>,
    M: FeatureTap<B>,
{
    let activation = trunk
        .forward_to(input, layer)
        .ok_or_else(|| unknown_layer(trunk, layer))?;
    grad_cam_from(model, activation, target, layer, output_size)
}

fn grad_cam_from<B, M>(
    model: &M,
    activation: Tensor<B::InnerBackend, 4>,
    target: usize,
    layer: &str,
    output_size: [usize; 2],
) -> Result<Heatmap, GradCamError>
where
    B: AutodiffBackend,
    M: FeatureTap<B>,
{
    let activation = Tensor::<B, 4>::from_inner(activation).require_grad();
    let logits = model
        .forward_from(activation.clone(), layer)
        .ok_or_else(|| unknown_layer(model, layer))?;

    let [_, num_classes] = logits.dims();
    if target >= num_classes {
        return Err(GradCamError::TargetOutOfRange {
            target,
            num_classes,
        });
    }

    let score = logits.slice([0..1, target..target + 1]).sum();
    let grads = score.backward();
    let gradient = activation
        .grad(&grads)
        .ok_or_else(|| GradCamError::MissingGradient(layer.to_string()))?;

    let cam = class_activation_map(activation.inner(), gradient);
    let [h, w] = cam.dims();
    let values = cam
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| InferenceError::Tensor(format!("{e:?}")))?;
    let coarse = Array2::from_shape_vec((h, w), values)
        .map_err(|e| InferenceError::Tensor(e.to_string()))?;

    Ok(Heatmap::from_coarse(&coarse, output_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};

    use crate::efficientnet::EfficientNetConfig;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Logits are a linear map of the channel means of the raw input.
    struct LinearHead<B: Backend> {
        weights: Tensor<B, 2>,
    }

    impl<B: Backend> FeatureTap<B> for LinearHead<B> {
        fn tap_layers(&self) -> Vec<String> {
            vec!["input".to_string()]
        }

        fn forward_to(&self, input: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 4>> {
            (layer == "input").then_some(input)
        }

        fn forward_from(&self, activation: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 2>> {
            if layer != "input" {
                return None;
            }
            let [n, c, _, _] = activation.dims();
            let pooled = activation.mean_dim(3).mean_dim(2).reshape([n, c]);
            Some(pooled.matmul(self.weights.clone()))
        }
    }

    #[test]
    fn flat_map_normalises_to_zero() {
        let mut values = Array2::from_elem((3, 3), 0.7);
        normalize_unit(&mut values);
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn coarse_map_is_upsampled_and_normalised() {
        let coarse = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, 4.0]).unwrap();
        let heatmap = Heatmap::from_coarse(&coarse, [20, 30]);
        assert_eq!(heatmap.dim(), (20, 30));
        let max = heatmap.values().iter().cloned().fold(f32::MIN, f32::max);
        let min = heatmap.values().iter().cloned().fold(f32::MAX, f32::min);
        assert_abs_diff_eq!(max, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(min, 0.0, epsilon = 1e-6);
        assert!(heatmap.get(29, 19) > heatmap.get(0, 0));
    }

    #[test]
    fn highlights_the_channel_that_drives_the_target() {
        let device = Default::default();
        // class 0 reads channel 0, class 1 reads channel 1
        let head = LinearHead::<TestBackend> {
            weights: Tensor::from_floats([[1.0, 0.0], [0.0, 1.0]], &device),
        };
        let mut data = vec![0.0f32; 2 * 8 * 8];
        data[3 * 8 + 2] = 5.0; // channel 0 hot spot at (x=2, y=3)
        data[64 + 6 * 8 + 6] = 5.0; // channel 1 hot spot at (x=6, y=6)
        let input = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 2, 8, 8]), &device);

        let heat0 = grad_cam(&head, input.clone(), 0, "input", [8, 8]).unwrap();
        assert_abs_diff_eq!(heat0.get(2, 3), 1.0, epsilon = 1e-5);
        assert!(heat0.get(6, 6) < 0.5);

        let heat1 = grad_cam(&head, input, 1, "input", [8, 8]).unwrap();
        assert_abs_diff_eq!(heat1.get(6, 6), 1.0, epsilon = 1e-5);
        assert!(heat1.get(2, 3) < 0.5);
    }

    #[test]
    fn unknown_layer_is_a_configuration_error() {
        let device = Default::default();
        let head = LinearHead::<TestBackend> {
            weights: Tensor::ones([2, 2], &device),
        };
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device);
        match grad_cam(&head, input, 0, "conv_head", [4, 4]) {
            Err(GradCamError::UnknownLayer { layer, available }) => {
                assert_eq!(layer, "conv_head");
                assert_eq!(available, vec!["input"]);
            }
            other => panic!("expected UnknownLayer, got {other:?}"),
        }
    }

    #[test]
    fn target_must_be_a_valid_class() {
        let device = Default::default();
        let head = LinearHead::<TestBackend> {
            weights: Tensor::ones([2, 2], &device),
        };
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device);
        assert!(matches!(
            grad_cam(&head, input, 2, "input", [4, 4]),
            Err(GradCamError::TargetOutOfRange { target: 2, num_classes: 2 })
        ));
    }

    #[test]
    fn efficientnet_heatmap_covers_input_in_unit_range() {
        let device = Default::default();
        let model = EfficientNetConfig::tiny(5).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        for layer in model.tap_layers() {
            let heatmap = grad_cam(&model, input.clone(), 3, &layer, [32, 32]).unwrap();
            assert_eq!(heatmap.dim(), (32, 32));
            assert!(heatmap.values().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn trunk_on_inner_backend_gives_the_same_heatmap() {
        use burn::module::AutodiffModule;

        let device = Default::default();
        let model = EfficientNetConfig::tiny(5).init::<TestBackend>(&device);
        let trunk = model.valid();
        let input = Tensor::<NdArray<f32>, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        for layer in model.tap_layers() {
            let tracked = Tensor::<TestBackend, 4>::from_inner(input.clone());
            let full = grad_cam(&model, tracked, 1, &layer, [32, 32]).unwrap();
            let split = grad_cam_split(&trunk, &model, input.clone(), 1, &layer, [32, 32]).unwrap();
            for (a, b) in full.values().iter().zip(split.values()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-5);
            }
        }

        assert!(matches!(
            grad_cam_split(&trunk, &model, input, 1, "stage9", [32, 32]),
            Err(GradCamError::UnknownLayer { .. })
        ));
    }
}
