use burn::{
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::activation::{sigmoid, silu},
};

use crate::conv::ConvBlock;

/// Channel attention: global pool -> 1x1 reduce -> SiLU -> 1x1 expand -> sigmoid gate.
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pub fc1: Conv2d<B>,
    pub fc2: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn new(channels: usize, squeeze: usize, device: &B::Device) -> Self {
        Self {
            fc1: Conv2dConfig::new([channels, squeeze], [1, 1]).init(device),
            fc2: Conv2dConfig::new([squeeze, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = input.clone().mean_dim(3).mean_dim(2);
        let scale = silu(self.fc1.forward(scale));
        let scale = sigmoid(self.fc2.forward(scale));
        input * scale
    }
}

/// Inverted residual block used by every EfficientNet stage.
#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    pub expand: Option<ConvBlock<B>>,
    pub depthwise: ConvBlock<B>,
    pub se: SqueezeExcitation<B>,
    pub project: ConvBlock<B>,
    residual: bool,
}

impl<B: Backend> MBConv<B> {
    /// # Arguments
    /// * `c1`, `c2`: input / output channels.
    /// * `expand_ratio`: hidden width multiplier; `1` skips the expansion conv.
    /// * `k`, `s`: depthwise kernel size and stride.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c1: usize,
        c2: usize,
        expand_ratio: usize,
        k: usize,
        s: usize,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        let hidden = c1 * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| ConvBlock::new(c1, hidden, 1, 1, 1, true, eps, device));
        let depthwise = ConvBlock::new(hidden, hidden, k, s, hidden, true, eps, device);
        let se = SqueezeExcitation::new(hidden, (c1 / 4).max(1), device);
        let project = ConvBlock::new(hidden, c2, 1, 1, 1, false, eps, device);

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: s == 1 && c1 == c2,
        }
    }

    /// `x + block(x)` when stride is 1 and channels match, otherwise `block(x)`.
    /// Stochastic depth is a training-time regulariser and is not applied.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.se.forward(x);
        let x = self.project.forward(x);
        if self.residual { x + input } else { x }
    }
}
