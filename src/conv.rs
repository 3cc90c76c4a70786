use burn::{
    module::Param,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::silu,
};

/// "same" padding for odd kernels.
fn autopad(k: usize) -> usize {
    (k - 1) / 2
}

/// Batch normalisation that always uses the stored running statistics.
///
/// Field names follow the PyTorch `BatchNorm2d` state dict so checkpoints load
/// without renaming. Unlike `nn::BatchNorm`, the forward pass does not switch
/// to batch statistics on an autodiff backend, which keeps Grad-CAM backward
/// passes identical to plain inference.
#[derive(Module, Debug)]
pub struct FrozenNorm<B: Backend> {
    pub weight: Param<Tensor<B, 1>>,
    pub bias: Param<Tensor<B, 1>>,
    pub running_mean: Param<Tensor<B, 1>>,
    pub running_var: Param<Tensor<B, 1>>,
    epsilon: f64,
}

impl<B: Backend> FrozenNorm<B> {
    pub fn new(channels: usize, epsilon: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            running_var: Param::from_tensor(Tensor::ones([channels], device)),
            epsilon,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.weight.val().dims();
        let scale = self.weight.val() / self.running_var.val().add_scalar(self.epsilon).sqrt();
        let shift = self.bias.val() - self.running_mean.val() * scale.clone();
        input * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

/// Conv2d (no bias) -> norm -> optional SiLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: FrozenNorm<B>,
    activation: bool,
}

impl<B: Backend> ConvBlock<B> {
    /// # Arguments
    /// * `c1`, `c2`: input / output channels.
    /// * `k`, `s`: kernel size and stride.
    /// * `g`: groups (`c1` for depthwise).
    /// * `activation`: apply SiLU after the norm.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        c1: usize,
        c2: usize,
        k: usize,
        s: usize,
        g: usize,
        activation: bool,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        let p = autopad(k);
        let conv = Conv2dConfig::new([c1, c2], [k, k])
            .with_groups(g)
            .with_stride([s, s])
            .with_bias(false)
            .with_padding(PaddingConfig2d::Explicit(p, p))
            .init(device);
        let norm = FrozenNorm::new(c2, eps, device);

        Self {
            conv,
            norm,
            activation,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        if self.activation { silu(x) } else { x }
    }
}
