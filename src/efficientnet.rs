use burn::{
    module::Ignored,
    nn::{Linear, LinearConfig},
    prelude::*,
};
use serde::{Deserialize, Serialize};

use crate::conv::ConvBlock;
use crate::gradcam::FeatureTap;
use crate::labels::NUM_CLASSES;
use crate::mbconv::MBConv;

/// Name of the tap point after the final 1x1 conv block.
pub const FEATURES_LAYER: &str = "features";
const STEM_LAYER: &str = "stem";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub expand_ratio: usize,
    pub kernel: usize,
    pub stride: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub layers: usize,
}

impl StageConfig {
    const fn new(
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        in_channels: usize,
        out_channels: usize,
        layers: usize,
    ) -> Self {
        Self {
            expand_ratio,
            kernel,
            stride,
            in_channels,
            out_channels,
            layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficientNetConfig {
    pub stem_channels: usize,
    pub stages: Vec<StageConfig>,
    pub head_channels: usize,
    pub num_classes: usize,
    pub norm_eps: f64,
}

impl Default for EfficientNetConfig {
    fn default() -> Self {
        Self::b0(NUM_CLASSES)
    }
}

impl EfficientNetConfig {
    /// EfficientNet-B0 (width 1.0, depth 1.0) in the torchvision layout.
    pub fn b0(num_classes: usize) -> Self {
        Self {
            stem_channels: 32,
            stages: vec![
                StageConfig::new(1, 3, 1, 32, 16, 1),
                StageConfig::new(6, 3, 2, 16, 24, 2),
                StageConfig::new(6, 5, 2, 24, 40, 2),
                StageConfig::new(6, 3, 2, 40, 80, 3),
                StageConfig::new(6, 5, 1, 80, 112, 3),
                StageConfig::new(6, 5, 2, 112, 192, 4),
                StageConfig::new(6, 3, 1, 192, 320, 1),
            ],
            head_channels: 1280,
            num_classes,
            norm_eps: 1e-5,
        }
    }

    /// Same block structure at a fraction of the width, for fast tests and demos.
    pub fn tiny(num_classes: usize) -> Self {
        Self {
            stem_channels: 8,
            stages: vec![
                StageConfig::new(1, 3, 1, 8, 8, 1),
                StageConfig::new(2, 3, 2, 8, 12, 2),
                StageConfig::new(2, 5, 2, 12, 16, 1),
            ],
            head_channels: 32,
            num_classes,
            norm_eps: 1e-5,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let eps = self.norm_eps;
        let stem = ConvBlock::new(3, self.stem_channels, 3, 2, 1, true, eps, device);
        let blocks = self
            .stages
            .iter()
            .flat_map(|stage| {
                (0..stage.layers).map(move |i| {
                    let (c1, s) = if i == 0 {
                        (stage.in_channels, stage.stride)
                    } else {
                        (stage.out_channels, 1)
                    };
                    MBConv::new(
                        c1,
                        stage.out_channels,
                        stage.expand_ratio,
                        stage.kernel,
                        s,
                        eps,
                        device,
                    )
                })
            })
            .collect();
        let last = self
            .stages
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(self.stem_channels);
        let head_conv = ConvBlock::new(last, self.head_channels, 1, 1, 1, true, eps, device);
        let classifier = LinearConfig::new(self.head_channels, self.num_classes).init(device);

        EfficientNet {
            stem,
            blocks,
            head_conv,
            classifier,
            stage_ends: Ignored(self.stage_ends()),
        }
    }

    /// Cumulative block count at the end of each stage.
    pub fn stage_ends(&self) -> Vec<usize> {
        self.stages
            .iter()
            .scan(0, |end, stage| {
                *end += stage.layers;
                Some(*end)
            })
            .collect()
    }

    /// Index of the first block of every stage, in `blocks` order.
    pub fn stage_offsets(&self) -> Vec<usize> {
        let mut offsets = vec![0];
        offsets.extend(self.stage_ends());
        offsets.truncate(self.stages.len());
        offsets
    }

    /// Layer names accepted by [`FeatureTap`], in forward order.
    pub fn tap_layers(&self) -> Vec<String> {
        layer_names(self.stages.len())
    }
}

fn layer_names(stages: usize) -> Vec<String> {
    std::iter::once(STEM_LAYER.to_string())
        .chain((1..=stages).map(|i| format!("stage{i}")))
        .chain(std::iter::once(FEATURES_LAYER.to_string()))
        .collect()
}

/// Where a split forward pass stops: after `n` MBConv blocks, or after the
/// final conv block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapPoint {
    Blocks(usize),
    Features,
}

#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    pub stem: ConvBlock<B>,
    /// All MBConv blocks of all stages, flattened.
    pub blocks: Vec<MBConv<B>>,
    pub head_conv: ConvBlock<B>,
    pub classifier: Linear<B>,
    stage_ends: Ignored<Vec<usize>>,
}

impl<B: Backend> EfficientNet<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes] (logits)
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head(self.features(images))
    }

    /// Output of the last conv block, `[batch, head_channels, h, w]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(images);
        let x = self.run_blocks(x, 0..self.blocks.len());
        self.head_conv.forward(x)
    }

    /// Global average pool and linear classifier. Dropout is inference-inactive
    /// and therefore omitted.
    pub fn head(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = features.dims();
        let pooled = features.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        self.classifier.forward(pooled)
    }

    fn run_blocks(&self, mut x: Tensor<B, 4>, range: std::ops::Range<usize>) -> Tensor<B, 4> {
        for block in &self.blocks[range] {
            x = block.forward(x);
        }
        x
    }

    fn tap_point(&self, layer: &str) -> Option<TapPoint> {
        match layer {
            STEM_LAYER => Some(TapPoint::Blocks(0)),
            FEATURES_LAYER => Some(TapPoint::Features),
            other => {
                let n: usize = other.strip_prefix("stage")?.parse().ok()?;
                let end = *self.stage_ends.get(n.checked_sub(1)?)?;
                Some(TapPoint::Blocks(end))
            }
        }
    }

    pub fn num_stages(&self) -> usize {
        self.stage_ends.len()
    }

    pub fn num_classes(&self) -> usize {
        let [_, out] = self.classifier.weight.val().dims();
        out
    }
}

impl<B: Backend> FeatureTap<B> for EfficientNet<B> {
    fn tap_layers(&self) -> Vec<String> {
        layer_names(self.num_stages())
    }

    fn forward_to(&self, input: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 4>> {
        let point = self.tap_point(layer)?;
        let x = self.stem.forward(input);
        match point {
            TapPoint::Blocks(end) => Some(self.run_blocks(x, 0..end)),
            TapPoint::Features => {
                let x = self.run_blocks(x, 0..self.blocks.len());
                Some(self.head_conv.forward(x))
            }
        }
    }

    fn forward_from(&self, activation: Tensor<B, 4>, layer: &str) -> Option<Tensor<B, 2>> {
        let x = match self.tap_point(layer)? {
            TapPoint::Blocks(start) => {
                let x = self.run_blocks(activation, start..self.blocks.len());
                self.head_conv.forward(x)
            }
            TapPoint::Features => activation,
        };
        Some(self.head(x))
    }
}
