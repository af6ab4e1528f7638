//! ResNet-18 style feature extractor
//!
//! - Stem: Conv 7x7 stride 2, BatchNorm, ReLU, MaxPool 3x3 stride 2
//! - 4 residual stages of 2 basic blocks each (stride 2 from stage 2 on)
//!
//! The stem and the 8 blocks are the backbone's "units", numbered in forward
//! order. Freezing always covers a prefix of these units.

use std::path::Path;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};

use crate::utils::error::{PlantDiseaseError, Result};

/// Stem plus eight basic blocks
pub const BACKBONE_UNITS: usize = 9;

/// BatchNorm in inference mode: normalize with the running statistics and
/// leave them untouched, whatever the backend.
fn frozen_batch_norm<B: Backend>(bn: &BatchNorm<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = bn.gamma.val().dims()[0];
    let shape = [1, channels, 1, 1];
    let mean = bn.running_mean.value().reshape(shape);
    let std = bn.running_var.value().add_scalar(bn.epsilon).sqrt().reshape(shape);
    let gamma = bn.gamma.val().reshape(shape);
    let beta = bn.beta.val().reshape(shape);
    x.sub(mean).div(std).mul(gamma).add(beta)
}

#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub pool: MaxPool2d,
    pub relu: Relu,
}

impl<B: Backend> Stem<B> {
    pub fn new(out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([3, out_channels], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }

    /// Forward with BatchNorm in inference mode
    pub fn forward_frozen(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = frozen_batch_norm(&self.bn, self.conv.forward(x));
        self.pool.forward(self.relu.forward(x))
    }
}

/// 1x1 projection for the shortcut when shape changes
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub downsample: Option<Downsample<B>>,
    pub relu: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv3x3 = |i: usize, o: usize, s: usize| {
            Conv2dConfig::new([i, o], [3, 3])
                .with_stride([s, s])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: conv3x3(in_channels, out_channels, stride),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, 1),
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = self.conv1.forward(input);
        let x = self.relu.forward(self.bn1.forward(x));
        let x = self.bn2.forward(self.conv2.forward(x));
        self.relu.forward(x + identity)
    }

    /// Forward with every BatchNorm in inference mode
    pub fn forward_frozen(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => frozen_batch_norm(&ds.bn, ds.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = frozen_batch_norm(&self.bn1, self.conv1.forward(input));
        let x = frozen_batch_norm(&self.bn2, self.conv2.forward(self.relu.forward(x)));
        self.relu.forward(x + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    pub stem: Stem<B>,
    pub blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> ResNetBackbone<B> {
    pub fn new(widths: [usize; 4], device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(BACKBONE_UNITS - 1);
        let mut channels = widths[0];
        for (stage, &width) in widths.iter().enumerate() {
            let stride = if stage == 0 { 1 } else { 2 };
            blocks.push(BasicBlock::new(channels, width, stride, device));
            blocks.push(BasicBlock::new(width, width, 1, device));
            channels = width;
        }

        Self {
            stem: Stem::new(widths[0], device),
            blocks,
        }
    }

    /// Channels of the final feature map
    pub fn out_channels(&self) -> usize {
        self.blocks
            .last()
            .map(|b| b.bn2.gamma.val().dims()[0])
            .unwrap_or(0)
    }

    /// Run the network. The first `frozen_units` units run with BatchNorm in
    /// inference mode and the gradient is cut after the last of them.
    pub fn forward(&self, x: Tensor<B, 4>, frozen_units: usize) -> Tensor<B, 4> {
        let mut x = if frozen_units > 0 {
            self.stem.forward_frozen(x)
        } else {
            self.stem.forward(x)
        };
        if frozen_units == 1 {
            x = x.detach();
        }
        for (i, block) in self.blocks.iter().enumerate() {
            // Unit index of this block is i + 1
            let unit = i + 1;
            x = if unit < frozen_units {
                block.forward_frozen(x)
            } else {
                block.forward(x)
            };
            if unit + 1 == frozen_units {
                x = x.detach();
            }
        }
        x
    }

    /// Replace the weights with a pretrained Burn record
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.to_path_buf(), &recorder, device).map_err(|e| {
            PlantDiseaseError::Model(format!(
                "failed to load backbone weights from {}: {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::AutodiffModule;
    use burn::tensor::{backend::AutodiffBackend, Distribution};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_map_shape() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new([4, 4, 8, 8], &device);
        assert_eq!(backbone.blocks.len(), BACKBONE_UNITS - 1);
        assert_eq!(backbone.out_channels(), 8);

        // 64 -> 32 (stem conv) -> 16 (pool) -> 16 -> 8 -> 4 -> 2
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        assert_eq!(backbone.forward(x, 0).dims(), [2, 8, 2, 2]);
    }

    #[test]
    fn test_first_stage_has_no_projection() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new([4, 8, 8, 16], &device);
        assert!(backbone.blocks[0].downsample.is_none());
        assert!(backbone.blocks[2].downsample.is_some());
        assert!(backbone.blocks[3].downsample.is_none());
    }

    #[test]
    fn test_frozen_prefix_gets_no_gradient() {
        type AutoBackend = burn::backend::Autodiff<TestBackend>;
        let device = Default::default();
        let backbone = ResNetBackbone::<AutoBackend>::new([4, 4, 4, 4], &device);

        let x = Tensor::<AutoBackend, 4>::ones([2, 3, 32, 32], &device);
        let grads = backbone.forward(x, 3).sum().backward();

        let stem_grad = backbone.stem.conv.weight.val().grad(&grads);
        let frozen_block = backbone.blocks[1].conv1.weight.val().grad(&grads);
        let live_block = backbone.blocks[2].conv1.weight.val().grad(&grads);
        assert!(stem_grad.is_none());
        assert!(frozen_block.is_none());
        assert!(live_block.is_some());

        // Inference copy still runs
        let inner = backbone.valid();
        let y = Tensor::<<AutoBackend as AutodiffBackend>::InnerBackend, 4>::ones([1, 3, 32, 32], &device);
        assert_eq!(inner.forward(y, 0).dims()[1], 4);
    }

    fn running_means(backbone: &ResNetBackbone<burn::backend::Autodiff<TestBackend>>) -> Vec<Vec<f32>> {
        let mut bns = vec![&backbone.stem.bn];
        for block in &backbone.blocks {
            bns.push(&block.bn1);
            bns.push(&block.bn2);
        }
        bns.iter()
            .map(|bn| bn.running_mean.value().into_data().to_vec::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_frozen_units_keep_batch_norm_statistics() {
        type AutoBackend = burn::backend::Autodiff<TestBackend>;
        let device = Default::default();
        let backbone = ResNetBackbone::<AutoBackend>::new([4, 4, 4, 4], &device);
        let before = running_means(&backbone);

        let x = Tensor::<AutoBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let _ = backbone.forward(x.clone(), BACKBONE_UNITS);
        assert_eq!(running_means(&backbone), before);

        // A fully frozen training forward matches the inference forward
        let trained = backbone.forward(x.clone(), BACKBONE_UNITS).into_data().to_vec::<f32>().unwrap();
        let inferred = backbone
            .valid()
            .forward(x.clone().inner(), 0)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for (a, b) in trained.iter().zip(&inferred) {
            assert!((a - b).abs() < 1e-5);
        }

        // Trainable units still update their statistics
        let _ = backbone.forward(x, 0);
        assert_ne!(running_means(&backbone)[0], before[0]);
    }
}
