//! Transfer network: pretrained ResNet backbone plus a new classification head
//!
//! Head: GlobalAvgPool -> BatchNorm -> Dropout(0.3) -> Dense(128, ReLU) -> Dropout(0.2) -> Dense(C)

use burn::{
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use tracing::{info, warn};

use crate::model::backbone::{ResNetBackbone, BACKBONE_UNITS};
use crate::model::config::TransferConfig;
use crate::utils::error::Result;

#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub bn: BatchNorm<B>,
    pub dropout: Dropout,
    pub hidden: Linear<B>,
    pub output_dropout: Dropout,
    pub output: Linear<B>,
    pub relu: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(in_features: usize, config: &TransferConfig, num_classes: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            bn: BatchNormConfig::new(in_features).init(device),
            dropout: DropoutConfig::new(config.head_dropout).init(),
            hidden: LinearConfig::new(in_features, config.head_units).init(device),
            output_dropout: DropoutConfig::new(config.output_dropout).init(),
            output: LinearConfig::new(config.head_units, num_classes).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        // [B, C, H, W] -> [B, C, 1, 1], normalized per channel
        let x = self.bn.forward(self.pool.forward(features));
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.dropout.forward(x);
        let x = self.relu.forward(self.hidden.forward(x));
        let x = self.output_dropout.forward(x);
        self.output.forward(x)
    }
}

/// Backbone plus head. Only the last `trainable_units` backbone units learn.
#[derive(Module, Debug)]
pub struct TransferNet<B: Backend> {
    pub backbone: ResNetBackbone<B>,
    pub head: ClassifierHead<B>,
    trainable_units: usize,
    num_classes: usize,
}

impl<B: Backend> TransferNet<B> {
    /// Random weights everywhere, backbone frozen
    pub fn new(config: &TransferConfig, num_classes: usize, device: &B::Device) -> Self {
        let backbone = ResNetBackbone::new(config.stage_widths, device);
        let head = ClassifierHead::new(config.stage_widths[3], config, num_classes, device);

        Self {
            backbone,
            head,
            trainable_units: 0,
            num_classes,
        }
    }

    /// Build and load the backbone record named in the config, if any
    pub fn pretrained(config: &TransferConfig, num_classes: usize, device: &B::Device) -> Result<Self> {
        let mut net = Self::new(config, num_classes, device);
        match &config.backbone_weights {
            Some(path) => {
                info!("Loading backbone weights from {}", path.display());
                net.backbone = net.backbone.load_pretrained(path, device)?;
            }
            None => warn!("No backbone_weights configured; the frozen backbone keeps its random initialization"),
        }
        Ok(net)
    }

    /// Make the last `k` backbone units trainable and freeze the rest.
    /// `k = 0` freezes the whole backbone; `k >= 9` trains all of it.
    pub fn unfreeze(mut self, k: usize) -> Self {
        self.trainable_units = k.min(BACKBONE_UNITS);
        info!(
            "Backbone: {} of {} units trainable",
            self.trainable_units, BACKBONE_UNITS
        );
        self
    }

    pub fn trainable_units(&self) -> usize {
        self.trainable_units
    }

    pub fn frozen_units(&self) -> usize {
        BACKBONE_UNITS - self.trainable_units
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(x, self.frozen_units());
        self.head.forward(features)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let net = TransferNet::<TestBackend>::new(&TransferConfig::tiny(), 4, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(net.forward(x).dims(), [2, 4]);
        assert_eq!(net.frozen_units(), BACKBONE_UNITS);
    }

    #[test]
    fn test_unfreeze_bounds() {
        let device = Default::default();
        let net = TransferNet::<TestBackend>::new(&TransferConfig::tiny(), 2, &device);
        let net = net.unfreeze(3);
        assert_eq!(net.trainable_units(), 3);
        assert_eq!(net.frozen_units(), 6);

        let net = net.unfreeze(100);
        assert_eq!(net.frozen_units(), 0);

        let net = net.unfreeze(0);
        assert_eq!(net.trainable_units(), 0);
    }

    #[test]
    fn test_frozen_backbone_only_trains_head() {
        type AutoBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let net = TransferNet::<AutoBackend>::new(&TransferConfig::tiny(), 2, &device);

        let x = Tensor::<AutoBackend, 4>::ones([2, 3, 32, 32], &device);
        let grads = net.forward(x).sum().backward();
        assert!(net.head.output.weight.val().grad(&grads).is_some());
        assert!(net.backbone.blocks[7].conv2.weight.val().grad(&grads).is_none());

        let net = net.unfreeze(1);
        let x = Tensor::<AutoBackend, 4>::ones([2, 3, 32, 32], &device);
        let grads = net.forward(x).sum().backward();
        assert!(net.backbone.blocks[7].conv2.weight.val().grad(&grads).is_some());
        assert!(net.backbone.blocks[6].conv2.weight.val().grad(&grads).is_none());
    }

    #[test]
    fn test_frozen_backbone_keeps_statistics() {
        type AutoBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let net = TransferNet::<AutoBackend>::new(&TransferConfig::tiny(), 2, &device);
        let stem_mean = || net.backbone.stem.bn.running_mean.value().into_data().to_vec::<f32>().unwrap();
        let before = stem_mean();

        let x = Tensor::<AutoBackend, 4>::ones([2, 3, 32, 32], &device);
        let _ = net.forward(x);
        assert_eq!(stem_mean(), before);
    }

    #[test]
    fn test_missing_pretrained_file_is_error() {
        let device = Default::default();
        let config = TransferConfig {
            backbone_weights: Some("/nonexistent/backbone".into()),
            ..TransferConfig::tiny()
        };
        assert!(TransferNet::<TestBackend>::pretrained(&config, 2, &device).is_err());
    }
}
