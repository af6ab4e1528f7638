//! From-scratch CNN for plant disease classification
//!
//! Architecture (default widths):
//! - 4 convolutional blocks: 32x2, 64x2, 128x2, 256
//! - ReLU after every convolution, BatchNorm after the first one in each block
//! - MaxPool 2x2 and dropout closing each block
//! - Flatten, then dense 512 / 256 with dropout 0.5, then the class logits

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::model::config::CnnConfig;

/// Convolutions sharing one BatchNorm, closed by pooling and dropout
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pub bn: BatchNorm<B>,
    pub pool: MaxPool2d,
    pub dropout: Dropout,
    pub relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, filters: &[usize], dropout: f64, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(filters.len());
        let mut channels = in_channels;
        for &out in filters {
            convs.push(
                Conv2dConfig::new([channels, out], [3, 3])
                    .with_padding(PaddingConfig2d::Same)
                    .init(device),
            );
            channels = out;
        }

        let bn_channels = filters.first().copied().unwrap_or(in_channels);

        Self {
            convs,
            bn: BatchNormConfig::new(bn_channels).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(dropout).init(),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for (i, conv) in self.convs.iter().enumerate() {
            x = self.relu.forward(conv.forward(x));
            if i == 0 {
                x = self.bn.forward(x);
            }
        }
        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// Hidden dense layer with ReLU and dropout
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    pub linear: Linear<B>,
    pub dropout: Dropout,
}

/// Plant Disease CNN
#[derive(Module, Debug)]
pub struct PlantCnn<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
    pub hidden: Vec<DenseLayer<B>>,
    pub output: Linear<B>,
    relu: Relu,
    l2: f64,
    num_classes: usize,
}

impl<B: Backend> PlantCnn<B> {
    /// Build for `[N, 3, image_size[0], image_size[1]]` inputs
    pub fn new(config: &CnnConfig, num_classes: usize, image_size: [usize; 2], device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(config.block_filters.len());
        let mut channels = 3;
        for (filters, &dropout) in config.block_filters.iter().zip(&config.block_dropout) {
            blocks.push(ConvBlock::new(channels, filters, dropout, device));
            channels = filters.last().copied().unwrap_or(channels);
        }

        let mut hidden = Vec::with_capacity(config.dense_units.len());
        let mut features = config.flatten_dim(image_size);
        for &units in &config.dense_units {
            hidden.push(DenseLayer {
                linear: LinearConfig::new(features, units).init(device),
                dropout: DropoutConfig::new(config.dense_dropout).init(),
            });
            features = units;
        }

        Self {
            blocks,
            hidden,
            output: LinearConfig::new(features, num_classes).init(device),
            relu: Relu::new(),
            l2: config.l2,
            num_classes,
        }
    }

    /// # Arguments
    /// * `x` - Preprocessed images `[batch_size, 3, height, width]`
    ///
    /// # Returns
    /// * Logits `[batch_size, num_classes]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        let [batch_size, channels, height, width] = x.dims();
        let mut x = x.reshape([batch_size, channels * height * width]);

        for layer in &self.hidden {
            x = self.relu.forward(layer.linear.forward(x));
            x = layer.dropout.forward(x);
        }

        self.output.forward(x)
    }

    /// `l2 * sum(w^2)` over the hidden dense kernels, shape `[1]`
    pub fn regularization_loss(&self) -> Tensor<B, 1> {
        let mut total: Option<Tensor<B, 1>> = None;
        for layer in &self.hidden {
            let squared = layer.linear.weight.val().powf_scalar(2.0).sum();
            total = Some(match total {
                Some(t) => t + squared,
                None => squared,
            });
        }

        match total {
            Some(t) => t.mul_scalar(self.l2),
            None => Tensor::zeros([1], &self.output.weight.val().device()),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}
