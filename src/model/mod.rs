//! Model module for plant disease classifiers built on Burn
//!
//! This module provides:
//! - `PlantCnn`: a convolutional network trained from scratch
//! - `TransferNet`: a ResNet-18 style backbone with a new head, fine-tunable
//! - `PlantClassifier`: one module type over both, used by training and inference
//!
//! Every network maps preprocessed `[N, 3, H, W]` images to `[N, C]` logits.

pub mod backbone;
pub mod cnn;
pub mod config;
pub mod transfer;

use burn::{
    module::Module,
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use tracing::info;

pub use cnn::PlantCnn;
pub use config::{CnnConfig, ModelConfig, ModelType, TransferConfig};
pub use transfer::TransferNet;

use crate::utils::error::Result;

/// Either network behind one interface
#[derive(Module, Debug)]
pub enum PlantClassifier<B: Backend> {
    Cnn(PlantCnn<B>),
    Transfer(TransferNet<B>),
}

impl<B: Backend> PlantClassifier<B> {
    /// Build for training. The transfer backbone loads its pretrained record when one is configured.
    pub fn init(
        config: &ModelConfig,
        num_classes: usize,
        image_size: [usize; 2],
        device: &B::Device,
    ) -> Result<Self> {
        config.validate(image_size)?;
        let model = match config.model_type {
            ModelType::Cnn => Self::Cnn(PlantCnn::new(&config.cnn, num_classes, image_size, device)),
            ModelType::Transfer => {
                Self::Transfer(TransferNet::pretrained(&config.transfer, num_classes, device)?)
            }
        };
        info!(
            "Built {} model: {} classes, {} parameters",
            config.model_type,
            num_classes,
            model.num_params()
        );
        Ok(model)
    }

    /// Build with random weights only, as the target for loading a saved record
    pub fn init_untrained(
        config: &ModelConfig,
        num_classes: usize,
        image_size: [usize; 2],
        device: &B::Device,
    ) -> Result<Self> {
        config.validate(image_size)?;
        Ok(match config.model_type {
            ModelType::Cnn => Self::Cnn(PlantCnn::new(&config.cnn, num_classes, image_size, device)),
            ModelType::Transfer => Self::Transfer(TransferNet::new(&config.transfer, num_classes, device)),
        })
    }

    /// # Returns
    /// * Logits `[batch_size, num_classes]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Self::Cnn(model) => model.forward(x),
            Self::Transfer(model) => model.forward(x),
        }
    }

    /// Forward pass with softmax for inference
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(x), 1)
    }

    /// Extra loss terms added during training, shape `[1]`
    pub fn regularization_loss(&self, device: &B::Device) -> Tensor<B, 1> {
        match self {
            Self::Cnn(model) => model.regularization_loss(),
            Self::Transfer(_) => Tensor::zeros([1], device),
        }
    }

    /// Set the trainable backbone depth. CNNs are always fully trainable.
    pub fn unfreeze(self, units: usize) -> Self {
        match self {
            Self::Transfer(model) => Self::Transfer(model.unfreeze(units)),
            other => other,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cnn(model) => model.num_classes(),
            Self::Transfer(model) => model.num_classes(),
        }
    }

    pub fn model_type(&self) -> ModelType {
        match self {
            Self::Cnn(_) => ModelType::Cnn,
            Self::Transfer(_) => ModelType::Transfer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn probabilities_sum_to_one(model: &PlantClassifier<TestBackend>, size: usize) {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [3, 3, size, size],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let probs = model.forward_softmax(x);
        assert_eq!(probs.dims(), [3, model.num_classes()]);

        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "row sums to {s}");
        }
    }

    #[test]
    fn test_cnn_probabilities() {
        let device = Default::default();
        let config = ModelConfig::cnn(CnnConfig::tiny());
        let model = PlantClassifier::<TestBackend>::init(&config, 4, [32, 32], &device).unwrap();
        assert_eq!(model.model_type(), ModelType::Cnn);
        probabilities_sum_to_one(&model, 32);
    }

    #[test]
    fn test_transfer_probabilities() {
        let device = Default::default();
        let config = ModelConfig::transfer(TransferConfig::tiny());
        let model = PlantClassifier::<TestBackend>::init(&config, 3, [32, 32], &device).unwrap();
        assert_eq!(model.model_type(), ModelType::Transfer);
        probabilities_sum_to_one(&model, 32);
    }

    #[test]
    fn test_regularization_only_for_cnn() {
        let device = Default::default();
        let transfer = PlantClassifier::<TestBackend>::init(
            &ModelConfig::transfer(TransferConfig::tiny()),
            2,
            [32, 32],
            &device,
        )
        .unwrap();
        let penalty = transfer.regularization_loss(&device).into_scalar().elem::<f32>();
        assert_eq!(penalty, 0.0);

        let cnn = PlantClassifier::<TestBackend>::init(&ModelConfig::cnn(CnnConfig::tiny()), 2, [32, 32], &device)
            .unwrap();
        assert!(cnn.regularization_loss(&device).into_scalar().elem::<f32>() > 0.0);
    }

    #[test]
    fn test_rejects_too_small_input() {
        let device = Default::default();
        let result = PlantClassifier::<TestBackend>::init(&ModelConfig::default(), 2, [8, 8], &device);
        assert!(result.is_err());
    }
}
