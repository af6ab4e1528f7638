//! Pixel decoding and normalization shared by training and inference.
//!
//! Images travel through the pipeline as raw `0..=255` values in CHW order.
//! The one place they are normalized is [`Preprocessing::apply`], which both
//! batchers and the predictor call. The chosen normalization is written to the
//! model metadata so a reloaded model sees exactly what it was trained on.

use std::path::Path;

use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use crate::utils::error::{PlantDiseaseError, Result};

/// Current preprocessing schema
pub const PREPROCESSING_VERSION: u32 = 1;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How raw pixels are mapped before the first layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// `x * scale`, typically `1/255`
    Rescale { scale: f32 },
    /// `(x / 255 - mean) / std` per channel
    ImageNet { mean: [f32; 3], std: [f32; 3] },
}

/// Versioned preprocessing recorded alongside every model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub version: u32,
    #[serde(flatten)]
    pub normalization: Normalization,
}

impl Preprocessing {
    /// Divide by 255
    pub fn rescale() -> Self {
        Self {
            version: PREPROCESSING_VERSION,
            normalization: Normalization::Rescale { scale: 1.0 / 255.0 },
        }
    }

    /// Divide by 255 then standardize with ImageNet channel statistics
    pub fn imagenet() -> Self {
        Self {
            version: PREPROCESSING_VERSION,
            normalization: Normalization::ImageNet {
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > PREPROCESSING_VERSION {
            return Err(PlantDiseaseError::UnsupportedVersion {
                found: self.version,
                supported: PREPROCESSING_VERSION,
            });
        }
        if let Normalization::ImageNet { std, .. } = self.normalization {
            if std.iter().any(|&s| s <= 0.0) {
                return Err(PlantDiseaseError::Config(
                    "normalization std must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Normalize a raw `[N, 3, H, W]` batch
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.normalization {
            Normalization::Rescale { scale } => images.mul_scalar(scale),
            Normalization::ImageNet { mean, std } => {
                let device = images.device();
                let mean = Tensor::<B, 4>::from_floats(
                    TensorData::new(mean.to_vec(), [1, 3, 1, 1]),
                    &device,
                );
                let std = Tensor::<B, 4>::from_floats(
                    TensorData::new(std.to_vec(), [1, 3, 1, 1]),
                    &device,
                );
                (images.div_scalar(255.0) - mean) / std
            }
        }
    }
}

impl std::fmt::Display for Preprocessing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.normalization {
            Normalization::Rescale { scale } => write!(f, "rescale(x{:.6}) v{}", scale, self.version),
            Normalization::ImageNet { .. } => write!(f, "imagenet mean/std v{}", self.version),
        }
    }
}

/// Decode an image file, guessing the format from its content
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| PlantDiseaseError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| PlantDiseaseError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| PlantDiseaseError::ImageLoad(path.to_path_buf(), e.to_string()))
}

/// Resize to `[height, width]` and convert to RGB8
pub fn resize_rgb(image: &DynamicImage, image_size: [usize; 2]) -> RgbImage {
    let [height, width] = image_size;
    image
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgb8()
}

/// Decode an image file to RGB8 and resize it to `[height, width]`
pub fn load_rgb(path: &Path, image_size: [usize; 2]) -> Result<RgbImage> {
    Ok(resize_rgb(&open_image(path)?, image_size))
}

/// Raw `0..=255` pixel values in CHW order
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        data[offset] = pixel[0] as f32;
        data[plane + offset] = pixel[1] as f32;
        data[2 * plane + offset] = pixel[2] as f32;
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::Rgb;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_image_to_chw_layout() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));

        let data = image_to_chw(&img);
        assert_eq!(data, vec![10.0, 40.0, 20.0, 50.0, 30.0, 60.0]);
    }

    #[test]
    fn test_rescale_applies_once() {
        let device = Default::default();
        let raw = Tensor::<TestBackend, 4>::full([1, 3, 2, 2], 255.0, &device);
        let out = Preprocessing::rescale().apply(raw);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_imagenet_normalizes_per_channel() {
        let device = Default::default();
        let raw: Vec<f32> = (0..12).map(|i| (i * 20) as f32).collect();
        let tensor = Tensor::<TestBackend, 4>::from_floats(TensorData::new(raw.clone(), [1, 3, 2, 2]), &device);

        let preprocessing = Preprocessing::imagenet();
        let Normalization::ImageNet { mean, std } = preprocessing.normalization else {
            panic!("expected ImageNet normalization");
        };
        let out: Vec<f32> = preprocessing.apply(tensor).into_data().to_vec().unwrap();

        for (i, (value, raw)) in out.iter().zip(&raw).enumerate() {
            let channel = i / 4;
            let expected = (raw / 255.0 - mean[channel]) / std[channel];
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_serde_shape_and_version_check() {
        let json = serde_json::to_value(Preprocessing::rescale()).unwrap();
        assert_eq!(json["kind"], "rescale");
        assert_eq!(json["version"], 1);

        let future = Preprocessing {
            version: PREPROCESSING_VERSION + 1,
            ..Preprocessing::imagenet()
        };
        assert!(future.validate().is_err());
        assert!(Preprocessing::imagenet().validate().is_ok());
    }

    #[test]
    fn test_load_rgb_resizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leaf.png");
        RgbImage::from_pixel(40, 30, Rgb([0, 200, 0])).save(&path).unwrap();

        let img = load_rgb(&path, [16, 24]).unwrap();
        assert_eq!(img.dimensions(), (24, 16));
    }

    #[test]
    fn test_load_rgb_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        match load_rgb(&path, [8, 8]) {
            Err(PlantDiseaseError::ImageLoad(p, _)) => assert_eq!(p, path),
            other => panic!("expected ImageLoad error, got {:?}", other.map(|_| ())),
        }
    }
}
