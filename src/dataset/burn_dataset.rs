//! Burn Dataset and Batcher implementations
//!
//! - `LeafDataset`: resized RGB images, cached in memory or decoded on demand
//! - `LeafBatcher`: stacks images, applies the model's preprocessing (validation/test/inference)
//! - `AugmentingBatcher`: augments each image first (training only)

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::dataset::augmentation::{AugmentationConfig, Augmenter};
use crate::dataset::loader::ImageSample;
use crate::dataset::preprocess::{image_to_chw, load_rgb, Preprocessing};
use crate::dataset::Label;
use crate::utils::error::{PlantDiseaseError, Result};

/// One decoded, resized image with its label
#[derive(Clone, Debug)]
pub struct LeafItem {
    pub image: RgbImage,
    pub label: Label,
    pub path: PathBuf,
}

impl LeafItem {
    pub fn load(sample: &ImageSample, image_size: [usize; 2]) -> Result<Self> {
        Ok(Self {
            image: load_rgb(&sample.path, image_size)?,
            label: sample.label,
            path: sample.path.clone(),
        })
    }
}

/// Dataset over one split
#[derive(Debug, Clone)]
pub struct LeafDataset {
    samples: Vec<ImageSample>,
    image_size: [usize; 2],
    cached: Option<Vec<RgbImage>>,
}

impl LeafDataset {
    /// Lazy dataset: images are decoded when requested
    pub fn new(samples: Vec<ImageSample>, image_size: [usize; 2]) -> Self {
        Self {
            samples,
            image_size,
            cached: None,
        }
    }

    /// Decode every image up front, in parallel. Fails on the first unreadable image.
    pub fn cached(samples: Vec<ImageSample>, image_size: [usize; 2], name: &str) -> Result<Self> {
        let total = samples.len();
        info!("Pre-loading {} {} images into memory", total, name);

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let loaded = AtomicUsize::new(0);
        let images = samples
            .par_iter()
            .map(|sample| {
                let result = load_rgb(&sample.path, image_size);
                let count = loaded.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 64 == 0 || count == total {
                    pb.set_position(count as u64);
                }
                result
            })
            .collect::<Result<Vec<_>>>();
        pb.finish_and_clear();

        let images = images?;
        info!("Loaded {} {} images", images.len(), name);

        Ok(Self {
            samples,
            image_size,
            cached: Some(images),
        })
    }

    /// Build from a config flag
    pub fn build(samples: Vec<ImageSample>, image_size: [usize; 2], cache: bool, name: &str) -> Result<Self> {
        if cache {
            Self::cached(samples, image_size, name)
        } else {
            Ok(Self::new(samples, image_size))
        }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn image_size(&self) -> [usize; 2] {
        self.image_size
    }

    /// Like `get`, but surfaces the decode error instead of dropping the item
    pub fn try_get(&self, index: usize) -> Result<LeafItem> {
        let sample = self.samples.get(index).ok_or_else(|| {
            PlantDiseaseError::InvalidInput(format!(
                "index {index} out of range for dataset of {}",
                self.samples.len()
            ))
        })?;

        match &self.cached {
            Some(images) => Ok(LeafItem {
                image: images[index].clone(),
                label: sample.label,
                path: sample.path.clone(),
            }),
            None => LeafItem::load(sample, self.image_size),
        }
    }
}

impl Dataset<LeafItem> for LeafDataset {
    fn get(&self, index: usize) -> Option<LeafItem> {
        match self.try_get(index) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping sample {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch ready for the model
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    /// Preprocessed images `[N, 3, H, W]`
    pub images: Tensor<B, 4>,
    /// Class indices `[N]`
    pub targets: Tensor<B, 1, Int>,
}

/// Stack images and labels into tensors, normalizing once
fn stack<B: Backend>(
    images: Vec<Vec<f32>>,
    labels: Vec<Label>,
    image_size: [usize; 2],
    preprocessing: &Preprocessing,
    device: &B::Device,
) -> LeafBatch<B> {
    let batch_size = images.len();
    let [height, width] = image_size;

    let data: Vec<f32> = images.into_iter().flatten().collect();
    let images = Tensor::<B, 4>::from_floats(TensorData::new(data, [batch_size, 3, height, width]), device);
    let images = preprocessing.apply(images);

    let targets: Vec<i64> = labels.iter().map(|l| l.index() as i64).collect();
    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), device);

    LeafBatch { images, targets }
}

/// Batcher without augmentation
#[derive(Clone, Debug)]
pub struct LeafBatcher {
    image_size: [usize; 2],
    preprocessing: Preprocessing,
}

impl LeafBatcher {
    pub fn new(image_size: [usize; 2], preprocessing: Preprocessing) -> Self {
        Self {
            image_size,
            preprocessing,
        }
    }

    pub fn preprocessing(&self) -> &Preprocessing {
        &self.preprocessing
    }
}

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for LeafBatcher {
    fn batch(&self, items: Vec<LeafItem>, device: &B::Device) -> LeafBatch<B> {
        let (images, labels) = items
            .into_iter()
            .map(|item| (image_to_chw(&item.image), item.label))
            .unzip();
        stack(images, labels, self.image_size, &self.preprocessing, device)
    }
}

/// Batcher that augments every image before stacking.
///
/// Each batch draws a fresh RNG from `seed` and a shared counter, so a run is
/// reproducible while successive batches see different transforms.
#[derive(Clone, Debug)]
pub struct AugmentingBatcher {
    inner: LeafBatcher,
    augmenter: Augmenter,
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl AugmentingBatcher {
    pub fn new(
        image_size: [usize; 2],
        preprocessing: Preprocessing,
        config: AugmentationConfig,
        seed: u64,
    ) -> Self {
        Self {
            inner: LeafBatcher::new(image_size, preprocessing),
            augmenter: Augmenter::new(config),
            seed,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_rng(&self) -> ChaCha8Rng {
        let batch_index = self.counter.fetch_add(1, Ordering::Relaxed);
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(batch_index.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}

impl<B: Backend> Batcher<B, LeafItem, LeafBatch<B>> for AugmentingBatcher {
    fn batch(&self, items: Vec<LeafItem>, device: &B::Device) -> LeafBatch<B> {
        let mut rng = self.next_rng();
        let (images, labels) = items
            .into_iter()
            .map(|item| (image_to_chw(&self.augmenter.augment(&item.image, &mut rng)), item.label))
            .unzip();
        stack(images, labels, self.inner.image_size, &self.inner.preprocessing, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::Rgb;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn write_samples(dir: &Path, count: usize) -> Vec<ImageSample> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("leaf_{i}.png"));
                RgbImage::from_pixel(20, 12, Rgb([255, (i * 40) as u8, 0])).save(&path).unwrap();
                ImageSample {
                    path,
                    label: Label::new(i % 2, 2).unwrap(),
                }
            })
            .collect()
    }

    #[test]
    fn test_cached_and_lazy_agree() {
        let dir = TempDir::new().unwrap();
        let samples = write_samples(dir.path(), 3);

        let lazy = LeafDataset::new(samples.clone(), [8, 8]);
        let cached = LeafDataset::cached(samples, [8, 8], "test").unwrap();

        assert_eq!(lazy.len(), 3);
        let a = lazy.get(1).unwrap();
        let b = cached.get(1).unwrap();
        assert_eq!(a.image, b.image);
        assert_eq!(a.image.dimensions(), (8, 8));
        assert_eq!(a.label, b.label);
        assert!(lazy.get(3).is_none());
    }

    #[test]
    fn test_cached_fails_on_broken_image() {
        let dir = TempDir::new().unwrap();
        let mut samples = write_samples(dir.path(), 2);
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"garbage").unwrap();
        samples.push(ImageSample {
            path: broken.clone(),
            label: Label::new(0, 2).unwrap(),
        });

        match LeafDataset::cached(samples, [8, 8], "test") {
            Err(PlantDiseaseError::ImageLoad(path, _)) => assert_eq!(path, broken),
            other => panic!("expected ImageLoad, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn test_batch_shapes_and_rescale() {
        let dir = TempDir::new().unwrap();
        let dataset = LeafDataset::new(write_samples(dir.path(), 4), [6, 10]);
        let items: Vec<LeafItem> = (0..4).filter_map(|i| dataset.get(i)).collect();

        let batcher = LeafBatcher::new([6, 10], Preprocessing::rescale());
        let batch: LeafBatch<TestBackend> = batcher.batch(items, &Default::default());

        assert_eq!(batch.images.dims(), [4, 3, 6, 10]);
        assert_eq!(batch.targets.dims(), [4]);

        let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(targets, vec![0, 1, 0, 1]);

        let pixels: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
        // Red channel of the first image is saturated
        assert!((pixels[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_augmenting_batcher_shapes() {
        let dir = TempDir::new().unwrap();
        let dataset = LeafDataset::new(write_samples(dir.path(), 2), [8, 8]);
        let items: Vec<LeafItem> = (0..2).filter_map(|i| dataset.get(i)).collect();

        let batcher = AugmentingBatcher::new([8, 8], Preprocessing::imagenet(), AugmentationConfig::default(), 5);
        let first: LeafBatch<TestBackend> = batcher.batch(items.clone(), &Default::default());
        let second: LeafBatch<TestBackend> = batcher.batch(items, &Default::default());

        assert_eq!(first.images.dims(), [2, 3, 8, 8]);
        assert_eq!(second.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batcher.counter.load(Ordering::Relaxed), 2);
    }
}
