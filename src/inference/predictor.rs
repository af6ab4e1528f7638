//! Inference Predictor Module
//!
//! Reloads a trained model directory and classifies image files.
//! Callers pass raw images; the preprocessing recorded in the metadata is
//! applied here, exactly once.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor, TensorData},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifacts::catalog::ClassCatalog;
use crate::artifacts::metadata::ModelMetadata;
use crate::artifacts::model_io::{load_model, ArtifactPaths};
use crate::dataset::preprocess::{image_to_chw, open_image, resize_rgb};
use crate::model::PlantClassifier;
use crate::utils::error::{PlantDiseaseError, Result};

/// Indices of the `k` largest probabilities, highest first. Ties keep the lower index first.
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    // stable sort
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k.min(probs.len()));
    indexed
}

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Path to the input image (if applicable)
    pub image_path: Option<PathBuf>,

    /// Predicted class index
    pub predicted_class: usize,

    /// Predicted class name
    pub class_name: String,

    /// Probability of the predicted class
    pub confidence: f32,

    /// Full probability distribution over all classes
    pub probabilities: Vec<f32>,

    /// Top-k predictions with their probabilities
    pub top_k: Vec<(usize, String, f32)>,

    /// Inference time in milliseconds
    pub inference_time_ms: f64,
}

impl PredictionResult {
    pub fn new(
        probabilities: Vec<f32>,
        k: usize,
        catalog: &ClassCatalog,
        inference_time: Duration,
        image_path: Option<PathBuf>,
    ) -> Self {
        let (predicted_class, confidence) = top_k(&probabilities, 1).first().copied().unwrap_or((0, 0.0));

        let top_k = top_k(&probabilities, k)
            .into_iter()
            .map(|(idx, prob)| (idx, catalog.display_name(idx), prob))
            .collect();

        Self {
            image_path,
            predicted_class,
            class_name: catalog.display_name(predicted_class),
            confidence,
            probabilities,
            top_k,
            inference_time_ms: inference_time.as_secs_f64() * 1000.0,
        }
    }

    /// Overlay title, e.g. `Tomato_Early_blight 97.31%`
    pub fn title(&self) -> String {
        format!("{} {:.2}%", self.class_name, self.confidence * 100.0)
    }

    /// Pretty print the prediction result
    pub fn display(&self) -> String {
        let mut output = String::new();

        if let Some(path) = &self.image_path {
            output.push_str(&format!("Image: {}\n", path.display()));
        }

        output.push_str(&format!(
            "Prediction: {} (class {})\n",
            self.class_name, self.predicted_class
        ));
        output.push_str(&format!("Confidence: {:.2}%\n", self.confidence * 100.0));
        output.push_str(&format!("Inference time: {:.2} ms\n", self.inference_time_ms));

        output.push_str(&format!("\nTop-{} predictions:\n", self.top_k.len()));
        for (i, (idx, name, prob)) in self.top_k.iter().enumerate() {
            output.push_str(&format!(
                "  {}. {} (class {}) - {:.2}%\n",
                i + 1,
                name,
                idx,
                prob * 100.0
            ));
        }

        output
    }
}

/// A loaded model directory ready to classify images
pub struct Predictor<B: Backend> {
    model: PlantClassifier<B>,
    metadata: ModelMetadata,
    catalog: ClassCatalog,
    model_path: PathBuf,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// Read metadata, class catalog and weights from `model_dir`
    pub fn load<P: AsRef<Path>>(model_dir: P, device: &B::Device) -> Result<Self> {
        let paths = ArtifactPaths::new(model_dir);
        if !paths.dir.is_dir() {
            return Err(PlantDiseaseError::ArtifactNotFound(paths.dir));
        }

        let metadata = ModelMetadata::load(&paths.metadata())?;
        let catalog = ClassCatalog::load(&paths.resolve_class_names()?)?;

        if catalog.len() != metadata.num_classes {
            return Err(PlantDiseaseError::Model(format!(
                "class catalog has {} entries but the model was trained on {} classes",
                catalog.len(),
                metadata.num_classes
            )));
        }
        if catalog.names() != metadata.class_names.as_slice() {
            warn!("Class catalog names differ from metadata; using the catalog");
        }

        let model_path = paths.resolve_model()?;
        let model = load_model::<B>(&metadata, &model_path, device)?;

        Ok(Self {
            model,
            metadata,
            catalog,
            model_path,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn num_params(&self) -> usize {
        self.model.num_params()
    }

    /// Expected input shape `[1, 3, H, W]`
    pub fn input_shape(&self) -> [usize; 4] {
        let [h, w] = self.metadata.image_size;
        [1, 3, h, w]
    }

    /// Logits shape `[1, num_classes]`
    pub fn output_shape(&self) -> [usize; 2] {
        [1, self.metadata.num_classes]
    }

    /// Class probabilities for one decoded image of any size
    pub fn probabilities(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let [height, width] = self.metadata.image_size;
        let chw = image_to_chw(&resize_rgb(image, self.metadata.image_size));
        let input = Tensor::<B, 4>::from_floats(TensorData::new(chw, [1, 3, height, width]), &self.device);
        let input = self.metadata.preprocessing.apply(input);

        self.model
            .forward_softmax(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| PlantDiseaseError::Inference(format!("failed to read probabilities: {e:?}")))
    }

    /// Classify an already decoded image. `source` is recorded in the result.
    pub fn predict_image(
        &self,
        image: &DynamicImage,
        k: usize,
        source: Option<&Path>,
    ) -> Result<PredictionResult> {
        let start = Instant::now();
        let probabilities = self.probabilities(image)?;
        let result = PredictionResult::new(
            probabilities,
            k,
            &self.catalog,
            start.elapsed(),
            source.map(Path::to_path_buf),
        );
        if let Some(path) = source {
            debug!("{} -> {}", path.display(), result.title());
        }
        Ok(result)
    }

    /// Decode, resize and classify an image file
    pub fn predict_file<P: AsRef<Path>>(&self, path: P, k: usize) -> Result<PredictionResult> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PlantDiseaseError::NotFound(path.to_path_buf()));
        }
        self.predict_image(&open_image(path)?, k, Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::model_io::{save_model, FINAL_MODEL};
    use crate::dataset::preprocess::load_rgb;
    use crate::model::config::{CnnConfig, ModelConfig};
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn write_model_dir(dir: &Path, names: &[&str]) -> PlantClassifier<TestBackend> {
        let device = Default::default();
        let config = ModelConfig::cnn(CnnConfig::tiny());
        let catalog = ClassCatalog::new(names.iter().map(|s| s.to_string()).collect());
        let model =
            PlantClassifier::<TestBackend>::init_untrained(&config, catalog.len(), [32, 32], &device).unwrap();

        save_model(&model, dir, FINAL_MODEL).unwrap();
        catalog.save(&dir.join("class_names.json")).unwrap();
        ModelMetadata::new(&config, &catalog, [32, 32])
            .save(&dir.join("metadata.json"))
            .unwrap();
        model
    }

    fn write_image(path: &Path) {
        RgbImage::from_fn(50, 40, |x, y| Rgb([(x * 5) as u8, (y * 6) as u8, 90]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_top_k_order() {
        let ranked = top_k(&[0.05, 0.7, 0.1, 0.15], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 1);
        assert!((ranked[0].1 - 0.70).abs() < 1e-6);
        assert_eq!(ranked[1].0, 3);
        assert!((ranked[1].1 - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_capped_and_ties() {
        assert_eq!(top_k(&[0.2, 0.8], 10).len(), 2);
        assert!(top_k(&[0.2, 0.8], 0).is_empty());

        let ranked = top_k(&[0.25, 0.25, 0.5], 3);
        assert_eq!(ranked.iter().map(|r| r.0).collect::<Vec<_>>(), vec![2, 0, 1]);
    }

    #[test]
    fn test_unknown_class_name() {
        let catalog = ClassCatalog::new(vec!["a".into()]);
        let result = PredictionResult::new(vec![0.1, 0.9], 2, &catalog, Duration::ZERO, None);
        assert_eq!(result.class_name, "Class_01 (Unknown)");
        assert_eq!(result.top_k[1].1, "a");
    }

    #[test]
    fn test_predict_file_matches_saved_model() {
        let dir = TempDir::new().unwrap();
        let model = write_model_dir(dir.path(), &["a", "b", "c"]);
        let image_path = dir.path().join("leaf.png");
        write_image(&image_path);

        let predictor = Predictor::<TestBackend>::load(dir.path(), &Default::default()).unwrap();
        assert_eq!(predictor.input_shape(), [1, 3, 32, 32]);

        let result = predictor.predict_file(&image_path, 10).unwrap();
        assert_eq!(result.top_k.len(), 3);
        assert_eq!(result.probabilities.len(), 3);
        let sum: f32 = result.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        // Same input through the in-memory model
        let rgb = load_rgb(&image_path, [32, 32]).unwrap();
        let input = Tensor::<TestBackend, 4>::from_floats(
            TensorData::new(image_to_chw(&rgb), [1, 3, 32, 32]),
            &Default::default(),
        );
        let input = crate::dataset::preprocess::Preprocessing::rescale().apply(input);
        let expected: Vec<f32> = model.forward_softmax(input).into_data().to_vec().unwrap();
        let (expected_class, expected_prob) = top_k(&expected, 1)[0];

        assert_eq!(result.predicted_class, expected_class);
        assert!((result.confidence - expected_prob).abs() < 1e-5);
    }

    #[test]
    fn test_predict_image_matches_file() {
        let dir = TempDir::new().unwrap();
        write_model_dir(dir.path(), &["a", "b"]);
        let image_path = dir.path().join("leaf.png");
        write_image(&image_path);

        let predictor = Predictor::<TestBackend>::load(dir.path(), &Default::default()).unwrap();
        assert_eq!(predictor.output_shape(), [1, 2]);

        let decoded = image::open(&image_path).unwrap();
        let from_memory = predictor.predict_image(&decoded, 2, None).unwrap();
        let from_file = predictor.predict_file(&image_path, 2).unwrap();

        assert!(from_memory.image_path.is_none());
        assert_eq!(from_file.image_path.as_deref(), Some(image_path.as_path()));
        assert_eq!(from_memory.predicted_class, from_file.predicted_class);
        for (a, b) in from_memory.probabilities.iter().zip(&from_file.probabilities) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(predictor.probabilities(&decoded).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let result = Predictor::<TestBackend>::load(dir.path().join("absent"), &Default::default());
        assert!(matches!(result, Err(PlantDiseaseError::ArtifactNotFound(_))));

        let result = Predictor::<TestBackend>::load(dir.path(), &Default::default());
        assert!(matches!(result, Err(PlantDiseaseError::ArtifactNotFound(_))));
    }

    #[test]
    fn test_catalog_length_mismatch() {
        let dir = TempDir::new().unwrap();
        write_model_dir(dir.path(), &["a", "b"]);
        ClassCatalog::new(vec!["a".into(), "b".into(), "c".into()])
            .save(&dir.path().join("class_names.json"))
            .unwrap();

        let result = Predictor::<TestBackend>::load(dir.path(), &Default::default());
        assert!(matches!(result, Err(PlantDiseaseError::Model(_))));
    }

    #[test]
    fn test_missing_image() {
        let dir = TempDir::new().unwrap();
        write_model_dir(dir.path(), &["a", "b"]);
        let predictor = Predictor::<TestBackend>::load(dir.path(), &Default::default()).unwrap();
        assert!(matches!(
            predictor.predict_file(dir.path().join("nope.jpg"), 1),
            Err(PlantDiseaseError::NotFound(_))
        ));
    }
}
