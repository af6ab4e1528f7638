//! Data Augmentation for the training split
//!
//! Random horizontal flip, small rotation and small zoom. Rotation and zoom
//! are folded into one affine resample with bilinear interpolation and
//! reflected borders, so the image never gains black corners.
//!
//! Only the training batcher augments. Validation, test and inference images
//! pass through untouched.

use image::{Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub enabled: bool,
    /// Probability of a horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Rotation range as a fraction of a full turn; 0.1 means up to ±36°
    pub rotation_factor: f32,
    /// Zoom range; 0.1 samples a scale in [0.9, 1.1]
    pub zoom_factor: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizontal_flip_prob: 0.5,
            rotation_factor: 0.1,
            zoom_factor: 0.1,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            enabled: false,
            horizontal_flip_prob: 0.0,
            rotation_factor: 0.0,
            zoom_factor: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled
            && (self.horizontal_flip_prob > 0.0 || self.rotation_factor > 0.0 || self.zoom_factor > 0.0)
    }
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Apply the configured augmentations. Output has the input's dimensions.
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        if !self.config.is_active() {
            return img.clone();
        }

        let mut result = if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            image::imageops::flip_horizontal(img)
        } else {
            img.clone()
        };

        let angle = if self.config.rotation_factor > 0.0 {
            let max = self.config.rotation_factor * std::f32::consts::TAU;
            rng.gen_range(-max..=max)
        } else {
            0.0
        };

        let scale = if self.config.zoom_factor > 0.0 {
            let z = self.config.zoom_factor.min(0.9);
            rng.gen_range(1.0 - z..=1.0 + z)
        } else {
            1.0
        };

        if angle.abs() > 1e-4 || (scale - 1.0).abs() > 1e-4 {
            result = affine_resample(&result, angle, scale);
        }

        result
    }
}

/// Rotate by `angle` radians and scale sampling coordinates by `scale` around
/// the image center. `scale > 1` zooms out, `scale < 1` zooms in.
pub fn affine_resample(img: &RgbImage, angle: f32, scale: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin_a, cos_a) = angle.sin_cos();

    let mut output = RgbImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let dx = (x as f32 - cx) * scale;
            let dy = (y as f32 - cy) * scale;

            // Inverse rotation maps each output pixel back into the source
            let src_x = cx + dx * cos_a + dy * sin_a;
            let src_y = cy - dx * sin_a + dy * cos_a;

            output.put_pixel(x, y, bilinear_sample(img, src_x, src_y));
        }
    }
    output
}

/// Reflect an index into `0..len` as `d c b a | a b c d | d c b a`
fn reflect(i: i64, len: i64) -> u32 {
    if len <= 1 {
        return 0;
    }
    let period = 2 * len;
    let m = i.rem_euclid(period);
    (if m < len { m } else { period - 1 - m }) as u32
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let (w, h) = (width as i64, height as i64);

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p00 = img.get_pixel(reflect(x0, w), reflect(y0, h));
    let p10 = img.get_pixel(reflect(x0 + 1, w), reflect(y0, h));
    let p01 = img.get_pixel(reflect(x0, w), reflect(y0 + 1, h));
    let p11 = img.get_pixel(reflect(x0 + 1, w), reflect(y0 + 1, h));

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}
