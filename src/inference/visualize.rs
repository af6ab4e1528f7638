//! Prediction overlays: the source image under a title band reading
//! `"<class> <confidence>%"`.

use std::path::{Path, PathBuf};

use ab_glyph::{Font, FontVec, ScaleFont};
use image::{imageops, DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{debug, info, warn};

use crate::config::InferenceConfig;
use crate::inference::predictor::PredictionResult;
use crate::utils::error::{PlantDiseaseError, Result};

const BAND_COLOR: Rgb<u8> = Rgb([24, 24, 24]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const MIN_FONT_SIZE: f32 = 8.0;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Font and layout for overlays. Without a font only the band is drawn.
pub struct OverlayConfig {
    pub font: Option<FontVec>,
    pub font_scale: f32,
    pub band_height: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            font: None,
            font_scale: 24.0,
            band_height: 36,
        }
    }
}

impl OverlayConfig {
    pub fn with_font_path(font_path: &Path) -> Result<Self> {
        let data = std::fs::read(font_path)?;
        let font = FontVec::try_from_vec(data).map_err(|_| {
            PlantDiseaseError::InvalidInput(format!("failed to parse font file {}", font_path.display()))
        })?;
        Ok(Self {
            font: Some(font),
            ..Self::default()
        })
    }

    /// Try common system font locations
    pub fn with_system_font() -> Self {
        for path in SYSTEM_FONTS {
            if let Ok(data) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(data) {
                    info!("Loaded system font: {}", path);
                    return Self {
                        font: Some(font),
                        ..Self::default()
                    };
                }
            }
        }
        warn!("No system font found; overlays will have no title. Set inference.font_path to fix this");
        Self::default()
    }

    /// The configured font, which must load, or else a system font
    pub fn from_inference(config: &InferenceConfig) -> Result<Self> {
        match &config.font_path {
            Some(path) => Self::with_font_path(path),
            None => Ok(Self::with_system_font()),
        }
    }
}

fn text_width(text: &str, font: &FontVec, scale: f32) -> f32 {
    let scaled = font.as_scaled(scale);
    text.chars().map(|ch| scaled.h_advance(scaled.scaled_glyph(ch).id)).sum()
}

/// Draw `result`'s title above `image`
pub fn render_prediction(image: &DynamicImage, result: &PredictionResult, config: &OverlayConfig) -> RgbImage {
    let source = image.to_rgb8();
    let (width, height) = source.dimensions();
    let band = config.band_height;

    let mut canvas = RgbImage::new(width, height + band);
    draw_filled_rect_mut(&mut canvas, Rect::at(0, 0).of_size(width.max(1), band.max(1)), BAND_COLOR);
    imageops::overlay(&mut canvas, &source, 0, i64::from(band));

    let Some(font) = &config.font else {
        debug!("No font loaded; drawing the title band without text");
        return canvas;
    };

    let title = result.title();
    let padding = 6.0;
    let available = (width as f32 - 2.0 * padding).max(1.0);
    let mut scale = config.font_scale.min(band as f32 * 0.8);
    let measured = text_width(&title, font, scale);
    if measured > available {
        scale = (scale * available / measured).max(MIN_FONT_SIZE);
    }

    let x = padding as i32;
    let y = ((band as f32 - scale) / 2.0).max(0.0) as i32;
    draw_text_mut(&mut canvas, TEXT_COLOR, x, y, scale, font, &title);
    canvas
}

/// `<dir>/pred_<stem>.png`
pub fn prediction_output_path(dir: &Path, image_path: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("pred_{stem}.png"))
}

/// Render and write a PNG, creating the parent directory
pub fn save_prediction(
    image: &DynamicImage,
    result: &PredictionResult,
    config: &OverlayConfig,
    output: &Path,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    render_prediction(image, result, config)
        .save_with_format(output, image::ImageFormat::Png)
        .map_err(|e| PlantDiseaseError::Inference(format!("failed to write {}: {e}", output.display())))?;
    info!("Saved prediction overlay to {}", output.display());
    Ok(())
}
