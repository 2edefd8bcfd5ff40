use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{GenerateError, ImageGenerator, ImageRequest};

/// Offline generator: a flat PNG whose color is derived from the prompt.
#[derive(Debug, Clone, Copy)]
pub struct DryrunGenerator {
    scale_down: u32,
}

impl DryrunGenerator {
    pub fn new() -> Self {
        Self { scale_down: 4 }
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn validate_config(&self) -> bool {
        true
    }

    fn generate_image(&self, request: &ImageRequest) -> Result<Vec<u8>, GenerateError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerateError::InvalidInput("prompt is empty".to_string()));
        }
        let (width, height) = request.aspect_ratio.dims();
        let scale = self.scale_down.max(1);
        let (r, g, b) = color_from_prompt(&request.prompt, request.reference_image.as_deref());
        let mut image = RgbImage::new(width / scale, height / scale);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|err| GenerateError::Provider(format!("dryrun encode failed: {err}")))?;
        Ok(bytes.into_inner())
    }
}

fn color_from_prompt(prompt: &str, reference: Option<&[u8]>) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    if let Some(reference) = reference {
        hasher.update(reference);
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
