use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

/// Reference images sent to providers are kept under this size.
pub const REFERENCE_MAX_BYTES: usize = 200 * 1024;

/// PNG thumbnail no wider than `max_width`; narrower images are re-encoded as is.
pub fn make_thumbnail(bytes: &[u8], max_width: u32) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).context("thumbnail source is not a decodable image")?;
    let (width, height) = (image.width(), image.height());
    let max_width = max_width.max(1);
    let thumb = if width > max_width {
        let scaled_height = ((u64::from(height) * u64::from(max_width)) / u64::from(width)).max(1);
        image.resize_exact(max_width, scaled_height as u32, FilterType::Triangle)
    } else {
        image
    };
    encode_png(&thumb)
}

/// Shrink a reference image until it fits `max_bytes`.
///
/// Undecodable input is passed through untouched; the provider gets the final say.
pub fn compress_reference(bytes: &[u8], max_bytes: usize) -> Vec<u8> {
    if bytes.len() <= max_bytes {
        return bytes.to_vec();
    }
    let Ok(image) = image::load_from_memory(bytes) else {
        tracing::warn!(size = bytes.len(), "reference image could not be decoded; sending as is");
        return bytes.to_vec();
    };

    let mut current = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut best: Option<Vec<u8>> = None;
    for _ in 0..10 {
        for quality in [85u8, 70, 55, 40] {
            let Ok(encoded) = encode_jpeg(&current, quality) else {
                continue;
            };
            if encoded.len() <= max_bytes {
                tracing::debug!(from = bytes.len(), to = encoded.len(), quality, "reference image compressed");
                return encoded;
            }
            if best.as_ref().map_or(true, |kept| encoded.len() < kept.len()) {
                best = Some(encoded);
            }
        }
        let (width, height) = (current.width(), current.height());
        if width <= 64 || height <= 64 {
            break;
        }
        current = current.resize_exact(width * 3 / 4, height * 3 / 4, FilterType::Triangle);
    }
    best.unwrap_or_else(|| bytes.to_vec())
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .context("PNG encode failed")?;
    Ok(out.into_inner())
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .context("JPEG encode failed")?;
    Ok(bytes)
}
