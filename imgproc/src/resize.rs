use crate::{validate_image_size, GrayF32, Result};
use image::imageops::{self, FilterType};
use image::GrayImage;

pub fn resize_gray(src: &GrayImage, width: u32, height: u32) -> Result<GrayImage> {
    validate_image_size(src.width(), src.height())?;
    validate_image_size(width, height)?;
    Ok(imageops::resize(src, width, height, FilterType::Triangle))
}

/// Downscale so the longer side is at most `max_dimension`.
///
/// Returns the resized image and the applied scale (`dst / src`, `1.0` when
/// the image already fits).
pub fn resize_to_max_dimension(src: &GrayImage, max_dimension: u32) -> Result<(GrayImage, f64)> {
    let longest = src.width().max(src.height());
    if max_dimension == 0 || longest <= max_dimension {
        return Ok((src.clone(), 1.0));
    }

    let scale = max_dimension as f64 / longest as f64;
    let w = ((src.width() as f64 * scale).round() as u32).max(1);
    let h = ((src.height() as f64 * scale).round() as u32).max(1);
    let sx = w as f64 / src.width() as f64;
    let sy = h as f64 / src.height() as f64;
    Ok((resize_gray(src, w, h)?, 0.5 * (sx + sy)))
}

/// Shrink a float image by `factor` (> 1).
pub fn downscale_f32(src: &GrayF32, factor: f32) -> GrayF32 {
    let w = ((src.width() as f32 / factor).round() as u32).max(1);
    let h = ((src.height() as f32 / factor).round() as u32).max(1);
    imageops::resize(src, w, h, FilterType::Triangle)
}
