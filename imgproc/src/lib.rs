pub mod convolve;
pub mod distance;
pub mod geometry;
pub mod pyramid;
pub mod resize;

pub use convolve::*;
pub use distance::*;
pub use geometry::*;
pub use pyramid::*;
pub use resize::*;

use image::{ImageBuffer, Luma};

/// Single channel float image, intensities in `[0, 1]` unless noted.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

pub type Result<T> = std::result::Result<T, ImgprocError>;

#[derive(Debug, thiserror::Error)]
pub enum ImgprocError {
    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

pub fn validate_image_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(ImgprocError::DimensionMismatch(
            "Image dimensions must be non-zero".into(),
        ));
    }
    Ok(())
}
