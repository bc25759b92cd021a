use crate::{Error, Result};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::fmt;

/// Caller supplied identifier of an input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ImageId(pub u32);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ImageId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// An input photograph. The pipeline only ever reads the pixels.
#[derive(Debug, Clone)]
pub struct SourceImage {
    id: ImageId,
    pixels: DynamicImage,
}

impl SourceImage {
    pub fn new(id: impl Into<ImageId>, pixels: DynamicImage) -> Self {
        Self {
            id: id.into(),
            pixels,
        }
    }

    pub fn from_rgb(id: impl Into<ImageId>, rgb: RgbImage) -> Self {
        Self::new(id, DynamicImage::ImageRgb8(rgb))
    }

    pub fn from_rgba(id: impl Into<ImageId>, rgba: RgbaImage) -> Self {
        Self::new(id, DynamicImage::ImageRgba8(rgba))
    }

    pub fn from_gray(id: impl Into<ImageId>, gray: GrayImage) -> Self {
        Self::new(id, DynamicImage::ImageLuma8(gray))
    }

    /// Build from a row-major interleaved buffer with 1, 3 or 4 channels.
    pub fn from_raw(
        id: impl Into<ImageId>,
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(Error::InvalidImage(format!(
                "expected {expected} samples for {width}x{height}x{channels}, got {}",
                data.len()
            )));
        }

        let pixels = match channels {
            1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
            n => {
                return Err(Error::InvalidImage(format!(
                    "unsupported channel count {n}"
                )))
            }
        };

        pixels
            .map(|p| Self::new(id, p))
            .ok_or_else(|| Error::InvalidImage("buffer does not match dimensions".into()))
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn channels(&self) -> u8 {
        self.pixels.color().channel_count()
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    /// RGB copy of the pixels. Alpha is dropped.
    pub fn to_rgb(&self) -> RgbImage {
        self.pixels.to_rgb8()
    }

    pub fn to_gray(&self) -> GrayImage {
        self.pixels.to_luma8()
    }
}
