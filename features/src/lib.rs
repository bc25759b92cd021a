//! Feature extraction and two-view verification.
//!
//! - [`orb`]: multi-scale Harris corners with steered BRIEF descriptors
//! - [`matcher`]: Hamming kNN matching with ratio test and cross check
//! - [`ransac`]: normalized-DLT homography under RANSAC

pub mod brief;
pub mod harris;
pub mod matcher;
pub mod orb;
pub mod ransac;

pub use brief::*;
pub use harris::*;
pub use matcher::*;
pub use orb::*;
pub use ransac::*;

use cv_core::{Descriptors, KeyPoint, KeyPoints, SourceImage};
use cv_imgproc::{resize_to_max_dimension, to_gray_f32};
use tracing::debug;

pub type Result<T> = std::result::Result<T, FeatureError>;

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("Image too small: {width}x{height} (minimum {min}x{min})")]
    ImageTooSmall { width: u32, height: u32, min: u32 },

    #[error("Detection error: {0}")]
    DetectionError(String),
}

/// Extraction settings shared by every image of a run.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_features: usize,
    pub min_dimension: u32,
    /// Detect on a copy whose longer side is at most this many pixels.
    pub registration_max_dimension: Option<u32>,
    pub n_levels: usize,
    pub scale_factor: f32,
    pub quality_level: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_features: 1500,
            min_dimension: 16,
            registration_max_dimension: Some(1000),
            n_levels: 4,
            scale_factor: 1.5,
            quality_level: 0.01,
        }
    }
}

/// Keypoints and descriptors of one image; index `i` of both refer to the
/// same feature. Coordinates are full-resolution pixels.
#[derive(Debug, Clone, Default)]
pub struct ImageFeatures {
    pub keypoints: KeyPoints,
    pub descriptors: Descriptors,
}

impl ImageFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

pub fn check_image_size(width: u32, height: u32, min: u32) -> Result<()> {
    if width < min || height < min {
        return Err(FeatureError::ImageTooSmall { width, height, min });
    }
    Ok(())
}

/// Detect and describe features of `image`.
pub fn extract_features(image: &SourceImage, config: &ExtractorConfig) -> Result<ImageFeatures> {
    check_image_size(image.width(), image.height(), config.min_dimension)?;

    let gray = image.to_gray();
    let (full_w, full_h) = gray.dimensions();
    let reg = match config.registration_max_dimension {
        Some(max) => {
            resize_to_max_dimension(&gray, max)
                .map_err(|e| FeatureError::DetectionError(e.to_string()))?
                .0
        }
        None => gray,
    };
    let sx = full_w as f64 / reg.width() as f64;
    let sy = full_h as f64 / reg.height() as f64;

    let orb = Orb::new()
        .with_n_features(config.max_features)
        .with_n_levels(config.n_levels)
        .with_scale_factor(config.scale_factor)
        .with_quality_level(config.quality_level);
    let (mut keypoints, mut descriptors) = orb.detect_and_compute(&to_gray_f32(&reg));

    if sx != 1.0 || sy != 1.0 {
        let rescale = |kp: &mut KeyPoint| {
            kp.x = (kp.x + 0.5) * sx - 0.5;
            kp.y = (kp.y + 0.5) * sy - 0.5;
            kp.size *= sx;
        };
        keypoints.keypoints.iter_mut().for_each(|kp| rescale(kp));
        descriptors
            .descriptors
            .iter_mut()
            .for_each(|d| rescale(&mut d.keypoint));
    }

    debug!(
        image = %image.id(),
        keypoints = keypoints.len(),
        registration_scale = 1.0 / sx,
        "features extracted"
    );

    Ok(ImageFeatures {
        keypoints,
        descriptors,
    })
}
