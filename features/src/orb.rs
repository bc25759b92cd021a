//! Oriented multi-scale corner extractor.
//!
//! Harris corners are detected on every level of a scale pyramid, oriented by
//! the intensity centroid of a circular patch and described with a steered
//! BRIEF pattern. Keypoint coordinates are reported in level-0 pixels.

use crate::brief::BriefPattern;
use crate::harris::{harris_detect, HarrisParams};
use cv_core::{Descriptor, Descriptors, KeyPoint, KeyPoints};
use cv_imgproc::{downscale_f32, gaussian_blur_f32, GrayF32};
use rayon::prelude::*;
use tracing::debug;

/// Multi-scale Harris + steered BRIEF extractor.
#[derive(Debug, Clone)]
pub struct Orb {
    n_features: usize,
    scale_factor: f32,
    n_levels: usize,
    patch_size: u32,
    blur_sigma: f32,
    harris: HarrisParams,
    pattern: BriefPattern,
}

impl Default for Orb {
    fn default() -> Self {
        let patch_size = 31;
        Self {
            n_features: 1500,
            scale_factor: 1.5,
            n_levels: 4,
            patch_size,
            blur_sigma: 1.2,
            harris: HarrisParams {
                border: patch_size / 2 + 1,
                ..HarrisParams::default()
            },
            pattern: BriefPattern::new((patch_size / 2) as f32 - 2.0),
        }
    }
}

impl Orb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_features(mut self, n: usize) -> Self {
        self.n_features = n;
        self
    }

    pub fn with_n_levels(mut self, n: usize) -> Self {
        self.n_levels = n.max(1);
        self
    }

    pub fn with_scale_factor(mut self, factor: f32) -> Self {
        self.scale_factor = factor.max(1.01);
        self
    }

    pub fn with_quality_level(mut self, quality: f32) -> Self {
        self.harris.quality_level = quality;
        self
    }

    /// Detect, orient and describe. Keypoints and descriptors share indices.
    pub fn detect_and_compute(&self, image: &GrayF32) -> (KeyPoints, Descriptors) {
        let min_side = self.patch_size + 2 * self.harris.border;
        let mut levels = vec![(image.clone(), 1.0f32, 1.0f32)];
        for l in 1..self.n_levels {
            let factor = self.scale_factor.powi(l as i32);
            let scaled = downscale_f32(image, factor);
            if scaled.width() < min_side || scaled.height() < min_side {
                break;
            }
            let sx = image.width() as f32 / scaled.width() as f32;
            let sy = image.height() as f32 / scaled.height() as f32;
            levels.push((scaled, sx, sy));
        }

        let per_level: Vec<Vec<Descriptor>> = levels
            .par_iter()
            .enumerate()
            .map(|(octave, (level, sx, sy))| self.process_level(level, octave as i32, *sx, *sy))
            .collect();

        let mut all: Vec<Descriptor> = per_level.into_iter().flatten().collect();
        all.sort_by(|a, b| a.keypoint.response_order(&b.keypoint));
        all.truncate(self.n_features);

        debug!(
            levels = levels.len(),
            keypoints = all.len(),
            "extracted oriented corners"
        );

        let keypoints = KeyPoints {
            keypoints: all.iter().map(|d| d.keypoint).collect(),
        };
        (keypoints, Descriptors { descriptors: all })
    }

    fn process_level(&self, level: &GrayF32, octave: i32, sx: f32, sy: f32) -> Vec<Descriptor> {
        let smoothed = gaussian_blur_f32(level, self.blur_sigma);
        let mut corners = harris_detect(&smoothed, &self.harris);
        corners.keypoints.truncate(self.n_features);

        let half = (self.patch_size / 2) as i32;
        corners
            .iter()
            .filter_map(|kp| {
                let angle = intensity_centroid_angle(&smoothed, kp.x as i32, kp.y as i32, half);
                let data = self
                    .pattern
                    .describe(&smoothed, kp.x as f32, kp.y as f32, angle)?;
                let full = KeyPoint::new(
                    (kp.x + 0.5) * sx as f64 - 0.5,
                    (kp.y + 0.5) * sy as f64 - 0.5,
                )
                .with_size(self.patch_size as f64 * sx as f64)
                .with_angle((angle as f64).to_degrees())
                .with_response(kp.response)
                .with_octave(octave);
                Some(Descriptor::new(data, full))
            })
            .collect()
    }
}

/// Orientation (radians) of the intensity centroid over a disc of `radius`.
pub fn intensity_centroid_angle(image: &GrayF32, cx: i32, cy: i32, radius: i32) -> f32 {
    let w = image.width() as i32;
    let h = image.height() as i32;
    let raw = image.as_raw();
    let r2 = radius * radius;

    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -radius..=radius {
        let y = cy + dy;
        if y < 0 || y >= h {
            continue;
        }
        for dx in -radius..=radius {
            let x = cx + dx;
            if dx * dx + dy * dy > r2 || x < 0 || x >= w {
                continue;
            }
            let v = raw[(y * w + x) as usize];
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}
