//! Steered BRIEF descriptor.
//!
//! The sampling pattern comes from a fixed-seed RNG, so two processes (or two
//! runs) always produce identical descriptors for the same patch.

use cv_imgproc::{sample_bilinear_f32, GrayF32};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DESCRIPTOR_BYTES: usize = 32;
const PATTERN_SEED: u64 = 0x0b51_ef00;

/// Point-pair pattern for a 256-bit descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct BriefPattern {
    pairs: Vec<[(f32, f32); 2]>,
    radius: f32,
}

impl BriefPattern {
    /// Pairs drawn uniformly from the disc of `radius` px; rotating the pattern
    /// keeps every sample inside the disc.
    pub fn new(radius: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut point = || loop {
            let x = rng.gen_range(-radius..=radius);
            let y = rng.gen_range(-radius..=radius);
            if x * x + y * y <= radius * radius {
                return (x, y);
            }
        };

        let pairs = (0..DESCRIPTOR_BYTES * 8)
            .map(|_| [point(), point()])
            .collect();
        Self { pairs, radius }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Descriptor of the patch centred on `(x, y)` rotated by `angle`
    /// (radians). `None` if the rotated pattern leaves the image.
    pub fn describe(&self, image: &GrayF32, x: f32, y: f32, angle: f32) -> Option<Vec<u8>> {
        let w = image.width() as i64;
        let h = image.height() as i64;
        let reach = self.radius.ceil() as i64 + 1;
        let (cx, cy) = (x.round() as i64, y.round() as i64);
        if cx < reach || cy < reach || cx + reach >= w || cy + reach >= h {
            return None;
        }

        let (sin_a, cos_a) = angle.sin_cos();
        let at = |px: f32, py: f32| {
            sample_bilinear_f32(image, x + cos_a * px - sin_a * py, y + sin_a * px + cos_a * py)
        };

        let mut data = vec![0u8; DESCRIPTOR_BYTES];
        for (i, [(x1, y1), (x2, y2)]) in self.pairs.iter().enumerate() {
            if at(*x1, *y1)? < at(*x2, *y2)? {
                data[i / 8] |= 1 << (i % 8);
            }
        }
        Some(data)
    }
}

impl Default for BriefPattern {
    fn default() -> Self {
        Self::new(13.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn textured(w: u32, h: u32) -> GrayF32 {
        GrayF32::from_fn(w, h, |x, y| {
            Luma([((x * 31 + y * 17) % 23) as f32 / 23.0 + ((x / 5 + y / 3) % 2) as f32 * 0.3])
        })
    }

    #[test]
    fn pattern_is_deterministic_and_bounded() {
        let a = BriefPattern::default();
        let b = BriefPattern::default();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        for [(x1, y1), (x2, y2)] in &a.pairs {
            assert!(x1 * x1 + y1 * y1 <= 13.0 * 13.0 + 1e-3);
            assert!(x2 * x2 + y2 * y2 <= 13.0 * 13.0 + 1e-3);
        }
    }

    #[test]
    fn same_patch_gives_same_descriptor() {
        let img = textured(64, 64);
        let pattern = BriefPattern::default();
        let d1 = pattern.describe(&img, 32.0, 32.0, 0.3).unwrap();
        let d2 = pattern.describe(&img, 32.0, 32.0, 0.3).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), DESCRIPTOR_BYTES);
    }

    #[test]
    fn ramp_bits_follow_subpixel_positions() {
        let img = GrayF32::from_fn(64, 64, |x, _| Luma([x as f32 / 64.0]));
        let pattern = BriefPattern::default();
        let angle = 0.7f32;
        let d = pattern.describe(&img, 32.0, 32.0, angle).unwrap();

        let (sin_a, cos_a) = angle.sin_cos();
        let mut checked = 0;
        for (i, [(x1, y1), (x2, y2)]) in pattern.pairs.iter().enumerate() {
            let u1 = cos_a * x1 - sin_a * y1;
            let u2 = cos_a * x2 - sin_a * y2;
            if (u1 - u2).abs() < 1e-2 {
                continue;
            }
            let bit = d[i / 8] & (1 << (i % 8)) != 0;
            assert_eq!(bit, u1 < u2, "pair {i}");
            checked += 1;
        }
        assert!(checked > 200);
    }

    #[test]
    fn patch_near_border_is_rejected() {
        let img = textured(64, 64);
        let pattern = BriefPattern::default();
        assert!(pattern.describe(&img, 5.0, 32.0, 0.0).is_none());
        assert!(pattern.describe(&img, 32.0, 60.0, 0.0).is_none());
    }
}
