//! Chamfer distance transform.

use crate::GrayF32;
use image::GrayImage;

const ORTHO: f32 = 1.0;
const DIAG: f32 = 1.4;

/// Approximate euclidean distance from every pixel to the nearest non-zero
/// pixel of `mask` (0 on the mask itself). `f32::INFINITY` everywhere when
/// the mask is empty.
pub fn chamfer_distance(mask: &GrayImage) -> GrayF32 {
    let w = mask.width() as usize;
    let h = mask.height() as usize;
    let src = mask.as_raw();
    let mut d: Vec<f32> = src
        .iter()
        .map(|&v| if v != 0 { 0.0 } else { f32::INFINITY })
        .collect();

    // forward pass
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let mut best = d[i];
            if x > 0 {
                best = best.min(d[i - 1] + ORTHO);
            }
            if y > 0 {
                best = best.min(d[i - w] + ORTHO);
                if x > 0 {
                    best = best.min(d[i - w - 1] + DIAG);
                }
                if x + 1 < w {
                    best = best.min(d[i - w + 1] + DIAG);
                }
            }
            d[i] = best;
        }
    }

    // backward pass
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            let i = y * w + x;
            let mut best = d[i];
            if x + 1 < w {
                best = best.min(d[i + 1] + ORTHO);
            }
            if y + 1 < h {
                best = best.min(d[i + w] + ORTHO);
                if x + 1 < w {
                    best = best.min(d[i + w + 1] + DIAG);
                }
                if x > 0 {
                    best = best.min(d[i + w - 1] + DIAG);
                }
            }
            d[i] = best;
        }
    }

    GrayF32::from_raw(mask.width(), mask.height(), d)
        .unwrap_or_else(|| GrayF32::new(mask.width(), mask.height()))
}
