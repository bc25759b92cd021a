use crate::GrayF32;
use cv_core::Rect;
use image::{GrayImage, Luma, Rgb32FImage, RgbImage};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Bilinear RGB sample at `(x, y)`.
///
/// Only reads inside `[0, w-1] x [0, h-1]`; anything outside the valid pixel
/// extent returns `None` rather than a padded value.
pub fn sample_bilinear_rgb(src: &RgbImage, x: f64, y: f64) -> Option<[f32; 3]> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 || !x.is_finite() || !y.is_finite() {
        return None;
    }
    if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
        return None;
    }

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;

    let raw = src.as_raw();
    let at = |xx: usize, yy: usize, c: usize| raw[(yy * w + xx) * 3 + c] as f32;

    let mut out = [0.0f32; 3];
    for (c, o) in out.iter_mut().enumerate() {
        let v0 = at(x0, y0, c) * (1.0 - fx) + at(x1, y0, c) * fx;
        let v1 = at(x0, y1, c) * (1.0 - fx) + at(x1, y1, c) * fx;
        *o = v0 * (1.0 - fy) + v1 * fy;
    }
    Some(out)
}

/// Bilinear sample of a float image, same extent rules as
/// [`sample_bilinear_rgb`].
pub fn sample_bilinear_f32(src: &GrayF32, x: f32, y: f32) -> Option<f32> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 || !x.is_finite() || !y.is_finite() {
        return None;
    }
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let raw = src.as_raw();
    let top = raw[y0 * w + x0] * (1.0 - fx) + raw[y0 * w + x1] * fx;
    let bottom = raw[y1 * w + x0] * (1.0 - fx) + raw[y1 * w + x1] * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}

/// Warp `src` into the rectangle `roi` of a larger canvas.
///
/// `to_source` maps canvas pixel coordinates to source pixel coordinates.
/// Returns float RGB samples for the ROI and a validity mask (255 where the
/// canvas pixel lands inside the source).
pub fn warp_perspective_roi(
    src: &RgbImage,
    to_source: &Matrix3<f64>,
    roi: Rect,
) -> (Rgb32FImage, GrayImage) {
    warp_roi(src, roi, |cx, cy| {
        let v = to_source * Vector3::new(cx, cy, 1.0);
        (v.z.abs() > cv_core::PROJECTIVE_EPS).then(|| (v.x / v.z, v.y / v.z))
    })
}

/// Warp `src` into `roi` through an arbitrary inverse mapping. `to_source`
/// returns `None` for canvas pixels with no preimage.
pub fn warp_roi<F>(src: &RgbImage, roi: Rect, to_source: F) -> (Rgb32FImage, GrayImage)
where
    F: Fn(f64, f64) -> Option<(f64, f64)> + Sync,
{
    let width = roi.width as usize;
    let mut pixels = Rgb32FImage::new(roi.width, roi.height);
    let mut mask = GrayImage::new(roi.width, roi.height);
    if roi.is_empty() {
        return (pixels, mask);
    }

    let px: &mut [f32] = &mut pixels;
    let mk: &mut [u8] = &mut mask;

    px.par_chunks_mut(width * 3)
        .zip(mk.par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (row, mrow))| {
            let cy = (roi.y + y as i64) as f64;
            for x in 0..width {
                let cx = (roi.x + x as i64) as f64;
                let Some((sx, sy)) = to_source(cx, cy) else {
                    continue;
                };
                if let Some(rgb) = sample_bilinear_rgb(src, sx, sy) {
                    row[x * 3..x * 3 + 3].copy_from_slice(&rgb);
                    mrow[x] = 255;
                }
            }
        });

    (pixels, mask)
}

/// Pixel count of a mask.
pub fn count_nonzero(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&v| v != 0).count()
}

pub fn is_set(mask: &GrayImage, x: u32, y: u32) -> bool {
    let Luma([v]) = *mask.get_pixel(x, y);
    v != 0
}
