//! Compositing of the warped images along their seams.
//!
//! Feathering weights each image by its chamfer distance to the region it
//! owns; multi-band blending merges Laplacian pyramids weighted by gaussian
//! pyramids of the seam masks. Both normalize per pixel and leave uncovered
//! canvas pixels black.

use super::config::{BlendMode, StitchConfig};
use super::seam::SeamMask;
use super::warp::{Canvas, WarpedImage};
use cv_imgproc::{
    chamfer_distance, collapse_laplacian, gaussian_pyramid, laplacian_pyramid, max_pyramid_levels,
    GrayF32,
};
use image::{GrayImage, Luma, Rgb32FImage, RgbImage};
use rayon::prelude::*;
use tracing::debug;

/// Coarsest pyramid level keeps at least this many pixels on its short side.
const MIN_LEVEL_SIZE: u32 = 8;
const WEIGHT_EPS: f32 = 1e-5;

/// Blend `warped` into an RGB canvas plus its coverage mask (255 = covered).
pub fn blend(canvas: &Canvas, warped: &[WarpedImage], seams: &SeamMask, config: &StitchConfig) -> (RgbImage, GrayImage) {
    let (acc, weights) = match config.blend_mode {
        BlendMode::Feather => feather(canvas, warped, seams, config.feather_band),
        BlendMode::MultiBand => multiband(canvas, warped, seams, config.multiband_levels),
    };
    finish(canvas, seams, &acc, &weights)
}

/// Weighted sums on the canvas: `acc` is RGB, `weights` the per-pixel total.
type Accumulator = (Vec<f32>, Vec<f32>);

fn feather(canvas: &Canvas, warped: &[WarpedImage], seams: &SeamMask, band: f32) -> Accumulator {
    let width = canvas.width() as usize;
    let n = width * canvas.height() as usize;
    let mut acc = vec![0.0f32; n * 3];
    let mut weights = vec![0.0f32; n];

    for (k, w) in warped.iter().enumerate() {
        let owned = seams.mask_for(k as u32, w.roi);
        let distance = chamfer_distance(&owned);
        let roi = w.roi;
        let (x0, y0) = (roi.x as usize, roi.y as usize);

        acc.par_chunks_mut(width * 3)
            .zip(weights.par_chunks_mut(width))
            .enumerate()
            .skip(y0)
            .take(roi.height as usize)
            .for_each(|(y, (arow, wrow))| {
                let ly = (y - y0) as u32;
                for lx in 0..roi.width {
                    if w.mask.get_pixel(lx, ly).0[0] == 0 {
                        continue;
                    }
                    let d = distance.get_pixel(lx, ly).0[0];
                    let weight = (1.0 - d / band).max(0.0);
                    if weight <= 0.0 {
                        continue;
                    }
                    let x = x0 + lx as usize;
                    let px = w.pixels.get_pixel(lx, ly).0;
                    for c in 0..3 {
                        arow[x * 3 + c] += weight * px[c];
                    }
                    wrow[x] += weight;
                }
            });
    }
    debug!(band, "feather weights accumulated");
    (acc, weights)
}

/// Canvas-sized copy of `w` with every uncovered pixel replaced by the
/// nearest covered one along its row, then along its column.
fn extrapolate(canvas: &Canvas, w: &WarpedImage) -> Rgb32FImage {
    let (cw, ch) = (canvas.width() as usize, canvas.height() as usize);
    let mut out = Rgb32FImage::new(canvas.width(), canvas.height());
    let mut filled = vec![false; ch];
    {
        let dst: &mut [f32] = &mut out;
        dst.par_chunks_mut(cw * 3)
            .zip(filled.par_iter_mut())
            .enumerate()
            .for_each(|(y, (row, filled))| {
                let cy = y as i64;
                let mut last: Option<[f32; 3]> = None;
                let mut leading = 0usize;
                for x in 0..cw {
                    match w.sample(x as i64, cy) {
                        Some(px) => {
                            if last.is_none() {
                                for lx in 0..leading {
                                    row[lx * 3..lx * 3 + 3].copy_from_slice(&px);
                                }
                            }
                            row[x * 3..x * 3 + 3].copy_from_slice(&px);
                            last = Some(px);
                        }
                        None => match last {
                            Some(px) => row[x * 3..x * 3 + 3].copy_from_slice(&px),
                            None => leading += 1,
                        },
                    }
                }
                *filled = last.is_some();
            });
    }

    let Some(first) = filled.iter().position(|&f| f) else {
        return out;
    };
    let stride = cw * 3;
    let dst: &mut [f32] = &mut out;
    for y in (0..first).rev() {
        dst.copy_within((y + 1) * stride..(y + 2) * stride, y * stride);
    }
    for y in first + 1..ch {
        if !filled[y] {
            dst.copy_within((y - 1) * stride..y * stride, y * stride);
        }
    }
    out
}

fn multiband(canvas: &Canvas, warped: &[WarpedImage], seams: &SeamMask, requested: usize) -> Accumulator {
    let levels = max_pyramid_levels(canvas.width(), canvas.height(), requested, MIN_LEVEL_SIZE);
    let mut acc: Vec<Rgb32FImage> = Vec::new();
    let mut weights: Vec<GrayF32> = Vec::new();

    for (k, w) in warped.iter().enumerate() {
        let image = extrapolate(canvas, w);
        let mask = GrayF32::from_fn(canvas.width(), canvas.height(), |x, y| {
            Luma([if seams.label(x, y) == Some(k as u32) { 1.0 } else { 0.0 }])
        });
        let bands = laplacian_pyramid(&image, levels);
        let masks = gaussian_pyramid(&mask, levels);

        if acc.is_empty() {
            acc = bands
                .iter()
                .map(|b| Rgb32FImage::new(b.width(), b.height()))
                .collect();
            weights = masks
                .iter()
                .map(|m| GrayF32::new(m.width(), m.height()))
                .collect();
        }

        for ((a, wsum), (band, m)) in acc.iter_mut().zip(weights.iter_mut()).zip(bands.iter().zip(&masks)) {
            let a: &mut [f32] = a;
            let wsum: &mut [f32] = wsum;
            a.par_chunks_mut(3)
                .zip(wsum.par_iter_mut())
                .zip(band.as_raw().par_chunks(3).zip(m.as_raw().par_iter()))
                .for_each(|((dst, ws), (src, &mw))| {
                    for c in 0..3 {
                        dst[c] += src[c] * mw;
                    }
                    *ws += mw;
                });
        }
    }

    for (a, wsum) in acc.iter_mut().zip(&weights) {
        let a: &mut [f32] = a;
        a.par_chunks_mut(3).zip(wsum.as_raw().par_iter()).for_each(|(px, &ws)| {
            for v in px.iter_mut() {
                *v /= ws + WEIGHT_EPS;
            }
        });
    }

    let n = canvas.width() as usize * canvas.height() as usize;
    let collapsed = collapse_laplacian(&acc)
        .map(|img| img.into_raw())
        .unwrap_or_else(|| vec![0.0; n * 3]);
    debug!(levels, "multi-band pyramids merged");
    (collapsed, vec![1.0; n])
}

/// Normalize and quantize; only labelled pixels are written.
fn finish(canvas: &Canvas, seams: &SeamMask, acc: &[f32], weights: &[f32]) -> (RgbImage, GrayImage) {
    let width = canvas.width() as usize;
    let mut image = RgbImage::new(canvas.width(), canvas.height());
    let mut coverage = GrayImage::new(canvas.width(), canvas.height());
    {
        let img: &mut [u8] = &mut image;
        let cov: &mut [u8] = &mut coverage;
        img.par_chunks_mut(width * 3)
            .zip(cov.par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, (row, crow))| {
                for x in 0..width {
                    if seams.labels[y * width + x].is_none() {
                        continue;
                    }
                    let i = y * width + x;
                    let ws = weights[i];
                    if ws <= 0.0 {
                        continue;
                    }
                    for c in 0..3 {
                        row[x * 3 + c] = (acc[i * 3 + c] / ws).round().clamp(0.0, 255.0) as u8;
                    }
                    crow[x] = 255;
                }
            });
    }
    (image, coverage)
}
