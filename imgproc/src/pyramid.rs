//! Gaussian and Laplacian pyramids over float images with any channel count.
//!
//! `pyr_down` / `pyr_up` use the 5-tap binomial kernel with reflect-101
//! borders, so `collapse_laplacian(laplacian_pyramid(x))` reproduces `x` up
//! to float rounding.

use crate::convolve::{map_coord, BorderMode};
use image::{ImageBuffer, Pixel};
use rayon::prelude::*;

const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

pub type FloatImage<P> = ImageBuffer<P, Vec<f32>>;

/// Blur and halve: output is `ceil(w / 2) x ceil(h / 2)`.
pub fn pyr_down<P>(src: &FloatImage<P>) -> FloatImage<P>
where
    P: Pixel<Subpixel = f32> + Send + Sync,
{
    let c = P::CHANNEL_COUNT as usize;
    let (sw, sh) = (src.width() as usize, src.height() as usize);
    let dw = sw.div_ceil(2).max(1);
    let dh = sh.div_ceil(2).max(1);
    let raw = src.as_raw();

    // horizontal pass on every source row, keeping even columns
    let mut tmp = vec![0.0f32; dw * sh * c];
    tmp.par_chunks_mut(dw * c).enumerate().for_each(|(y, row)| {
        let srow = &raw[y * sw * c..(y + 1) * sw * c];
        for x in 0..dw {
            for (k, w) in KERNEL.iter().enumerate() {
                let Some(sx) = map_coord(2 * x as isize + k as isize - 2, sw, BorderMode::Reflect101)
                else {
                    continue;
                };
                for ch in 0..c {
                    row[x * c + ch] += w * srow[sx * c + ch];
                }
            }
        }
    });

    let mut out = FloatImage::<P>::new(dw as u32, dh as u32);
    let dst: &mut [f32] = &mut out;
    dst.par_chunks_mut(dw * c).enumerate().for_each(|(y, row)| {
        for (k, w) in KERNEL.iter().enumerate() {
            let Some(sy) = map_coord(2 * y as isize + k as isize - 2, sh, BorderMode::Reflect101)
            else {
                continue;
            };
            let trow = &tmp[sy * dw * c..(sy + 1) * dw * c];
            for (o, v) in row.iter_mut().zip(trow) {
                *o += w * v;
            }
        }
    });
    out
}

/// Upsample to exactly `width x height` (zero insertion + 4x the kernel).
pub fn pyr_up<P>(src: &FloatImage<P>, width: u32, height: u32) -> FloatImage<P>
where
    P: Pixel<Subpixel = f32> + Send + Sync,
{
    let c = P::CHANNEL_COUNT as usize;
    let (sw, sh) = (src.width() as usize, src.height() as usize);
    let (dw, dh) = (width as usize, height as usize);
    let raw = src.as_raw();

    // Upsampled index `u` holds source sample `u / 2` when even, zero otherwise.
    let source_index = |u: isize, len: usize, src_len: usize| -> Option<usize> {
        let m = map_coord(u, len, BorderMode::Reflect101)?;
        (m % 2 == 0 && m / 2 < src_len).then_some(m / 2)
    };

    let mut tmp = vec![0.0f32; dw * sh * c];
    tmp.par_chunks_mut(dw * c).enumerate().for_each(|(y, row)| {
        let srow = &raw[y * sw * c..(y + 1) * sw * c];
        for x in 0..dw {
            for (k, w) in KERNEL.iter().enumerate() {
                let Some(sx) = source_index(x as isize + k as isize - 2, dw, sw) else {
                    continue;
                };
                for ch in 0..c {
                    row[x * c + ch] += 2.0 * w * srow[sx * c + ch];
                }
            }
        }
    });

    let mut out = FloatImage::<P>::new(width, height);
    let dst: &mut [f32] = &mut out;
    dst.par_chunks_mut(dw * c).enumerate().for_each(|(y, row)| {
        for (k, w) in KERNEL.iter().enumerate() {
            let Some(sy) = source_index(y as isize + k as isize - 2, dh, sh) else {
                continue;
            };
            let trow = &tmp[sy * dw * c..(sy + 1) * dw * c];
            for (o, v) in row.iter_mut().zip(trow) {
                *o += 2.0 * w * v;
            }
        }
    });
    out
}

/// `levels + 1` images, finest first.
pub fn gaussian_pyramid<P>(src: &FloatImage<P>, levels: usize) -> Vec<FloatImage<P>>
where
    P: Pixel<Subpixel = f32> + Send + Sync,
{
    let mut pyr = Vec::with_capacity(levels + 1);
    pyr.push(src.clone());
    for l in 0..levels {
        let next = pyr_down(&pyr[l]);
        pyr.push(next);
    }
    pyr
}

/// `levels` band-pass images followed by the coarsest gaussian level.
pub fn laplacian_pyramid<P>(src: &FloatImage<P>, levels: usize) -> Vec<FloatImage<P>>
where
    P: Pixel<Subpixel = f32> + Send + Sync,
{
    let mut pyr = Vec::with_capacity(levels + 1);
    let mut current = src.clone();
    for _ in 0..levels {
        let down = pyr_down(&current);
        let up = pyr_up(&down, current.width(), current.height());
        let lap: &mut [f32] = &mut current;
        for (l, u) in lap.iter_mut().zip(up.as_raw()) {
            *l -= u;
        }
        pyr.push(current);
        current = down;
    }
    pyr.push(current);
    pyr
}

pub fn collapse_laplacian<P>(pyr: &[FloatImage<P>]) -> Option<FloatImage<P>>
where
    P: Pixel<Subpixel = f32> + Send + Sync,
{
    let (last, rest) = pyr.split_last()?;
    let mut current = last.clone();
    for band in rest.iter().rev() {
        let mut up = pyr_up(&current, band.width(), band.height());
        let dst: &mut [f32] = &mut up;
        for (u, b) in dst.iter_mut().zip(band.as_raw()) {
            *u += b;
        }
        current = up;
    }
    Some(current)
}

/// Largest usable level count so the coarsest level keeps at least
/// `min_size` pixels on its shorter side.
pub fn max_pyramid_levels(width: u32, height: u32, requested: usize, min_size: u32) -> usize {
    let mut levels = 0;
    let mut short = width.min(height);
    while levels < requested && short.div_ceil(2) >= min_size.max(1) {
        short = short.div_ceil(2);
        levels += 1;
    }
    levels
}
