use crate::GrayF32;
use image::GrayImage;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    Constant,
    Replicate,
    Reflect101,
}

pub(crate) fn map_coord(coord: isize, len: usize, mode: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }

    match mode {
        BorderMode::Constant => (coord >= 0 && coord < n).then_some(coord as usize),
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
        BorderMode::Reflect101 => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * n - 2;
            let mut c = coord % period;
            if c < 0 {
                c += period;
            }
            if c >= n {
                c = period - c;
            }
            Some(c as usize)
        }
    }
}

/// Normalized 1D gaussian with radius `ceil(3 sigma)`.
pub fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let sigma2 = sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| {
            let x = i as f32;
            (-(x * x) / (2.0 * sigma2)).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    if sum != 0.0 {
        for v in &mut kernel {
            *v /= sum;
        }
    }
    kernel
}

/// `u8` intensities rescaled to `[0, 1]`.
pub fn to_gray_f32(src: &GrayImage) -> GrayF32 {
    let data = src.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    GrayF32::from_raw(src.width(), src.height(), data)
        .unwrap_or_else(|| GrayF32::new(src.width(), src.height()))
}

/// Separable convolution with the same 1D kernel along both axes.
pub fn separable_convolve_f32(image: &GrayF32, kernel: &[f32], border: BorderMode) -> GrayF32 {
    assert!(kernel.len() % 2 == 1, "kernel size must be odd");

    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut out = GrayF32::new(image.width(), image.height());
    if width == 0 || height == 0 {
        return out;
    }

    let r = kernel.len() / 2;
    let src = image.as_raw();
    let mut tmp = vec![0.0f32; width * height];

    tmp.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            let row = &src[y * width..(y + 1) * width];
            for (x, out) in row_out.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (k, w) in kernel.iter().enumerate() {
                    let sx = x as isize + k as isize - r as isize;
                    if let Some(ix) = map_coord(sx, width, border) {
                        acc += w * row[ix];
                    }
                }
                *out = acc;
            }
        });

    let tmp = &tmp;
    let dst: &mut [f32] = &mut out;
    dst.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row_out)| {
            for (k, w) in kernel.iter().enumerate() {
                let sy = y as isize + k as isize - r as isize;
                let Some(iy) = map_coord(sy, height, border) else {
                    continue;
                };
                let row = &tmp[iy * width..(iy + 1) * width];
                for (o, v) in row_out.iter_mut().zip(row) {
                    *o += w * v;
                }
            }
        });

    out
}

pub fn gaussian_blur_f32(image: &GrayF32, sigma: f32) -> GrayF32 {
    if sigma <= 0.0 {
        return image.clone();
    }
    separable_convolve_f32(image, &gaussian_kernel_1d(sigma), BorderMode::Reflect101)
}
