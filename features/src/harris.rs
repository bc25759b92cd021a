use cv_core::{KeyPoint, KeyPoints};
use cv_imgproc::{gaussian_blur_f32, GrayF32};
use rayon::prelude::*;

/// Harris detector settings for one pyramid level.
#[derive(Debug, Clone, Copy)]
pub struct HarrisParams {
    /// Harris sensitivity `k` in `det - k * trace^2`.
    pub k: f32,
    /// Gaussian window over the structure tensor.
    pub window_sigma: f32,
    /// Keep responses above `quality_level * max_response`.
    pub quality_level: f32,
    /// Absolute floor; textureless levels yield nothing.
    pub min_response: f32,
    /// Pixels closer than this to the border are never reported.
    pub border: u32,
}

impl Default for HarrisParams {
    fn default() -> Self {
        Self {
            k: 0.04,
            window_sigma: 1.0,
            quality_level: 0.01,
            min_response: 1e-7,
            border: 16,
        }
    }
}

/// Per-pixel Harris response of a `[0, 1]` float image.
pub fn harris_response(image: &GrayF32, k: f32, window_sigma: f32) -> GrayF32 {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut ixx = GrayF32::new(image.width(), image.height());
    let mut iyy = GrayF32::new(image.width(), image.height());
    let mut ixy = GrayF32::new(image.width(), image.height());
    if width < 3 || height < 3 {
        return ixx;
    }

    let (gx, gy) = sobel_gradients(image);
    {
        let xx: &mut [f32] = &mut ixx;
        let yy: &mut [f32] = &mut iyy;
        let xy: &mut [f32] = &mut ixy;
        for i in 0..width * height {
            xx[i] = gx[i] * gx[i];
            yy[i] = gy[i] * gy[i];
            xy[i] = gx[i] * gy[i];
        }
    }

    let sxx = gaussian_blur_f32(&ixx, window_sigma);
    let syy = gaussian_blur_f32(&iyy, window_sigma);
    let sxy = gaussian_blur_f32(&ixy, window_sigma);

    let mut response = GrayF32::new(image.width(), image.height());
    let out: &mut [f32] = &mut response;
    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let base = y * width;
        for (x, r) in row.iter_mut().enumerate() {
            let a = sxx.as_raw()[base + x];
            let b = syy.as_raw()[base + x];
            let c = sxy.as_raw()[base + x];
            let trace = a + b;
            *r = a * b - c * c - k * trace * trace;
        }
    });
    response
}

/// Sobel derivatives scaled to intensity change per pixel.
fn sobel_gradients(image: &GrayF32) -> (Vec<f32>, Vec<f32>) {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let src = image.as_raw();
    let mut gx = vec![0.0f32; width * height];
    let mut gy = vec![0.0f32; width * height];

    gx.par_chunks_mut(width)
        .zip(gy.par_chunks_mut(width))
        .enumerate()
        .skip(1)
        .take(height - 2)
        .for_each(|(y, (rx, ry))| {
            let up = &src[(y - 1) * width..y * width];
            let mid = &src[y * width..(y + 1) * width];
            let down = &src[(y + 1) * width..(y + 2) * width];
            for x in 1..width - 1 {
                let dx = (up[x + 1] - up[x - 1])
                    + 2.0 * (mid[x + 1] - mid[x - 1])
                    + (down[x + 1] - down[x - 1]);
                let dy = (down[x - 1] - up[x - 1])
                    + 2.0 * (down[x] - up[x])
                    + (down[x + 1] - up[x + 1]);
                rx[x] = dx / 8.0;
                ry[x] = dy / 8.0;
            }
        });

    (gx, gy)
}

/// Harris corners after 3x3 non-maximum suppression, sorted by response.
pub fn harris_detect(image: &GrayF32, params: &HarrisParams) -> KeyPoints {
    let response = harris_response(image, params.k, params.window_sigma);
    let width = response.width() as usize;
    let height = response.height() as usize;
    let border = (params.border as usize).max(1);
    if width <= 2 * border || height <= 2 * border {
        return KeyPoints::new();
    }

    let r = response.as_raw();
    let max_response = r.iter().copied().fold(0.0f32, f32::max);
    let threshold = (params.quality_level * max_response).max(params.min_response);
    if max_response <= threshold {
        return KeyPoints::new();
    }

    let rows: Vec<Vec<KeyPoint>> = (border..height - border)
        .into_par_iter()
        .map(|y| {
            let mut found = Vec::new();
            for x in border..width - border {
                let v = r[y * width + x];
                if v <= threshold || !is_local_max(r, width, x, y) {
                    continue;
                }
                found.push(KeyPoint::new(x as f64, y as f64).with_response(v as f64));
            }
            found
        })
        .collect();

    let mut keypoints = KeyPoints {
        keypoints: rows.into_iter().flatten().collect(),
    };
    keypoints.sort_by_response();
    keypoints
}

/// Strict maximum over already-scanned neighbours, non-strict over the
/// rest, so a plateau reports exactly one pixel.
fn is_local_max(r: &[f32], width: usize, x: usize, y: usize) -> bool {
    let v = r[y * width + x];
    for dy in -1isize..=1 {
        for dx in -1isize..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = r[(y as isize + dy) as usize * width + (x as isize + dx) as usize];
            let before = dy < 0 || (dy == 0 && dx < 0);
            if (before && n >= v) || (!before && n > v) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn square(size: u32, lo: u32, hi: u32) -> GrayF32 {
        GrayF32::from_fn(size, size, |x, y| {
            let inside = (lo..hi).contains(&x) && (lo..hi).contains(&y);
            Luma([if inside { 0.9 } else { 0.1 }])
        })
    }

    #[test]
    fn detects_square_corners() {
        let img = square(64, 20, 44);
        let kps = harris_detect(&img, &HarrisParams::default());
        assert!(kps.len() >= 4);

        for (cx, cy) in [(20.0, 20.0), (43.0, 20.0), (20.0, 43.0), (43.0, 43.0)] {
            let near = kps
                .iter()
                .any(|k| (k.x - cx).abs() <= 2.0 && (k.y - cy).abs() <= 2.0);
            assert!(near, "no corner near ({cx}, {cy})");
        }
    }

    #[test]
    fn flat_image_has_no_response() {
        let img = GrayF32::from_pixel(48, 48, Luma([0.5]));
        let kps = harris_detect(&img, &HarrisParams::default());
        assert!(kps.is_empty());
    }

    #[test]
    fn straight_edge_is_not_a_corner() {
        let img = GrayF32::from_fn(64, 64, |x, _| Luma([if x < 32 { 0.0 } else { 1.0 }]));
        let response = harris_response(&img, 0.04, 1.0);
        assert!(response.get_pixel(32, 32)[0] <= 0.0);
    }

    #[test]
    fn border_suppresses_detections() {
        let img = square(64, 4, 12);
        let kps = harris_detect(&img, &HarrisParams::default());
        assert!(kps.iter().all(|k| k.x >= 16.0 && k.y >= 16.0));
    }
}
