//! Gain compensation over the overlaps of the warped images.
//!
//! Minimizes `sum N_ij ((g_i I_ij - g_j I_ji)^2 / sigma_n^2 + (1 - g_i)^2 / sigma_g^2)`
//! where `N_ij` is the overlap size and `I_ij` the mean of image `i` over it.

use super::config::ExposureMode;
use super::error::StitchErrorKind;
use super::warp::WarpedImage;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

/// Intensity noise on a 0-255 scale.
const SIGMA_N: f64 = 10.0;
/// Gain prior spread.
const SIGMA_G: f64 = 0.1;

/// Overlap statistics of one image pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapStats {
    pub count: u64,
    /// Per-channel mean of the first image over the overlap.
    pub mean_a: [f64; 3],
    /// Per-channel mean of the second image over the overlap.
    pub mean_b: [f64; 3],
}

/// Overlap of `a` and `b`, `None` if they share no covered pixel.
pub fn overlap_stats(a: &WarpedImage, b: &WarpedImage) -> Option<OverlapStats> {
    let inter = a.roi.intersect(&b.roi)?;
    let mut count = 0u64;
    let mut sum_a = [0.0f64; 3];
    let mut sum_b = [0.0f64; 3];
    for y in inter.y..inter.bottom() {
        for x in inter.x..inter.right() {
            let (Some(pa), Some(pb)) = (a.sample(x, y), b.sample(x, y)) else {
                continue;
            };
            count += 1;
            for c in 0..3 {
                sum_a[c] += pa[c] as f64;
                sum_b[c] += pb[c] as f64;
            }
        }
    }
    if count == 0 {
        return None;
    }
    let n = count as f64;
    Some(OverlapStats {
        count,
        mean_a: sum_a.map(|s| s / n),
        mean_b: sum_b.map(|s| s / n),
    })
}

fn solve(a: DMatrix<f64>, b: DVector<f64>) -> Option<DVector<f64>> {
    match a.clone().cholesky() {
        Some(chol) => Some(chol.solve(&b)),
        None => a.lu().solve(&b),
    }
}

/// Gains for one intensity channel. `means[i][j]` is the mean of image `i`
/// over its overlap with `j`; `counts[i][j]` the overlap size (`counts[i][i]`
/// is the image's own coverage).
fn solve_gains(counts: &DMatrix<f64>, means: &DMatrix<f64>) -> Option<DVector<f64>> {
    let n = counts.nrows();
    let alpha = 1.0 / (SIGMA_N * SIGMA_N);
    let beta = 1.0 / (SIGMA_G * SIGMA_G);
    let mut a = DMatrix::zeros(n, n);
    let mut b = DVector::zeros(n);
    for i in 0..n {
        for j in 0..n {
            let nij = counts[(i, j)];
            b[i] += beta * nij;
            a[(i, i)] += beta * nij;
            if i == j {
                continue;
            }
            a[(i, i)] += 2.0 * alpha * means[(i, j)] * means[(i, j)] * nij;
            a[(i, j)] -= 2.0 * alpha * means[(i, j)] * means[(j, i)] * nij;
        }
    }
    let gains = solve(a, b)?;
    gains.iter().all(|g| g.is_finite() && *g > 0.0).then_some(gains)
}

/// Per-image, per-channel gains for `mode`, in `warped` order.
pub fn estimate_gains(warped: &[WarpedImage], mode: ExposureMode) -> Result<Vec<[f64; 3]>, StitchErrorKind> {
    let n = warped.len();
    if mode == ExposureMode::None || n < 2 {
        return Ok(vec![[1.0; 3]; n]);
    }

    let pairs: Vec<(usize, usize)> = (0..n).flat_map(|i| (i + 1..n).map(move |j| (i, j))).collect();
    let stats: Vec<Option<OverlapStats>> = pairs
        .par_iter()
        .map(|&(i, j)| overlap_stats(&warped[i], &warped[j]))
        .collect();

    let channels: &[usize] = match mode {
        ExposureMode::ChannelGains => &[0, 1, 2],
        _ => &[0],
    };

    let mut counts = DMatrix::zeros(n, n);
    for (i, w) in warped.iter().enumerate() {
        counts[(i, i)] = cv_imgproc::count_nonzero(&w.mask) as f64;
    }
    for (&(i, j), s) in pairs.iter().zip(&stats) {
        if let Some(s) = s {
            counts[(i, j)] = s.count as f64;
            counts[(j, i)] = s.count as f64;
        }
    }

    let mut gains = vec![[1.0f64; 3]; n];
    for &c in channels {
        let mut means = DMatrix::zeros(n, n);
        for (&(i, j), s) in pairs.iter().zip(&stats) {
            let Some(s) = s else { continue };
            let (ma, mb) = match mode {
                ExposureMode::ChannelGains => (s.mean_a[c], s.mean_b[c]),
                _ => (
                    s.mean_a.iter().sum::<f64>() / 3.0,
                    s.mean_b.iter().sum::<f64>() / 3.0,
                ),
            };
            means[(i, j)] = ma;
            means[(j, i)] = mb;
        }
        let g = solve_gains(&counts, &means)
            .ok_or_else(|| StitchErrorKind::numerical("gain system is singular"))?;
        for (i, gain) in gains.iter_mut().enumerate() {
            match mode {
                ExposureMode::ChannelGains => gain[c] = g[i],
                _ => *gain = [g[i]; 3],
            }
        }
    }

    debug!(?gains, "exposure gains estimated");
    Ok(gains)
}

/// Scale the covered samples of every image by its gains.
pub fn apply_gains(warped: &mut [WarpedImage], gains: &[[f64; 3]]) {
    warped.par_iter_mut().zip(gains.par_iter()).for_each(|(w, g)| {
        if *g == [1.0; 3] {
            return;
        }
        let g = g.map(|v| v as f32);
        for px in w.pixels.pixels_mut() {
            for c in 0..3 {
                px.0[c] *= g[c];
            }
        }
    });
}
