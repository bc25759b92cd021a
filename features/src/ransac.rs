//! RANSAC homography verification.
//!
//! Minimal samples go through a Hartley-normalized DLT; samples with three
//! collinear points on either side are skipped. The winning model is refit on
//! all of its inliers and the inlier set is recomputed once.

use cv_core::robust::score;
use cv_core::{are_collinear, normalize_homography, Ransac, RobustConfig, RobustModel};
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

pub type RansacConfig = RobustConfig;
pub use cv_core::robust::RobustResult as RansacResult;

/// Twice the triangle area (px^2) below which three points count as collinear.
const COLLINEAR_TOL: f64 = 1.0;

/// One putative correspondence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchPair {
    pub src: Point2<f64>,
    pub dst: Point2<f64>,
}

impl MatchPair {
    pub fn new(src: Point2<f64>, dst: Point2<f64>) -> Self {
        Self { src, dst }
    }
}

pub struct HomographyEstimator;

impl RobustModel<MatchPair> for HomographyEstimator {
    type Model = Matrix3<f64>;

    fn min_sample_size(&self) -> usize {
        4
    }

    fn estimate(&self, data: &[&MatchPair]) -> Option<Self::Model> {
        let src: Vec<Point2<f64>> = data.iter().map(|m| m.src).collect();
        let dst: Vec<Point2<f64>> = data.iter().map(|m| m.dst).collect();
        fit_homography(&src, &dst)
    }

    fn compute_error(&self, model: &Self::Model, data: &MatchPair) -> f64 {
        transfer_error(model, data)
    }

    fn is_degenerate(&self, sample: &[&MatchPair]) -> bool {
        let src: Vec<Point2<f64>> = sample.iter().map(|m| m.src).collect();
        let dst: Vec<Point2<f64>> = sample.iter().map(|m| m.dst).collect();
        has_collinear_triple(&src) || has_collinear_triple(&dst)
    }
}

/// Euclidean distance between `h * src` and `dst`.
pub fn transfer_error(h: &Matrix3<f64>, m: &MatchPair) -> f64 {
    let p = h * Vector3::new(m.src.x, m.src.y, 1.0);
    if p.z.abs() <= 1e-10 {
        return f64::INFINITY;
    }
    let dx = p.x / p.z - m.dst.x;
    let dy = p.y / p.z - m.dst.y;
    (dx * dx + dy * dy).sqrt()
}

fn has_collinear_triple(points: &[Point2<f64>]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                if are_collinear(&points[i], &points[j], &points[k], COLLINEAR_TOL) {
                    return true;
                }
            }
        }
    }
    false
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2).
fn normalizing_transform(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= 1e-12 || !mean_dist.is_finite() {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Least-squares homography `src -> dst` (normalized DLT, `h33 = 1`).
pub fn fit_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }
    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (p, q)) in src.iter().zip(dst).enumerate() {
        let p = t_src * Vector3::new(p.x, p.y, 1.0);
        let q = t_dst * Vector3::new(q.x, q.y, 1.0);
        let (x1, y1) = (p.x, p.y);
        let (x2, y2) = (q.x, q.y);
        let r = 2 * i;
        a[(r, 0)] = -x1;
        a[(r, 1)] = -y1;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = x2 * x1;
        a[(r, 7)] = x2 * y1;
        a[(r, 8)] = x2;
        a[(r + 1, 3)] = -x1;
        a[(r + 1, 4)] = -y1;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = y2 * x1;
        a[(r + 1, 7)] = y2 * y1;
        a[(r + 1, 8)] = y2;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = v_t.row(smallest);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse()?;
    normalize_homography(&(t_dst_inv * h_norm * t_src))
}

/// RANSAC over `pairs`, then refit on the inliers and rescore once.
pub fn estimate_homography(pairs: &[MatchPair], config: &RansacConfig) -> RansacResult<Matrix3<f64>> {
    let estimator = HomographyEstimator;
    let mut result = Ransac::new(config.clone()).run(&estimator, pairs);
    let Some(model) = result.model else {
        return result;
    };

    let (src, dst): (Vec<_>, Vec<_>) = pairs
        .iter()
        .zip(&result.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|(m, _)| (m.src, m.dst))
        .unzip();

    if let Some(refined) = fit_homography(&src, &dst) {
        let (inliers, num_inliers, residual) = score(&estimator, &refined, pairs, config.threshold);
        if num_inliers >= estimator.min_sample_size() {
            result.model = Some(refined);
            result.inliers = inliers;
            result.num_inliers = num_inliers;
            result.residual = residual;
            return result;
        }
    }
    result.model = Some(model);
    result
}
