//! Planar projective geometry helpers.
//!
//! Homographies are stored as `Matrix3<f64>` acting on homogeneous pixel
//! coordinates `(x, y, 1)`.

use nalgebra::{Matrix2, Matrix3, Point2, Vector3};

/// Homogeneous weights with a smaller magnitude than this map to infinity.
pub const PROJECTIVE_EPS: f64 = 1e-12;

/// Apply `h` to a pixel. `None` when the point maps to infinity.
pub fn transform_point(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() <= PROJECTIVE_EPS || !v.z.is_finite() {
        return None;
    }
    Some(Point2::new(v.x / v.z, v.y / v.z))
}

/// Scale `h` so that `h[(2, 2)] == 1`.
pub fn normalize_homography(h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() <= PROJECTIVE_EPS || !s.is_finite() {
        return None;
    }
    let n = h / s;
    n.iter().all(|v| v.is_finite()).then_some(n)
}

/// Inverse normalized to `h[(2, 2)] == 1`.
pub fn invert_homography(h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    h.try_inverse().and_then(|inv| normalize_homography(&inv))
}

pub fn translation(tx: f64, ty: f64) -> Matrix3<f64> {
    Matrix3::new(1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0)
}

pub fn scaling(sx: f64, sy: f64) -> Matrix3<f64> {
    Matrix3::new(sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0)
}

/// Smallest eigenvalue of the 2x2 covariance of `points`, i.e. the variance
/// along the least spread direction. Zero for collinear or coincident points.
pub fn min_principal_variance(points: &[Point2<f64>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (sx / n, sy / n);

    let mut cov = Matrix2::zeros();
    for p in points {
        let dx = p.x - mx;
        let dy = p.y - my;
        cov[(0, 0)] += dx * dx;
        cov[(0, 1)] += dx * dy;
        cov[(1, 1)] += dy * dy;
    }
    cov[(1, 0)] = cov[(0, 1)];
    cov /= n;

    let eig = cov.symmetric_eigenvalues();
    eig.min().max(0.0)
}

/// True when the three points are (nearly) on one line.
pub fn are_collinear(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>, tol: f64) -> bool {
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    cross.abs() <= tol
}

/// Integer pixel rectangle. `x`/`y` may be negative before a canvas offset
/// is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x1 > x0 && y1 > y0).then(|| Rect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Smallest rectangle covering both. `None` when a side of the result
    /// does not fit in `u32`.
    pub fn union(&self, other: &Rect) -> Option<Rect> {
        if self.is_empty() {
            return Some(*other);
        }
        if other.is_empty() {
            return Some(*self);
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        let width = u32::try_from(x1 - x0).ok()?;
        let height = u32::try_from(y1 - y0).ok()?;
        Some(Rect::new(x0, y0, width, height))
    }

    pub fn translate(&self, dx: i64, dy: i64) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

/// Integer bounding box of a `width` x `height` image warped by `h`.
///
/// `None` if any corner maps to infinity or behind the projective horizon
/// (negative homogeneous weight relative to the image centre).
pub fn warped_bounds(h: &Matrix3<f64>, width: u32, height: u32) -> Option<Rect> {
    let w = width.saturating_sub(1) as f64;
    let hgt = height.saturating_sub(1) as f64;
    let corners = [(0.0, 0.0), (w, 0.0), (w, hgt), (0.0, hgt)];

    let centre_w = (h * Vector3::new(w / 2.0, hgt / 2.0, 1.0)).z;
    let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
    let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);

    for (x, y) in corners {
        let v = h * Vector3::new(x, y, 1.0);
        if v.z * centre_w <= 0.0 {
            return None;
        }
        let p = transform_point(h, &Point2::new(x, y))?;
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }

    let x0 = min.x.floor();
    let y0 = min.y.floor();
    let x1 = max.x.ceil();
    let y1 = max.y.ceil();
    if !(x0.is_finite() && y0.is_finite() && x1.is_finite() && y1.is_finite()) {
        return None;
    }
    if (x1 - x0) >= u32::MAX as f64 || (y1 - y0) >= u32::MAX as f64 {
        return None;
    }

    Some(Rect::new(
        x0 as i64,
        y0 as i64,
        (x1 - x0) as u32 + 1,
        (y1 - y0) as u32 + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_point_applies_translation() {
        let h = translation(10.0, -5.0);
        let p = transform_point(&h, &Point2::new(1.0, 2.0)).unwrap();
        assert_relative_eq!(p.x, 11.0);
        assert_relative_eq!(p.y, -3.0);
    }

    #[test]
    fn transform_point_at_infinity_is_none() {
        let h = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
        assert!(transform_point(&h, &Point2::new(0.0, 3.0)).is_none());
    }

    #[test]
    fn invert_homography_round_trips() {
        let h = Matrix3::new(1.1, 0.05, 12.0, -0.02, 0.95, 3.0, 1e-4, -2e-4, 1.0);
        let inv = invert_homography(&h).unwrap();
        let id = normalize_homography(&(h * inv)).unwrap();
        assert_relative_eq!(id, Matrix3::identity(), epsilon = 1e-9);
    }

    #[test]
    fn collinear_points_have_zero_variance() {
        let pts: Vec<_> = (0..10).map(|i| Point2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(min_principal_variance(&pts) < 1e-9);

        let spread = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(10.0, 10.0),
        ];
        assert_relative_eq!(min_principal_variance(&spread), 25.0, epsilon = 1e-9);
    }

    #[test]
    fn rect_intersect_and_union() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, -2, 10, 4);
        assert_eq!(a.intersect(&b), Some(Rect::new(5, 0, 5, 2)));
        assert_eq!(a.union(&b), Some(Rect::new(0, -2, 15, 12)));
        assert!(a.intersect(&Rect::new(10, 0, 3, 3)).is_none());
    }

    #[test]
    fn rect_union_too_wide_for_u32_is_none() {
        let left = Rect::new(-(u32::MAX as i64), 0, 10, 10);
        let right = Rect::new(u32::MAX as i64, 0, 10, 10);
        assert!(left.union(&right).is_none());

        let widest = Rect::new(0, 0, 4, 4).union(&Rect::new(u32::MAX as i64 - 4, 0, 4, 4));
        assert_eq!(widest.map(|r| r.width), Some(u32::MAX));
    }

    #[test]
    fn warped_bounds_of_shifted_image() {
        let r = warped_bounds(&translation(100.5, 0.0), 20, 10).unwrap();
        assert_eq!(r, Rect::new(100, 0, 21, 10));
    }
}
