//! Rotating-camera model for cylindrical and spherical panoramas.
//!
//! Every camera sits at the same centre and looks along its own `+z`. The
//! principal point is the image centre and `rotation` takes camera rays into
//! the shared world frame, where the reference camera starts as the identity.

use super::error::StitchErrorKind;
use super::graph::Component;
use super::pairwise::PairMatch;
use cv_core::translation;
use nalgebra::{Matrix3, Point2, SymmetricEigen, Vector3};
use tracing::debug;

/// Directions whose forward component is at most this fraction of their
/// length are behind the camera.
const MIN_FORWARD: f64 = 1e-9;
/// Wave correction needs the camera x axes to spread over at least this share
/// of their total moment.
const MIN_WAVE_SPREAD: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct RotationCamera {
    pub image: usize,
    /// Focal length in pixels.
    pub focal: f64,
    pub principal_point: Point2<f64>,
    /// Camera to world.
    pub rotation: Matrix3<f64>,
    pub is_reference: bool,
}

impl RotationCamera {
    pub fn new(image: usize, focal: f64, (width, height): (u32, u32)) -> Self {
        Self {
            image,
            focal,
            principal_point: principal_point(width, height),
            rotation: Matrix3::identity(),
            is_reference: false,
        }
    }

    pub fn intrinsics(&self) -> Matrix3<f64> {
        intrinsics(self.focal, &self.principal_point)
    }

    /// Unit world direction seen at pixel `p`.
    pub fn ray(&self, p: &Point2<f64>) -> Vector3<f64> {
        camera_ray(self.focal, &self.principal_point, &self.rotation, p)
    }

    /// Pixel seen along world direction `d`; `None` behind the camera.
    pub fn pixel(&self, d: &Vector3<f64>) -> Option<Point2<f64>> {
        let c = self.rotation.transpose() * d;
        if c.z <= MIN_FORWARD * d.norm() || !c.z.is_finite() {
            return None;
        }
        Some(Point2::new(
            self.focal * c.x / c.z + self.principal_point.x,
            self.focal * c.y / c.z + self.principal_point.y,
        ))
    }
}

pub fn principal_point(width: u32, height: u32) -> Point2<f64> {
    Point2::new((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0)
}

pub(crate) fn intrinsics(focal: f64, pp: &Point2<f64>) -> Matrix3<f64> {
    Matrix3::new(focal, 0.0, pp.x, 0.0, focal, pp.y, 0.0, 0.0, 1.0)
}

pub(crate) fn camera_ray(focal: f64, pp: &Point2<f64>, rotation: &Matrix3<f64>, p: &Point2<f64>) -> Vector3<f64> {
    let c = Vector3::new((p.x - pp.x) / focal, (p.y - pp.y) / focal, 1.0);
    (rotation * c).normalize()
}

/// Picks one focal from the two candidate squares of a homography
/// constraint, or `None` when neither is positive and finite.
fn focal_candidate(d1: f64, d2: f64, v1: f64, v2: f64) -> Option<f64> {
    let usable = |v: f64| v > 0.0 && v.is_finite();
    let squared = match (usable(v1), usable(v2)) {
        (true, true) => {
            let (hi, lo) = if v1 < v2 { (v2, v1) } else { (v1, v2) };
            if d1.abs() > d2.abs() {
                hi
            } else {
                lo
            }
        }
        (true, false) => v1,
        (false, true) => v2,
        (false, false) => return None,
    };
    Some(squared.sqrt())
}

/// Focal lengths of the source and destination views of a homography
/// between centred pixel coordinates of two cameras rotating about a
/// common centre.
pub fn focals_from_homography(h: &Matrix3<f64>) -> (Option<f64>, Option<f64>) {
    let h = |r: usize, c: usize| h[(r, c)];

    let d1 = h(2, 0) * h(2, 1);
    let d2 = (h(2, 1) - h(2, 0)) * (h(2, 1) + h(2, 0));
    let v1 = -(h(0, 0) * h(0, 1) + h(1, 0) * h(1, 1)) / d1;
    let v2 = (h(0, 0) * h(0, 0) + h(1, 0) * h(1, 0) - h(0, 1) * h(0, 1) - h(1, 1) * h(1, 1)) / d2;
    let src = focal_candidate(d1, d2, v1, v2);

    let d1 = h(0, 0) * h(1, 0) + h(0, 1) * h(1, 1);
    let d2 = h(0, 0) * h(0, 0) + h(0, 1) * h(0, 1) - h(1, 0) * h(1, 0) - h(1, 1) * h(1, 1);
    let v1 = -h(0, 2) * h(1, 2) / d1;
    let v2 = (h(1, 2) * h(1, 2) - h(0, 2) * h(0, 2)) / d2;
    let dst = focal_candidate(d1, d2, v1, v2);

    (src, dst)
}

/// Shared focal length of a component: the median of the per-pair
/// estimates, or the mean `width + height` when too few pairs yield one.
///
/// `sizes` follows `component.nodes`.
pub fn estimate_focal(component: &Component, edges: &[PairMatch], sizes: &[(u32, u32)]) -> f64 {
    let mut focals = Vec::new();
    for &ei in &component.edges {
        let e = &edges[ei];
        let (Some(a), Some(b)) = (component.slot(e.src), component.slot(e.dst)) else {
            continue;
        };
        let ca = principal_point(sizes[a].0, sizes[a].1);
        let cb = principal_point(sizes[b].0, sizes[b].1);
        let centred = translation(-cb.x, -cb.y) * e.homography * translation(ca.x, ca.y);
        if let (Some(f0), Some(f1)) = focals_from_homography(&centred) {
            focals.push((f0 * f1).sqrt());
        }
    }

    if !focals.is_empty() && focals.len() + 1 >= component.len() {
        focals.sort_by(f64::total_cmp);
        let mid = focals.len() / 2;
        let focal = if focals.len() % 2 == 1 {
            focals[mid]
        } else {
            (focals[mid - 1] + focals[mid]) / 2.0
        };
        debug!(focal, estimates = focals.len(), "focal length from pair homographies");
        return focal;
    }

    let fallback = sizes.iter().map(|&(w, h)| (w + h) as f64).sum::<f64>() / sizes.len().max(1) as f64;
    debug!(focal = fallback, estimates = focals.len(), "too few focal estimates, using image size");
    fallback
}

/// Nearest rotation to `m` (up to a positive or negative scale).
fn orthonormalize(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let r = svd.u? * svd.v_t?;
    let r = if r.determinant() < 0.0 { -r } else { r };
    r.iter().all(|v| v.is_finite()).then_some(r)
}

/// Chain rotations down the spanning tree from the reference.
///
/// The returned cameras follow `component.nodes` order.
pub fn initial_rotations(
    component: &Component,
    edges: &[PairMatch],
    sizes: &[(u32, u32)],
    focal: f64,
) -> Result<Vec<RotationCamera>, StitchErrorKind> {
    let mut cameras: Vec<RotationCamera> = component
        .nodes
        .iter()
        .zip(sizes)
        .map(|(&n, &size)| RotationCamera::new(n, focal, size))
        .collect();
    let mut placed = vec![false; cameras.len()];
    let root = component
        .slot(component.reference)
        .ok_or_else(|| StitchErrorKind::numerical("reference is not part of its component"))?;
    cameras[root].is_reference = true;
    placed[root] = true;

    for link in &component.tree {
        let (Some(slot), Some(parent)) = (component.slot(link.node), component.slot(link.parent)) else {
            return Err(StitchErrorKind::numerical("tree node outside component"));
        };
        if !placed[parent] {
            return Err(StitchErrorKind::numerical("spanning tree visits a child first"));
        }
        let to_parent = edges[link.edge]
            .homography_between(link.node, link.parent)
            .ok_or_else(|| {
                StitchErrorKind::numerical(format!("pair homography of {} is not invertible", link.node))
            })?;
        let parent_k_inv = cameras[parent]
            .intrinsics()
            .try_inverse()
            .ok_or_else(|| StitchErrorKind::numerical("camera intrinsics are singular"))?;
        let relative = orthonormalize(&(parent_k_inv * to_parent * cameras[slot].intrinsics()))
            .ok_or_else(|| StitchErrorKind::numerical(format!("no rotation fits pair ({}, {})", link.node, link.parent)))?;
        cameras[slot].rotation = cameras[parent].rotation * relative;
        placed[slot] = true;
    }

    if placed.iter().any(|p| !p) {
        return Err(StitchErrorKind::numerical("spanning tree does not reach every image"));
    }
    debug!(
        reference = component.reference,
        images = cameras.len(),
        focal,
        "initial rotations propagated"
    );
    Ok(cameras)
}

/// Rotate the world so the camera x axes lie in the horizontal plane, which
/// straightens the horizon of a panning sweep. Returns false when the sweep
/// does not determine an up direction.
pub fn wave_correct(cameras: &mut [RotationCamera]) -> bool {
    if cameras.len() < 2 {
        return false;
    }

    let mut moment = Matrix3::zeros();
    let mut look = Vector3::zeros();
    for cam in cameras.iter() {
        let x = cam.rotation.column(0).into_owned();
        moment += x * x.transpose();
        look += cam.rotation.column(2);
    }

    let eigen = SymmetricEigen::new(moment);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let trace = moment.trace();
    if trace <= 0.0 || !trace.is_finite() || eigen.eigenvalues[order[1]] < MIN_WAVE_SPREAD * trace {
        return false;
    }

    // normal of the plane the x axes span
    let mut up = eigen.eigenvectors.column(order[0]).into_owned();
    let mut right = up.cross(&look);
    let norm = right.norm();
    if norm <= f64::EPSILON || !norm.is_finite() {
        return false;
    }
    right /= norm;
    let forward = right.cross(&up);

    let alignment: f64 = cameras.iter().map(|c| right.dot(&c.rotation.column(0))).sum();
    if alignment < 0.0 {
        right = -right;
        up = -up;
    }

    let correction = Matrix3::from_rows(&[right.transpose(), up.transpose(), forward.transpose()]);
    for cam in cameras.iter_mut() {
        cam.rotation = correction * cam.rotation;
    }
    debug!(cameras = cameras.len(), "wave correction applied");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stitcher::graph::AlignmentGraph;
    use crate::stitcher::pairwise::Correspondence;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    const F: f64 = 400.0;
    const SIZE: (u32, u32) = (320, 240);

    fn yaw(angle: f64) -> Matrix3<f64> {
        Rotation3::from_axis_angle(&Vector3::y_axis(), angle).into_inner()
    }

    /// Pair between two cameras rotated by `rot_src` and `rot_dst`.
    fn rotation_edge(src: usize, dst: usize, rot_src: &Matrix3<f64>, rot_dst: &Matrix3<f64>) -> PairMatch {
        let pp = principal_point(SIZE.0, SIZE.1);
        let k = intrinsics(F, &pp);
        let k_inv = k.try_inverse().unwrap();
        let h = k * rot_dst.transpose() * rot_src * k_inv;
        let h = h / h[(2, 2)];

        let mut inliers = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                let p = Point2::new(200.0 + 20.0 * i as f64, 20.0 + 45.0 * j as f64);
                let q = cv_core::transform_point(&h, &p).unwrap();
                inliers.push(Correspondence {
                    src_idx: inliers.len(),
                    dst_idx: inliers.len(),
                    src_pt: p,
                    dst_pt: q,
                });
            }
        }
        PairMatch::new(src, dst, h, inliers, 30)
    }

    #[test]
    fn ray_and_pixel_are_inverse() {
        let mut cam = RotationCamera::new(0, F, SIZE);
        cam.rotation = yaw(0.3);
        let p = Point2::new(17.0, 201.5);
        let back = cam.pixel(&cam.ray(&p)).unwrap();
        assert_relative_eq!(back, p, epsilon = 1e-9);
        assert!(cam.pixel(&(-cam.ray(&p))).is_none());
    }

    #[test]
    fn focal_is_recovered_from_rotation_homographies() {
        let tilt = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.05).into_inner();
        let rots = [Matrix3::identity(), yaw(0.5) * tilt, yaw(1.0)];
        let g = AlignmentGraph::build(
            3,
            vec![
                rotation_edge(0, 1, &rots[0], &rots[1]),
                rotation_edge(1, 2, &rots[1], &rots[2]),
            ],
            0.5,
        );
        let (components, _) = g.partition(&[0u32, 1, 2]);
        let focal = estimate_focal(&components[0], &g.edges, &[SIZE; 3]);
        assert_relative_eq!(focal, F, max_relative = 1e-6);
    }

    #[test]
    fn translation_only_pairs_fall_back_to_image_size() {
        let mut e = rotation_edge(0, 1, &Matrix3::identity(), &Matrix3::identity());
        e.homography = translation(-100.0, 0.0);
        let g = AlignmentGraph::build(2, vec![e], 0.5);
        let (components, _) = g.partition(&[0u32, 1]);
        let focal = estimate_focal(&components[0], &g.edges, &[SIZE; 2]);
        assert_relative_eq!(focal, 560.0);
    }

    #[test]
    fn rotations_chain_down_the_tree() {
        let rots = [yaw(-0.5), Matrix3::identity(), yaw(0.5)];
        let g = AlignmentGraph::build(
            3,
            vec![
                rotation_edge(0, 1, &rots[0], &rots[1]),
                rotation_edge(1, 2, &rots[1], &rots[2]),
            ],
            0.5,
        );
        let (components, _) = g.partition(&[0u32, 1, 2]);
        let c = &components[0];
        assert_eq!(c.reference, 1);

        let cams = initial_rotations(c, &g.edges, &[SIZE; 3], F).unwrap();
        assert!(cams[1].is_reference);
        assert_relative_eq!(cams[1].rotation, Matrix3::identity());
        assert_relative_eq!(cams[0].rotation, rots[0], epsilon = 1e-9);
        assert_relative_eq!(cams[2].rotation, rots[2], epsilon = 1e-9);
    }

    #[test]
    fn wave_correction_levels_a_tilted_sweep() {
        let tilt = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.2).into_inner()
            * Rotation3::from_axis_angle(&Vector3::x_axis(), 0.15).into_inner();
        let pitch = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.25).into_inner();
        let mut cams: Vec<RotationCamera> = (0..4)
            .map(|i| {
                let mut c = RotationCamera::new(i, F, SIZE);
                c.rotation = tilt * yaw(0.4 * i as f64 - 0.6) * pitch;
                c
            })
            .collect();
        let relative_before = cams[0].rotation.transpose() * cams[2].rotation;

        assert!(wave_correct(&mut cams));
        for c in &cams {
            // camera x axes carry no vertical component
            assert!(c.rotation[(1, 0)].abs() < 1e-9, "{}", c.rotation[(1, 0)]);
        }
        let relative_after = cams[0].rotation.transpose() * cams[2].rotation;
        assert_relative_eq!(relative_before, relative_after, epsilon = 1e-9);
    }

    #[test]
    fn single_camera_is_left_alone() {
        let mut cams = vec![RotationCamera::new(0, F, SIZE)];
        cams[0].rotation = yaw(0.3);
        assert!(!wave_correct(&mut cams));
        assert_relative_eq!(cams[0].rotation, yaw(0.3));
    }
}
