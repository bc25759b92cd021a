//! Initial per-image homographies into the component reference frame.

use super::error::StitchErrorKind;
use super::graph::Component;
use super::pairwise::PairMatch;
use cv_core::{min_principal_variance, normalize_homography};
use nalgebra::{Matrix3, Point2};
use tracing::debug;

/// Inlier spread (px^2, least-spread direction) a tree edge needs to pin down
/// a homography.
pub const MIN_INLIER_VARIANCE: f64 = 1.0;

/// Planar camera: maps image pixels into the component reference frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub image: usize,
    pub homography: Matrix3<f64>,
    pub is_reference: bool,
}

impl CameraModel {
    pub fn reference(image: usize) -> Self {
        Self {
            image,
            homography: Matrix3::identity(),
            is_reference: true,
        }
    }
}

/// Fail if any spanning-tree edge has (nearly) collinear inliers on either
/// side.
pub fn check_tree_geometry(component: &Component, edges: &[PairMatch]) -> Result<(), StitchErrorKind> {
    for link in &component.tree {
        let e = &edges[link.edge];
        let src: Vec<Point2<f64>> = e.inliers.iter().map(|c| c.src_pt).collect();
        let dst: Vec<Point2<f64>> = e.inliers.iter().map(|c| c.dst_pt).collect();
        let spread = min_principal_variance(&src).min(min_principal_variance(&dst));
        if spread < MIN_INLIER_VARIANCE {
            return Err(StitchErrorKind::degenerate(format!(
                "inliers of pair ({}, {}) are collinear (spread {spread:.3e})",
                e.src, e.dst
            )));
        }
    }
    Ok(())
}

/// Chain pairwise homographies down the spanning tree from the reference.
///
/// The returned cameras follow `component.nodes` order.
pub fn initial_cameras(component: &Component, edges: &[PairMatch]) -> Result<Vec<CameraModel>, StitchErrorKind> {
    let mut cameras: Vec<Option<CameraModel>> = vec![None; component.nodes.len()];
    let root = component
        .slot(component.reference)
        .ok_or_else(|| StitchErrorKind::numerical("reference is not part of its component"))?;
    cameras[root] = Some(CameraModel::reference(component.reference));

    for link in &component.tree {
        let parent = component
            .slot(link.parent)
            .and_then(|s| cameras[s].as_ref())
            .map(|c| c.homography)
            .ok_or_else(|| StitchErrorKind::numerical("spanning tree visits a child first"))?;
        let to_parent = edges[link.edge]
            .homography_between(link.node, link.parent)
            .ok_or_else(|| {
                StitchErrorKind::numerical(format!("pair homography of {} is not invertible", link.node))
            })?;
        let homography = normalize_homography(&(parent * to_parent))
            .ok_or_else(|| StitchErrorKind::numerical(format!("camera {} maps to infinity", link.node)))?;

        let slot = component
            .slot(link.node)
            .ok_or_else(|| StitchErrorKind::numerical("tree node outside component"))?;
        cameras[slot] = Some(CameraModel {
            image: link.node,
            homography,
            is_reference: false,
        });
    }

    let cameras: Option<Vec<CameraModel>> = cameras.into_iter().collect();
    let cameras = cameras.ok_or_else(|| StitchErrorKind::numerical("spanning tree does not reach every image"))?;
    debug!(
        reference = component.reference,
        images = cameras.len(),
        "initial cameras propagated"
    );
    Ok(cameras)
}
