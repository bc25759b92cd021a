//! Canvas layout and per-image warping onto the panorama surface.
//!
//! A [`Projector`] maps source pixels onto surface coordinates and back. The
//! plane surface is the reference image's pixel grid; the cylinder and the
//! sphere are unrolled around the world `y` axis with one surface unit per
//! pixel at the median focal length.

use super::camera::CameraModel;
use super::config::Projection;
use super::error::StitchErrorKind;
use super::rotation::RotationCamera;
use cv_core::{invert_homography, transform_point, warped_bounds, Rect};
use cv_imgproc::{is_set, warp_roi};
use image::{GrayImage, Rgb32FImage, RgbImage};
use nalgebra::{Matrix3, Point2, Vector3};
use rayon::prelude::*;
use std::f64::consts::PI;
use tracing::debug;

/// Output raster placed over the panorama surface.
///
/// `bounds` is the canvas in surface coordinates; canvas pixel `(0, 0)` sits
/// at `(bounds.x, bounds.y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub bounds: Rect,
}

impl Canvas {
    pub fn width(&self) -> u32 {
        self.bounds.width
    }

    pub fn height(&self) -> u32 {
        self.bounds.height
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.bounds.width, self.bounds.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Cylinder,
    Sphere,
}

impl Surface {
    /// Surface of a rotational projection, `None` for the plane.
    pub fn of(projection: Projection) -> Option<Surface> {
        match projection {
            Projection::Plane => None,
            Projection::Cylindrical => Some(Surface::Cylinder),
            Projection::Spherical => Some(Surface::Sphere),
        }
    }

    /// Unrolled coordinates of world direction `d`.
    fn unroll(&self, d: &Vector3<f64>, scale: f64) -> Option<Point2<f64>> {
        let u = scale * d.x.atan2(d.z);
        let v = match self {
            Surface::Cylinder => {
                let radial = d.x.hypot(d.z);
                if radial <= f64::EPSILON * d.norm() {
                    return None;
                }
                scale * d.y / radial
            }
            Surface::Sphere => {
                let n = d.norm();
                if n <= 0.0 {
                    return None;
                }
                scale * (PI - (d.y / n).clamp(-1.0, 1.0).acos())
            }
        };
        (u.is_finite() && v.is_finite()).then(|| Point2::new(u, v))
    }

    /// World direction at unrolled coordinates `(u, v)`.
    fn direction(&self, u: f64, v: f64, scale: f64) -> Vector3<f64> {
        let (u, v) = (u / scale, v / scale);
        match self {
            Surface::Cylinder => Vector3::new(u.sin(), v, u.cos()),
            Surface::Sphere => {
                let polar = PI - v;
                Vector3::new(polar.sin() * u.sin(), polar.cos(), polar.sin() * u.cos())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Mapping {
    Homography {
        to_surface: Matrix3<f64>,
        to_source: Matrix3<f64>,
    },
    Rotation {
        camera: RotationCamera,
        surface: Surface,
        scale: f64,
    },
}

/// Maps one source image onto the panorama surface and back.
#[derive(Debug, Clone, PartialEq)]
pub struct Projector {
    /// Run position of the source image.
    pub image: usize,
    mapping: Mapping,
}

impl Projector {
    pub fn planar(camera: &CameraModel) -> Result<Self, StitchErrorKind> {
        let to_source = invert_homography(&camera.homography)
            .ok_or_else(|| StitchErrorKind::numerical(format!("camera {} is not invertible", camera.image)))?;
        Ok(Self {
            image: camera.image,
            mapping: Mapping::Homography {
                to_surface: camera.homography,
                to_source,
            },
        })
    }

    pub fn rotational(camera: &RotationCamera, surface: Surface, scale: f64) -> Self {
        Self {
            image: camera.image,
            mapping: Mapping::Rotation {
                camera: camera.clone(),
                surface,
                scale,
            },
        }
    }

    /// Surface coordinates of source pixel `p`.
    pub fn forward(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        match &self.mapping {
            Mapping::Homography { to_surface, .. } => transform_point(to_surface, p),
            Mapping::Rotation { camera, surface, scale } => surface.unroll(&camera.ray(p), *scale),
        }
    }

    /// Source pixel seen at surface coordinates `(u, v)`.
    pub fn backward(&self, u: f64, v: f64) -> Option<Point2<f64>> {
        match &self.mapping {
            Mapping::Homography { to_source, .. } => transform_point(to_source, &Point2::new(u, v)),
            Mapping::Rotation { camera, surface, scale } => camera.pixel(&surface.direction(u, v, *scale)),
        }
    }

    /// Integer surface extent of a `width` x `height` source. `None` when
    /// part of the image has no surface position or, on a rotational surface,
    /// when it wraps across the back of the panorama.
    pub fn bounds(&self, width: u32, height: u32) -> Option<Rect> {
        let scale = match &self.mapping {
            Mapping::Homography { to_surface, .. } => return warped_bounds(to_surface, width, height),
            Mapping::Rotation { scale, .. } => *scale,
        };

        let w = width.saturating_sub(1) as f64;
        let h = height.saturating_sub(1) as f64;
        let mut border = vec![Point2::new(w / 2.0, h / 2.0)];
        for x in 0..width {
            border.push(Point2::new(x as f64, 0.0));
            border.push(Point2::new(x as f64, h));
        }
        for y in 0..height {
            border.push(Point2::new(0.0, y as f64));
            border.push(Point2::new(w, y as f64));
        }

        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &border {
            let q = self.forward(p)?;
            min.x = min.x.min(q.x);
            min.y = min.y.min(q.y);
            max.x = max.x.max(q.x);
            max.y = max.y.max(q.y);
        }
        if max.x - min.x >= PI * scale {
            return None;
        }
        let (x0, y0, x1, y1) = (min.x.floor(), min.y.floor(), max.x.ceil(), max.y.ceil());
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
}

/// Projectors of planar cameras, same order.
pub fn planar_projectors(cameras: &[CameraModel]) -> Result<Vec<Projector>, StitchErrorKind> {
    cameras.iter().map(Projector::planar).collect()
}

/// Projectors of rotating cameras onto `surface`, scaled by their median
/// focal length.
pub fn rotational_projectors(cameras: &[RotationCamera], surface: Surface) -> Result<Vec<Projector>, StitchErrorKind> {
    let mut focals: Vec<f64> = cameras.iter().map(|c| c.focal).collect();
    focals.sort_by(f64::total_cmp);
    let mid = focals.len() / 2;
    let scale = match focals.len() {
        0 => return Err(StitchErrorKind::numerical("no cameras to project")),
        n if n % 2 == 1 => focals[mid],
        _ => (focals[mid - 1] + focals[mid]) / 2.0,
    };
    if scale <= 0.0 || !scale.is_finite() {
        return Err(StitchErrorKind::numerical(format!("surface scale {scale} is not positive")));
    }
    debug!(?surface, scale, "surface scale chosen");
    Ok(cameras
        .iter()
        .map(|c| Projector::rotational(c, surface, scale))
        .collect())
}

/// One source resampled into its canvas ROI.
#[derive(Debug, Clone)]
pub struct WarpedImage {
    /// Run position of the source image.
    pub image: usize,
    /// Placement in canvas pixels.
    pub roi: Rect,
    /// RGB samples on a 0-255 scale, ROI-local.
    pub pixels: Rgb32FImage,
    /// 255 where the ROI pixel maps inside the source.
    pub mask: GrayImage,
    /// Warped source centre in canvas pixels.
    pub centre: Point2<f64>,
}

impl WarpedImage {
    /// Whether canvas pixel `(x, y)` carries a sample.
    pub fn covers(&self, x: i64, y: i64) -> bool {
        self.roi.contains(x, y) && is_set(&self.mask, (x - self.roi.x) as u32, (y - self.roi.y) as u32)
    }

    /// Sample at canvas pixel `(x, y)`, if covered.
    pub fn sample(&self, x: i64, y: i64) -> Option<[f32; 3]> {
        if !self.covers(x, y) {
            return None;
        }
        let p = self.pixels.get_pixel((x - self.roi.x) as u32, (y - self.roi.y) as u32);
        Some(p.0)
    }

    pub fn distance_to_centre(&self, x: i64, y: i64) -> f64 {
        let dx = x as f64 - self.centre.x;
        let dy = y as f64 - self.centre.y;
        dx * dx + dy * dy
    }
}

/// Union of the surface extents of every projector; `sizes[k]` belongs to
/// `projectors[k]`.
pub fn canvas_layout(
    sizes: &[(u32, u32)],
    projectors: &[Projector],
    max_pixels: u64,
) -> Result<(Canvas, Vec<Rect>), StitchErrorKind> {
    let mut union = Rect::default();
    let mut extents = Vec::with_capacity(projectors.len());
    for (proj, &(w, h)) in projectors.iter().zip(sizes) {
        let extent = proj.bounds(w, h).ok_or_else(|| {
            StitchErrorKind::degenerate(format!(
                "image {} cannot be placed on the panorama surface",
                proj.image
            ))
        })?;
        union = union
            .union(&extent)
            .ok_or_else(|| StitchErrorKind::degenerate("warped canvas exceeds the addressable size"))?;
        extents.push(extent);
    }

    if union.is_empty() {
        return Err(StitchErrorKind::degenerate("warped canvas is empty"));
    }
    if union.area() > max_pixels {
        return Err(StitchErrorKind::degenerate(format!(
            "canvas of {}x{} exceeds {max_pixels} pixels",
            union.width, union.height
        )));
    }

    let canvas = Canvas { bounds: union };
    let rois = extents
        .into_iter()
        .map(|e| e.translate(-union.x, -union.y))
        .collect();
    Ok((canvas, rois))
}

/// Warp `sources[k]` through `projectors[k]` onto a shared canvas.
pub fn warp_images(
    sources: &[RgbImage],
    projectors: &[Projector],
    max_pixels: u64,
) -> Result<(Canvas, Vec<WarpedImage>), StitchErrorKind> {
    let sizes: Vec<(u32, u32)> = sources.iter().map(|s| s.dimensions()).collect();
    let (canvas, rois) = canvas_layout(&sizes, projectors, max_pixels)?;
    let (ox, oy) = (canvas.bounds.x as f64, canvas.bounds.y as f64);

    let warped: Vec<Result<WarpedImage, StitchErrorKind>> = projectors
        .par_iter()
        .zip(sources.par_iter())
        .zip(rois.par_iter())
        .map(|((proj, src), roi)| {
            let (pixels, mask) = warp_roi(src, *roi, |cx, cy| {
                proj.backward(cx + ox, cy + oy).map(|p| (p.x, p.y))
            });

            let (w, h) = src.dimensions();
            let centre = Point2::new((w as f64 - 1.0) / 2.0, (h as f64 - 1.0) / 2.0);
            let centre = proj.forward(&centre).ok_or_else(|| {
                StitchErrorKind::numerical(format!("centre of image {} has no surface position", proj.image))
            })?;

            Ok(WarpedImage {
                image: proj.image,
                roi: *roi,
                pixels,
                mask,
                centre: Point2::new(centre.x - ox, centre.y - oy),
            })
        })
        .collect();
    let warped = warped.into_iter().collect::<Result<Vec<_>, _>>()?;

    debug!(
        width = canvas.width(),
        height = canvas.height(),
        images = warped.len(),
        "images warped onto canvas"
    );
    Ok((canvas, warped))
}
