mod common;

use common::*;
use cv_core::{transform_point, ImageId, SourceImage};
use cv_features::extract_features;
use cv_photo::stitcher::bundle::{bundle_adjust, transfer_rms};
use cv_photo::stitcher::camera::{check_tree_geometry, initial_cameras};
use cv_photo::stitcher::pairwise::{match_all_pairs, match_pair};
use cv_photo::stitcher::seam::find_seams;
use cv_photo::stitcher::warp::{planar_projectors, warp_images};
use cv_photo::*;
use image::GrayImage;
use nalgebra::{Matrix3, Point2};
use std::f64::consts::PI;

fn features_of(images: &[SourceImage], config: &StitchConfig) -> Vec<cv_features::ImageFeatures> {
    images
        .iter()
        .map(|img| extract_features(img, &config.extractor_config()).unwrap())
        .collect()
}

fn ids(images: &[SourceImage]) -> Vec<ImageId> {
    images.iter().map(|i| i.id()).collect()
}

/// Strips are crops of one flat scene.
fn planar() -> StitchConfig {
    StitchConfig::default().with_projection(Projection::Plane)
}

/// Cylinder width of `count` level views `step` radians apart.
fn swept_width(count: u32, step: f64) -> f64 {
    let half_fov = ((VIEW_WIDTH as f64 - 1.0) / 2.0 / PAN_FOCAL).atan();
    PAN_FOCAL * (step * (count - 1) as f64 + 2.0 * half_fov)
}

#[test]
fn test_three_overlapping_views_give_a_wide_strip() {
    init_tracing();
    let images = strip(3, 21, 0);
    let pano = stitch(&images, &planar()).unwrap();
    let c = &pano.composite;

    let ratio = c.width() as f64 / VIEW_WIDTH as f64;
    assert!((2.4..=2.7).contains(&ratio), "width ratio {ratio} ({}px)", c.width());
    assert!(
        (c.height() as i64 - VIEW_HEIGHT as i64).abs() <= 2,
        "height {}",
        c.height()
    );
    assert_eq!(c.ids.len(), 3);
    assert_eq!(c.reference, ImageId(1));
    assert!(pano.report.excluded.is_empty());
    assert_eq!(pano.report.components.len(), 1);

    let coverage = c.covered_pixels() as f64 / (c.width() * c.height()) as f64;
    assert!(coverage > 0.95, "coverage {coverage}");
}

#[test]
fn test_stitching_twice_is_bit_identical() {
    let images = strip(3, 5, 10);
    let config = planar();
    let first = stitch(&images, &config).unwrap();
    let second = stitch(&images, &config).unwrap();
    assert_eq!(first.composite.image.as_raw(), second.composite.image.as_raw());
    assert_eq!(first.composite.coverage.as_raw(), second.composite.coverage.as_raw());
}

#[test]
fn test_dedicated_pool_matches_global_pool() {
    let images = strip(2, 8, 0);
    let global = stitch(&images, &planar()).unwrap();
    let pooled = stitch(&images, &planar().with_threads(Some(2))).unwrap();
    assert_eq!(global.composite, pooled.composite);
}

#[test]
fn test_non_overlapping_images_are_insufficient_overlap() {
    let images = vec![
        strip(1, 100, 0).remove(0),
        strip(1, 200, 1).remove(0),
        strip(1, 300, 2).remove(0),
    ];
    let result = stitch(&images, &StitchConfig::default());
    let err = result.as_ref().unwrap_err();
    assert_eq!(err.kind, StitchErrorKind::InsufficientOverlap);
    assert_eq!(err.stage, PipelineStage::Graphing);
    assert_eq!(Status::of(&result), Status::InsufficientOverlap);
    assert_eq!(Status::of(&result).code(), 2);
}

#[test]
fn test_single_image_is_insufficient() {
    let images = strip(1, 3, 0);
    let result = stitch(&images, &StitchConfig::default());
    assert_eq!(Status::of(&result), Status::InsufficientImages);
}

#[test]
fn test_solid_colour_images_do_not_crash() {
    let images = vec![solid(0, [120, 30, 200]), solid(1, [120, 30, 200])];
    let err = stitch(&images, &StitchConfig::default()).unwrap_err();
    assert_eq!(err.kind, StitchErrorKind::InsufficientOverlap);
}

#[test]
fn test_undersized_image_is_excluded() {
    let mut images = strip(2, 17, 0);
    images.push(SourceImage::from_gray(9u32, GrayImage::new(12, 40)));
    let pano = stitch(&images, &planar()).unwrap();
    assert_eq!(
        pano.report.excluded,
        vec![Exclusion {
            id: ImageId(9),
            reason: ExclusionReason::TooSmall
        }]
    );
    assert_eq!(pano.composite.ids, vec![ImageId(0), ImageId(1)]);
}

#[test]
fn test_unrelated_view_is_excluded_as_no_overlap() {
    let mut images = strip(2, 31, 0);
    images.push(strip(1, 999, 7).remove(0));
    let pano = stitch(&images, &planar()).unwrap();
    assert!(pano.report.is_excluded(ImageId(7)));
    assert_eq!(pano.composite.ids.len(), 2);
}

#[test]
fn test_stitch_all_returns_every_component() {
    let mut images = strip(2, 41, 0);
    images.extend(strip(3, 42, 10));
    let all = stitch_all(&images, &planar()).unwrap();
    assert_eq!(all.composites.len(), 2);
    assert_eq!(all.composites[0].ids.len(), 3);
    assert_eq!(all.composites[1].ids.len(), 2);
    assert_eq!(all.report.components.len(), 2);

    let single = stitch(&images, &planar()).unwrap();
    assert_eq!(single.composite.ids, all.composites[0].ids);
}

#[test]
fn test_pair_homographies_are_mutually_inverse() {
    let images = strip(2, 55, 0);
    let config = StitchConfig::default();
    let features = features_of(&images, &config);

    let forward = match_pair(&features, &[0u32, 1], 0, 1, &config).unwrap();
    let backward = match_pair(&features, &[1u32, 0], 0, 1, &config).unwrap();
    assert_eq!((forward.src, forward.dst), (0, 1));
    assert_eq!((backward.src, backward.dst), (1, 0));

    let roundtrip: Matrix3<f64> = backward.homography * forward.homography;
    for (x, y) in [(240.0, 40.0), (280.0, 120.0), (300.0, 200.0)] {
        let p = Point2::new(x, y);
        let q = transform_point(&roundtrip, &p).unwrap();
        assert!((q - p).norm() < 1.0, "{p} -> {q}");

        let shifted = transform_point(&forward.homography, &p).unwrap();
        assert!((shifted.x - (x - VIEW_STEP as f64)).abs() < 1.0);
        assert!((shifted.y - y).abs() < 1.0);
    }
}

#[test]
fn test_seam_masks_partition_the_covered_canvas() {
    let images = strip(3, 61, 0);
    let config = StitchConfig::default();
    let features = features_of(&images, &config);
    let keys = ids(&images);
    let graph = AlignmentGraph::build(
        images.len(),
        match_all_pairs(&features, &keys, &config),
        config.match_confidence_threshold,
    );
    let (components, _) = graph.partition(&keys);
    let cameras = initial_cameras(&components[0], &graph.edges).unwrap();
    let sources: Vec<_> = cameras.iter().map(|c| images[c.image].to_rgb()).collect();
    let projectors = planar_projectors(&cameras).unwrap();
    let (canvas, warped) = warp_images(&sources, &projectors, config.max_canvas_pixels).unwrap();

    for strategy in [SeamStrategy::GraphCut, SeamStrategy::Heuristic] {
        let seams = find_seams(&canvas, &warped, strategy);
        for y in 0..canvas.height() {
            for x in 0..canvas.width() {
                let covering: Vec<u32> = warped
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.covers(x as i64, y as i64))
                    .map(|(i, _)| i as u32)
                    .collect();
                match seams.label(x, y) {
                    None => assert!(covering.is_empty()),
                    Some(l) => assert!(covering.contains(&l)),
                }
            }
        }
    }
}

#[test]
fn test_collinear_correspondences_are_degenerate() {
    let inliers: Vec<Correspondence> = (0..12)
        .map(|i| {
            let p = Point2::new(10.0 + 15.0 * i as f64, 40.0 + 5.0 * i as f64);
            Correspondence {
                src_idx: i,
                dst_idx: i,
                src_pt: p,
                dst_pt: Point2::new(p.x - 100.0, p.y),
            }
        })
        .collect();
    let pair = PairMatch::new(0, 1, cv_core::translation(-100.0, 0.0), inliers, 12);
    let graph = AlignmentGraph::build(2, vec![pair], 0.5);
    let (components, _) = graph.partition(&[0u32, 1]);
    let err = check_tree_geometry(&components[0], &graph.edges).unwrap_err();
    assert!(matches!(err, StitchErrorKind::DegenerateGeometry { .. }));
    assert_eq!(err.status(), Status::DegenerateGeometry);
}

#[test]
fn test_bundle_adjustment_reduces_drift() {
    let images = strip(3, 77, 0);
    let config = StitchConfig::default();
    let features = features_of(&images, &config);
    let keys = ids(&images);
    let graph = AlignmentGraph::build(
        images.len(),
        match_all_pairs(&features, &keys, &config),
        config.match_confidence_threshold,
    );
    let (components, _) = graph.partition(&keys);
    let component = &components[0];
    let mut cameras = initial_cameras(component, &graph.edges).unwrap();
    for cam in cameras.iter_mut().filter(|c| !c.is_reference) {
        cam.homography = cv_core::translation(4.0, -3.0) * cam.homography;
    }

    let before = transfer_rms(component, &graph.edges, &cameras, config.ba_max_points_per_edge).unwrap();
    let report = bundle_adjust(component, &graph.edges, &mut cameras, &config).unwrap();
    let after = transfer_rms(component, &graph.edges, &cameras, config.ba_max_points_per_edge).unwrap();
    assert!(after < before, "{before} -> {after}");
    assert!(report.final_rms < report.initial_rms);
    assert!(after < 1.5, "rms {after}");
}

#[test]
fn test_alternate_modes_also_stitch() {
    let mut images = strip(3, 88, 0);
    images[2] = brighten(&images[2], 1.25);
    let config = planar()
        .with_blend_mode(BlendMode::Feather)
        .with_seam_strategy(SeamStrategy::Heuristic)
        .with_exposure(ExposureMode::ChannelGains);
    let pano = stitch(&images, &config).unwrap();
    let ratio = pano.composite.width() as f64 / VIEW_WIDTH as f64;
    assert!((2.4..=2.7).contains(&ratio), "width ratio {ratio}");
}

#[test]
fn test_config_loads_from_partial_json() {
    let config = StitchConfig::from_json(r#"{ "blend_mode": "Feather", "min_inliers": 12 }"#).unwrap();
    assert_eq!(config.blend_mode, BlendMode::Feather);
    assert_eq!(config.min_inliers, 12);
    assert_eq!(config.seam_strategy, SeamStrategy::GraphCut);

    let err = StitchConfig::from_json(r#"{ "match_ratio": 3.0 }"#).unwrap_err();
    assert!(matches!(err, StitchErrorKind::InvalidConfig(_)));
}

#[test]
fn test_rotating_views_stitch_on_cylinder() {
    init_tracing();
    let images = pan(3, 13, 0);
    let pano = stitch(&images, &StitchConfig::default()).unwrap();
    let c = &pano.composite;

    let expected = swept_width(3, 30f64.to_radians());
    let ratio = c.width() as f64 / expected;
    assert!((0.95..=1.05).contains(&ratio), "width {} vs {expected:.0}", c.width());
    assert!((238..=243).contains(&c.height()), "height {}", c.height());
    assert_eq!(c.ids.len(), 3);
    assert!(pano.report.excluded.is_empty());

    let coverage = c.covered_pixels() as f64 / (c.width() * c.height()) as f64;
    assert!(coverage > 0.9, "coverage {coverage}");
}

#[test]
fn test_rotating_views_stitch_on_sphere() {
    let images = pan(3, 14, 0);
    let pano = stitch(&images, &StitchConfig::default().with_projection(Projection::Spherical)).unwrap();
    let expected = swept_width(3, 30f64.to_radians());
    let ratio = pano.composite.width() as f64 / expected;
    assert!((0.95..=1.05).contains(&ratio), "width {} vs {expected:.0}", pano.composite.width());
    assert!(pano.composite.height() < 250, "height {}", pano.composite.height());
}

#[test]
fn test_plane_projection_of_a_wide_pan_is_wider_than_the_cylinder() {
    let images = pan(3, 15, 0);
    let cylinder = stitch(&images, &StitchConfig::default()).unwrap();
    let plane = stitch(&images, &planar()).unwrap();
    assert!(
        plane.composite.width() > cylinder.composite.width(),
        "{} vs {}",
        plane.composite.width(),
        cylinder.composite.width()
    );
}

#[test]
fn test_wave_correction_levels_tilted_sweep() {
    init_tracing();
    let images = rotating_views(5, 16, 0, 28f64.to_radians(), 18f64.to_radians());
    let levelled = stitch(&images, &StitchConfig::default()).unwrap();
    let wavy = stitch(&images, &StitchConfig::default().with_wave_correction(false)).unwrap();

    // a level sweep pitched by 18 degrees spans about 270 rows
    let (h_level, h_wavy) = (levelled.composite.height(), wavy.composite.height());
    assert!(h_level < 290, "levelled height {h_level}");
    assert!(h_wavy > h_level + 30, "wavy {h_wavy} vs levelled {h_level}");
    assert_eq!(levelled.composite.ids.len(), 5);
}

#[test]
fn test_degenerate_component_is_dropped_for_the_next() {
    // the three-view canvas is about 187k pixels, the two-view one 132k
    let mut images = strip(3, 42, 10);
    images.extend(strip(2, 41, 0));
    let config = planar().with_max_canvas_pixels(160_000);
    let pano = stitch(&images, &config).unwrap();

    assert_eq!(pano.report.dropped_components, 1);
    assert_eq!(pano.composite.ids, vec![ImageId(0), ImageId(1)]);
    for id in [10u32, 11, 12] {
        assert!(
            pano.report.excluded.contains(&Exclusion {
                id: ImageId(id),
                reason: ExclusionReason::DegenerateComponent
            }),
            "{:?}",
            pano.report.excluded
        );
    }
    assert_eq!(pano.report.components.len(), 1);
}

#[test]
fn test_lone_degenerate_component_fails_the_run() {
    let images = strip(3, 42, 10);
    let result = stitch(&images, &planar().with_max_canvas_pixels(160_000));
    let err = result.as_ref().unwrap_err();
    assert!(matches!(err.kind, StitchErrorKind::DegenerateGeometry { .. }));
    assert_eq!(err.stage, PipelineStage::Compensating);
    assert_eq!(Status::of(&result), Status::DegenerateGeometry);
    assert_eq!(Status::of(&result).code(), 3);
}
