use cv_core::{transform_point, SourceImage};
use cv_features::*;
use image::{imageops, GrayImage, Luma};
use nalgebra::Point2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Smooth value noise with random flat rectangles painted on top.
fn random_rectangles(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let cell = 8u32;
    let gw = width / cell + 2;
    let gh = height / cell + 2;
    let grid: Vec<f32> = (0..gw * gh).map(|_| rng.gen_range(0.0..255.0)).collect();
    let mut img = GrayImage::from_fn(width, height, |x, y| {
        let fx = x as f32 / cell as f32;
        let fy = y as f32 / cell as f32;
        let (gx, gy) = (fx as u32, fy as u32);
        let (tx, ty) = (fx - gx as f32, fy - gy as f32);
        let at = |i: u32, j: u32| grid[(j * gw + i) as usize];
        let top = at(gx, gy) * (1.0 - tx) + at(gx + 1, gy) * tx;
        let bottom = at(gx, gy + 1) * (1.0 - tx) + at(gx + 1, gy + 1) * tx;
        Luma([(top * (1.0 - ty) + bottom * ty) as u8])
    });

    for _ in 0..(width * height / 2500) {
        let w = rng.gen_range(8..48);
        let h = rng.gen_range(8..48);
        let x0 = rng.gen_range(0..width - w);
        let y0 = rng.gen_range(0..height - h);
        let v = rng.gen_range(0..=255u8);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    img
}

fn crop(img: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
    imageops::crop_imm(img, x, y, w, h).to_image()
}

#[test]
fn test_shifted_crop_is_recovered_within_one_pixel() {
    let world = random_rectangles(480, 320, 7);
    let a = SourceImage::from_gray(0u32, crop(&world, 20, 30, 320, 240));
    let b = SourceImage::from_gray(1u32, crop(&world, 57, 41, 320, 240));

    let config = ExtractorConfig::default();
    let fa = extract_features(&a, &config).unwrap();
    let fb = extract_features(&b, &config).unwrap();
    assert!(fa.len() > 50, "only {} keypoints", fa.len());

    let matches = match_descriptors(&fa.descriptors, &fb.descriptors, 0.8);
    assert!(matches.len() >= 20, "only {} matches", matches.len());

    let pairs: Vec<MatchPair> = matches
        .iter()
        .map(|m| {
            MatchPair::new(
                fa.keypoints.keypoints[m.query_idx].pt(),
                fb.keypoints.keypoints[m.train_idx].pt(),
            )
        })
        .collect();
    let result = estimate_homography(&pairs, &RansacConfig::default());
    let h = result.model.expect("homography");

    for (x, y) in [(50.0, 50.0), (160.0, 120.0), (280.0, 200.0)] {
        let p = transform_point(&h, &Point2::new(x, y)).unwrap();
        assert!((p.x - (x - 37.0)).abs() < 1.0, "x: {} vs {}", p.x, x - 37.0);
        assert!((p.y - (y - 11.0)).abs() < 1.0, "y: {} vs {}", p.y, y - 11.0);
    }
}

#[test]
fn test_extraction_is_deterministic() {
    let img = SourceImage::from_gray(4u32, random_rectangles(320, 240, 11));
    let config = ExtractorConfig::default();
    let first = extract_features(&img, &config).unwrap();
    let second = extract_features(&img, &config).unwrap();

    assert_eq!(first.keypoints.keypoints, second.keypoints.keypoints);
    let d1: Vec<_> = first.descriptors.iter().map(|d| d.data.clone()).collect();
    let d2: Vec<_> = second.descriptors.iter().map(|d| d.data.clone()).collect();
    assert_eq!(d1, d2);
}

#[test]
fn test_max_features_caps_output() {
    let img = SourceImage::from_gray(5u32, random_rectangles(320, 240, 3));
    let config = ExtractorConfig {
        max_features: 40,
        ..Default::default()
    };
    let features = extract_features(&img, &config).unwrap();
    assert_eq!(features.len(), 40);
    assert_eq!(features.descriptors.len(), 40);
}

#[test]
fn test_solid_image_yields_no_keypoints() {
    let img = SourceImage::from_gray(6u32, GrayImage::from_pixel(64, 64, Luma([200])));
    let features = extract_features(&img, &ExtractorConfig::default()).unwrap();
    assert!(features.is_empty());
}

#[test]
fn test_undersized_image_is_rejected() {
    let img = SourceImage::from_gray(7u32, GrayImage::new(12, 12));
    let err = extract_features(&img, &ExtractorConfig::default()).unwrap_err();
    assert!(matches!(err, FeatureError::ImageTooSmall { min: 16, .. }));
}

#[test]
fn test_unrelated_images_produce_few_consistent_matches() {
    let a = SourceImage::from_gray(8u32, random_rectangles(320, 240, 100));
    let b = SourceImage::from_gray(9u32, random_rectangles(320, 240, 200));
    let config = ExtractorConfig::default();
    let fa = extract_features(&a, &config).unwrap();
    let fb = extract_features(&b, &config).unwrap();
    let matches = match_descriptors(&fa.descriptors, &fb.descriptors, 0.8);

    let pairs: Vec<MatchPair> = matches
        .iter()
        .map(|m| {
            MatchPair::new(
                fa.keypoints.keypoints[m.query_idx].pt(),
                fb.keypoints.keypoints[m.train_idx].pt(),
            )
        })
        .collect();
    let result = estimate_homography(&pairs, &RansacConfig::default());
    let ratio = if pairs.is_empty() {
        0.0
    } else {
        result.num_inliers as f64 / pairs.len() as f64
    };
    assert!(
        result.num_inliers < 8 || ratio < 0.5,
        "{} inliers, ratio {ratio}",
        result.num_inliers
    );
}
