//! Synthetic scenes shared by the functional tests.
#![allow(dead_code)]

use cv_core::SourceImage;
use image::{imageops, Rgb, RgbImage};
use nalgebra::{Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const VIEW_WIDTH: u32 = 320;
pub const VIEW_HEIGHT: u32 = 240;
/// Horizontal distance between consecutive views (about 30 % overlap).
pub const VIEW_STEP: u32 = 230;

/// Colour value noise on an 8 px lattice with flat rectangles on top.
pub fn world(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let cell = 8u32;
    let gw = width / cell + 2;
    let gh = height / cell + 2;
    let grid: Vec<[f32; 3]> = (0..gw * gh)
        .map(|_| {
            [
                rng.gen_range(0.0..255.0),
                rng.gen_range(0.0..255.0),
                rng.gen_range(0.0..255.0),
            ]
        })
        .collect();

    let mut img = RgbImage::from_fn(width, height, |x, y| {
        let fx = x as f32 / cell as f32;
        let fy = y as f32 / cell as f32;
        let (gx, gy) = (fx as u32, fy as u32);
        let (tx, ty) = (fx - gx as f32, fy - gy as f32);
        let at = |i: u32, j: u32, c: usize| grid[(j * gw + i) as usize][c];
        let mut px = [0u8; 3];
        for (c, p) in px.iter_mut().enumerate() {
            let top = at(gx, gy, c) * (1.0 - tx) + at(gx + 1, gy, c) * tx;
            let bottom = at(gx, gy + 1, c) * (1.0 - tx) + at(gx + 1, gy + 1, c) * tx;
            *p = (top * (1.0 - ty) + bottom * ty) as u8;
        }
        Rgb(px)
    });

    for _ in 0..(width * height / 2500) {
        let w = rng.gen_range(8..48);
        let h = rng.gen_range(8..48);
        let x0 = rng.gen_range(0..width - w);
        let y0 = rng.gen_range(0..height - h);
        let colour = Rgb([rng.gen(), rng.gen(), rng.gen()]);
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, colour);
            }
        }
    }
    img
}

pub fn crop(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> RgbImage {
    imageops::crop_imm(img, x, y, w, h).to_image()
}

/// `count` views side by side, `VIEW_STEP` apart, ids `first_id..`.
pub fn strip(count: u32, seed: u64, first_id: u32) -> Vec<SourceImage> {
    let width = VIEW_STEP * (count - 1) + VIEW_WIDTH;
    let w = world(width, VIEW_HEIGHT, seed);
    (0..count)
        .map(|i| {
            SourceImage::from_rgb(
                first_id + i,
                crop(&w, i * VIEW_STEP, 0, VIEW_WIDTH, VIEW_HEIGHT),
            )
        })
        .collect()
}

/// Focal length of the rotating views, in pixels.
pub const PAN_FOCAL: f64 = 400.0;

/// `count` views of a cylindrical backdrop from a camera that pans
/// `yaw_step` radians per view about the vertical axis while tilted by
/// `pitch`. Ids start at `first_id`.
pub fn rotating_views(count: u32, seed: u64, first_id: u32, yaw_step: f64, pitch: f64) -> Vec<SourceImage> {
    let f = PAN_FOCAL;
    // half a radian of backdrop beyond the outermost view centres
    let margin = 0.5;
    let width = (f * (yaw_step * (count - 1) as f64 + 2.0 * margin)).ceil() as u32 + 2;
    let height = (2.0 * f).ceil() as u32 + 2;
    let backdrop = world(width, height, seed);

    let cx = (VIEW_WIDTH as f64 - 1.0) / 2.0;
    let cy = (VIEW_HEIGHT as f64 - 1.0) / 2.0;
    let tilt = Rotation3::from_axis_angle(&Vector3::x_axis(), pitch);
    (0..count)
        .map(|i| {
            let r = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw_step * i as f64) * tilt;
            let view = RgbImage::from_fn(VIEW_WIDTH, VIEW_HEIGHT, |x, y| {
                let d = r * Vector3::new(x as f64 - cx, y as f64 - cy, f);
                let u = f * d.x.atan2(d.z) + f * margin;
                let v = f * d.y / d.x.hypot(d.z) + f;
                bilinear(&backdrop, u, v)
            });
            SourceImage::from_rgb(first_id + i, view)
        })
        .collect()
}

/// Level views 30 degrees apart.
pub fn pan(count: u32, seed: u64, first_id: u32) -> Vec<SourceImage> {
    rotating_views(count, seed, first_id, 30f64.to_radians(), 0.0)
}

fn bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let x = x.clamp(0.0, (img.width() - 1) as f64);
    let y = y.clamp(0.0, (img.height() - 1) as f64);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);
    let (tx, ty) = (x - x0 as f64, y - y0 as f64);
    let mut px = [0u8; 3];
    for (c, p) in px.iter_mut().enumerate() {
        let at = |i: u32, j: u32| img.get_pixel(i, j).0[c] as f64;
        let top = at(x0, y0) * (1.0 - tx) + at(x1, y0) * tx;
        let bottom = at(x0, y1) * (1.0 - tx) + at(x1, y1) * tx;
        *p = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    Rgb(px)
}

pub fn solid(id: u32, colour: [u8; 3]) -> SourceImage {
    SourceImage::from_rgb(id, RgbImage::from_pixel(VIEW_WIDTH, VIEW_HEIGHT, Rgb(colour)))
}

/// Multiply every sample by `gain`, saturating.
pub fn brighten(img: &SourceImage, gain: f32) -> SourceImage {
    let mut rgb = img.to_rgb();
    for p in rgb.pixels_mut() {
        for v in p.0.iter_mut() {
            *v = (*v as f32 * gain).round().min(255.0) as u8;
        }
    }
    SourceImage::from_rgb(img.id(), rgb)
}

/// Route pipeline logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
