//! Core types shared by the panorama crates.
//!
//! Holds the caller-facing [`SourceImage`], keypoint/descriptor containers,
//! homography geometry helpers, a seeded RANSAC engine and the global rayon
//! pool initializer.

pub mod descriptor;
pub mod geometry;
pub mod image;
pub mod keypoint;
pub mod robust;
pub mod runtime;

pub use self::descriptor::*;
pub use self::geometry::*;
pub use self::image::*;
pub use self::keypoint::*;
pub use robust::{Ransac, RobustConfig, RobustModel, RobustResult};
pub use runtime::{current_cpu_threads, init_global_thread_pool, install_pool};

pub use ::image::{GrayImage, RgbImage};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid image buffer: {0}")]
    InvalidImage(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}
