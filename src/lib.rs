//! Panorama stitching over the `cv-*` building blocks.
//!
//! ```no_run
//! use rust_cv_panorama::{stitch, SourceImage, StitchConfig};
//!
//! # let images: Vec<SourceImage> = Vec::new();
//! rust_cv_panorama::init_thread_pool(Some(4)).ok();
//! let pano = stitch(&images, &StitchConfig::default());
//! ```

pub use cv_core as core;
pub use cv_features as features;
pub use cv_imgproc as imgproc;
pub use cv_photo as photo;

pub use cv_core::{ImageId, SourceImage};
pub use cv_photo::{
    stitch, stitch_all, BlendMode, Composite, ExposureMode, Panorama, Panoramas, Projection, SeamStrategy,
    Status, StitchConfig, StitchError, StitchErrorKind, StitchReport, Stitcher,
};

/// Initialize a single global Rayon thread pool for all CPU-parallel routines.
///
/// Call this once at application startup before stitching. Repeated calls
/// are idempotent and return the first initialization result.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `RUSTCV_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> cv_core::Result<()> {
    cv_core::init_global_thread_pool(num_threads)
}
