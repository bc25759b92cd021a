//! Computational Photography Algorithms
//!
//! Multi-image compositing built on the feature and image-processing crates.
//!
//! # Algorithms
//!
//! - **Panorama stitching**: pairwise homographies, bundle adjustment,
//!   gain compensation, graph-cut seams and multi-band blending
//!
//! # Example: Stitching
//!
//! ```no_run
//! # use cv_core::SourceImage;
//! # use cv_photo::{stitch, StitchConfig};
//! # let images: Vec<SourceImage> = Vec::new();
//! let pano = stitch(&images, &StitchConfig::default());
//! ```

pub mod stitcher;

pub use stitcher::*;
