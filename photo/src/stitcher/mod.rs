//! Panorama stitching pipeline.
//!
//! Stages run strictly forward:
//!
//! 1. **Extracting**: oriented corners and binary descriptors per image
//! 2. **Matching**: ratio-tested matches verified by RANSAC homographies
//! 3. **Graphing**: confident pairs form connected components
//! 4. **Estimating**: spanning-tree initialisation, bundle adjustment and,
//!    for rotating cameras, wave correction
//! 5. **Compensating**: warp onto the canvas and equalize gains
//! 6. **SeamFinding**: one owner per covered canvas pixel
//! 7. **Blending**: feather or multi-band composite
//!
//! Every failure is reported with the stage it happened in; a run either
//! returns a full composite or nothing.
//!
//! # Example
//!
//! ```no_run
//! use cv_core::SourceImage;
//! use cv_photo::stitcher::{stitch, StitchConfig, Status};
//!
//! # fn load() -> Vec<SourceImage> { Vec::new() }
//! let images = load();
//! let result = stitch(&images, &StitchConfig::default());
//! match &result {
//!     Ok(pano) => println!("{}x{}", pano.composite.width(), pano.composite.height()),
//!     Err(e) => eprintln!("{e} (status {})", Status::of(&result).code()),
//! }
//! ```

pub mod blend;
pub mod bundle;
pub mod camera;
pub mod config;
pub mod error;
pub mod exposure;
pub mod graph;
pub mod maxflow;
pub mod pairwise;
pub mod rotation;
pub mod seam;
pub mod warp;

pub use bundle::BundleReport;
pub use camera::CameraModel;
pub use config::{BlendMode, ExposureMode, Projection, SeamStrategy, StitchConfig};
pub use error::{PipelineStage, Result, Status, StitchError, StitchErrorKind};
pub use graph::{AlignmentGraph, Component};
pub use pairwise::{Correspondence, PairMatch};
pub use rotation::RotationCamera;
pub use seam::SeamMask;

use cv_core::{install_pool, ImageId, SourceImage};
use cv_features::{extract_features, FeatureError, ImageFeatures};
use image::{GrayImage, RgbImage};
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, info, info_span, warn};

/// The stitched output of one component.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub image: RgbImage,
    /// 255 where some image contributed, 0 elsewhere (black in `image`).
    pub coverage: GrayImage,
    /// Contributing images.
    pub ids: Vec<ImageId>,
    /// Image whose pixel grid the canvas follows.
    pub reference: ImageId,
}

impl Composite {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn covered_pixels(&self) -> usize {
        cv_imgproc::count_nonzero(&self.coverage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Below `min_image_dimension` on some side.
    TooSmall,
    /// No confident pair with any other image.
    NoOverlap,
    /// Its component could not be aligned and another one was used.
    DegenerateComponent,
}

/// An input image that does not appear in any composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exclusion {
    pub id: ImageId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReport {
    pub ids: Vec<ImageId>,
    pub reference: ImageId,
    pub bundle: BundleReport,
}

/// Diagnostics of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StitchReport {
    pub excluded: Vec<Exclusion>,
    pub dropped_components: usize,
    /// One entry per composite, in the same order.
    pub components: Vec<ComponentReport>,
}

impl StitchReport {
    pub fn is_excluded(&self, id: ImageId) -> bool {
        self.excluded.iter().any(|e| e.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Panorama {
    pub composite: Composite,
    pub report: StitchReport,
}

/// Every surviving component, largest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Panoramas {
    pub composites: Vec<Composite>,
    pub report: StitchReport,
}

/// Images that passed extraction, with their features.
struct Usable<'a> {
    images: Vec<&'a SourceImage>,
    features: Vec<ImageFeatures>,
    keys: Vec<ImageId>,
}

/// Aligned cameras of one component, ready to project.
struct Alignment {
    projectors: Vec<warp::Projector>,
    bundle: BundleReport,
}

fn failed(stage: PipelineStage) -> impl Fn(StitchErrorKind) -> StitchError {
    move |kind| StitchError::new(stage, kind)
}

#[derive(Debug, Clone, Default)]
pub struct Stitcher {
    config: StitchConfig,
}

impl Stitcher {
    pub fn new(config: StitchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    /// Composite of the largest alignable component.
    pub fn stitch(&self, images: &[SourceImage]) -> Result<Panorama> {
        let Panoramas { composites, report } = self.run(images, false)?;
        let composite = composites
            .into_iter()
            .next()
            .ok_or_else(|| StitchError::new(PipelineStage::Blending, StitchErrorKind::InsufficientOverlap))?;
        Ok(Panorama { composite, report })
    }

    /// One composite per alignable component.
    pub fn stitch_all(&self, images: &[SourceImage]) -> Result<Panoramas> {
        self.run(images, true)
    }

    fn run(&self, images: &[SourceImage], all: bool) -> Result<Panoramas> {
        self.config.validate().map_err(failed(PipelineStage::Init))?;
        let outcome = install_pool(self.config.threads, || self.pipeline(images, all))
            .map_err(|e| StitchError::new(PipelineStage::Init, StitchErrorKind::InvalidConfig(e.to_string())))?;
        match &outcome {
            Ok(p) => info!(
                stage = %PipelineStage::Done,
                composites = p.composites.len(),
                excluded = p.report.excluded.len(),
                "stitching finished"
            ),
            Err(e) => warn!(stage = %PipelineStage::Failed, failed_in = %e.stage, error = %e.kind, "stitching failed"),
        }
        outcome
    }

    fn pipeline(&self, images: &[SourceImage], all: bool) -> Result<Panoramas> {
        let _run = info_span!("stitch", images = images.len()).entered();
        info!(stage = %PipelineStage::Init, images = images.len(), "stitching started");
        if images.len() < 2 {
            return Err(StitchError::new(
                PipelineStage::Init,
                StitchErrorKind::InsufficientImages {
                    provided: images.len(),
                },
            ));
        }

        let mut report = StitchReport::default();
        let usable = self.extract(images, &mut report)?;

        let matches = {
            let _s = info_span!("matching").entered();
            info!(stage = %PipelineStage::Matching, pairs = usable.keys.len() * (usable.keys.len() - 1) / 2);
            pairwise::match_all_pairs(&usable.features, &usable.keys, &self.config)
        };

        let (graph, components) = {
            let _s = info_span!("graphing").entered();
            info!(stage = %PipelineStage::Graphing, verified_pairs = matches.len());
            let graph = AlignmentGraph::build(usable.keys.len(), matches, self.config.match_confidence_threshold);
            let (mut components, isolated) = graph.partition(&usable.keys);
            for node in isolated {
                warn!(image = %usable.keys[node], "no confident overlap, excluding image");
                report.excluded.push(Exclusion {
                    id: usable.keys[node],
                    reason: ExclusionReason::NoOverlap,
                });
            }
            if components.is_empty() {
                return Err(StitchError::new(
                    PipelineStage::Graphing,
                    StitchErrorKind::InsufficientOverlap,
                ));
            }
            components.sort_by(|a, b| component_order(a, b, &usable.keys));
            debug!(components = components.len(), "alignment graph partitioned");
            (graph, components)
        };

        let alignments: Vec<Result<Alignment>> = {
            let _s = info_span!("estimating").entered();
            info!(stage = %PipelineStage::Estimating, components = components.len());
            components
                .par_iter()
                .map(|c| self.align(c, &graph, &usable))
                .collect()
        };
        // numerical failures end the run whichever component they hit
        if let Some(Err(e)) = alignments
            .iter()
            .find(|a| matches!(a, Err(e) if !is_degenerate(e)))
        {
            return Err(e.clone());
        }

        let mut composites = Vec::new();
        let mut last_degenerate = None;
        for (component, alignment) in components.iter().zip(alignments) {
            let rendered = alignment.and_then(|a| {
                self.render(component, &a, &usable).map(|c| (c, a.bundle))
            });
            match rendered {
                Ok((composite, bundle)) => {
                    report.components.push(ComponentReport {
                        ids: composite.ids.clone(),
                        reference: composite.reference,
                        bundle,
                    });
                    composites.push(composite);
                    if !all {
                        break;
                    }
                }
                Err(e) if is_degenerate(&e) => {
                    warn!(
                        images = component.len(),
                        stage = %e.stage,
                        error = %e.kind,
                        "dropping degenerate component"
                    );
                    report.dropped_components += 1;
                    report.excluded.extend(component.nodes.iter().map(|&n| Exclusion {
                        id: usable.keys[n],
                        reason: ExclusionReason::DegenerateComponent,
                    }));
                    last_degenerate = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if composites.is_empty() {
            return Err(last_degenerate.unwrap_or_else(|| {
                StitchError::new(PipelineStage::Graphing, StitchErrorKind::InsufficientOverlap)
            }));
        }
        Ok(Panoramas { composites, report })
    }

    fn extract<'a>(&self, images: &'a [SourceImage], report: &mut StitchReport) -> Result<Usable<'a>> {
        let _s = info_span!("extracting").entered();
        info!(stage = %PipelineStage::Extracting, images = images.len());
        let extractor = self.config.extractor_config();

        let extracted: Vec<std::result::Result<ImageFeatures, FeatureError>> = images
            .par_iter()
            .map(|img| extract_features(img, &extractor))
            .collect();

        let mut usable = Usable {
            images: Vec::new(),
            features: Vec::new(),
            keys: Vec::new(),
        };
        for (img, result) in images.iter().zip(extracted) {
            match result {
                Ok(features) => {
                    usable.images.push(img);
                    usable.features.push(features);
                    usable.keys.push(img.id());
                }
                Err(FeatureError::ImageTooSmall { width, height, min }) => {
                    warn!(image = %img.id(), width, height, min, "image too small, excluding");
                    report.excluded.push(Exclusion {
                        id: img.id(),
                        reason: ExclusionReason::TooSmall,
                    });
                }
                Err(e) => {
                    return Err(StitchError::new(
                        PipelineStage::Extracting,
                        StitchErrorKind::from_feature_error(img.id(), e),
                    ))
                }
            }
        }

        if usable.images.len() < 2 {
            return Err(StitchError::new(
                PipelineStage::Extracting,
                StitchErrorKind::InsufficientImages {
                    provided: usable.images.len(),
                },
            ));
        }
        Ok(usable)
    }

    fn align(&self, component: &Component, graph: &AlignmentGraph, usable: &Usable<'_>) -> Result<Alignment> {
        let at = failed(PipelineStage::Estimating);
        camera::check_tree_geometry(component, &graph.edges).map_err(&at)?;

        let Some(surface) = warp::Surface::of(self.config.projection) else {
            let mut cameras = camera::initial_cameras(component, &graph.edges).map_err(&at)?;
            let bundle = bundle::bundle_adjust(component, &graph.edges, &mut cameras, &self.config).map_err(&at)?;
            let projectors = warp::planar_projectors(&cameras).map_err(&at)?;
            return Ok(Alignment { projectors, bundle });
        };

        let sizes: Vec<(u32, u32)> = component
            .nodes
            .iter()
            .map(|&n| (usable.images[n].width(), usable.images[n].height()))
            .collect();
        let focal = rotation::estimate_focal(component, &graph.edges, &sizes);
        let mut cameras = rotation::initial_rotations(component, &graph.edges, &sizes, focal).map_err(&at)?;
        let bundle = bundle::bundle_adjust_rays(component, &graph.edges, &mut cameras, &self.config).map_err(&at)?;
        if self.config.wave_correction && !rotation::wave_correct(&mut cameras) {
            debug!(images = component.len(), "sweep too narrow for wave correction");
        }
        let projectors = warp::rotational_projectors(&cameras, surface).map_err(&at)?;
        Ok(Alignment { projectors, bundle })
    }

    fn render(&self, component: &Component, alignment: &Alignment, usable: &Usable<'_>) -> Result<Composite> {
        let (canvas, warped) = {
            let _s = info_span!("compensating").entered();
            info!(stage = %PipelineStage::Compensating, images = component.len());
            let at = failed(PipelineStage::Compensating);
            let sources: Vec<RgbImage> = alignment
                .projectors
                .par_iter()
                .map(|proj| usable.images[proj.image].to_rgb())
                .collect();
            let (canvas, mut warped) =
                warp::warp_images(&sources, &alignment.projectors, self.config.max_canvas_pixels).map_err(&at)?;
            let gains = exposure::estimate_gains(&warped, self.config.exposure).map_err(&at)?;
            exposure::apply_gains(&mut warped, &gains);
            (canvas, warped)
        };

        let seams = {
            let _s = info_span!("seam_finding").entered();
            info!(stage = %PipelineStage::SeamFinding, strategy = ?self.config.seam_strategy);
            seam::find_seams(&canvas, &warped, self.config.seam_strategy)
        };

        let _s = info_span!("blending").entered();
        info!(stage = %PipelineStage::Blending, mode = ?self.config.blend_mode);
        let (image, coverage) = blend::blend(&canvas, &warped, &seams, &self.config);
        Ok(Composite {
            image,
            coverage,
            ids: component.nodes.iter().map(|&n| usable.keys[n]).collect(),
            reference: usable.keys[component.reference],
        })
    }
}

fn is_degenerate(e: &StitchError) -> bool {
    matches!(e.kind, StitchErrorKind::DegenerateGeometry { .. })
}

/// Larger components first, then higher total confidence, then the one
/// holding the smallest image id.
fn component_order(a: &Component, b: &Component, keys: &[ImageId]) -> Ordering {
    let first = |c: &Component| c.nodes.iter().map(|&n| keys[n]).min();
    b.len()
        .cmp(&a.len())
        .then(b.total_confidence.total_cmp(&a.total_confidence))
        .then(first(a).cmp(&first(b)))
}

/// Stitch `images` into the panorama of their largest alignable component.
pub fn stitch(images: &[SourceImage], config: &StitchConfig) -> Result<Panorama> {
    Stitcher::new(config.clone()).stitch(images)
}

/// Stitch every alignable component of `images`.
pub fn stitch_all(images: &[SourceImage], config: &StitchConfig) -> Result<Panoramas> {
    Stitcher::new(config.clone()).stitch_all(images)
}
