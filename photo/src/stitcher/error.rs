use cv_core::ImageId;
use cv_features::FeatureError;
use std::fmt;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    Init,
    Extracting,
    Matching,
    Graphing,
    Estimating,
    Compensating,
    SeamFinding,
    Blending,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Init => "init",
            PipelineStage::Extracting => "extracting",
            PipelineStage::Matching => "matching",
            PipelineStage::Graphing => "graphing",
            PipelineStage::Estimating => "estimating",
            PipelineStage::Compensating => "compensating",
            PipelineStage::SeamFinding => "seam-finding",
            PipelineStage::Blending => "blending",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StitchErrorKind {
    #[error("at least 2 usable images are required, got {provided}")]
    InsufficientImages { provided: usize },

    #[error("image {id} is {width}x{height}, minimum is {min}x{min}")]
    ImageTooSmall {
        id: ImageId,
        width: u32,
        height: u32,
        min: u32,
    },

    #[error("no two images overlap enough to be aligned")]
    InsufficientOverlap,

    #[error("degenerate geometry: {reason}")]
    DegenerateGeometry { reason: String },

    #[error("numerical failure: {reason}")]
    InternalNumericalFailure { reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StitchErrorKind {
    pub fn degenerate(reason: impl Into<String>) -> Self {
        StitchErrorKind::DegenerateGeometry {
            reason: reason.into(),
        }
    }

    pub fn numerical(reason: impl Into<String>) -> Self {
        StitchErrorKind::InternalNumericalFailure {
            reason: reason.into(),
        }
    }

    pub fn from_feature_error(id: ImageId, err: FeatureError) -> Self {
        match err {
            FeatureError::ImageTooSmall { width, height, min } => StitchErrorKind::ImageTooSmall {
                id,
                width,
                height,
                min,
            },
            other => StitchErrorKind::numerical(format!("image {id}: {other}")),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            StitchErrorKind::InsufficientImages { .. } => Status::InsufficientImages,
            StitchErrorKind::ImageTooSmall { .. } => Status::ImageTooSmall,
            StitchErrorKind::InsufficientOverlap => Status::InsufficientOverlap,
            StitchErrorKind::DegenerateGeometry { .. } => Status::DegenerateGeometry,
            StitchErrorKind::InternalNumericalFailure { .. } => Status::InternalNumericalFailure,
            StitchErrorKind::InvalidConfig(_) => Status::InvalidConfig,
        }
    }
}

/// A failed run: what went wrong and in which stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("stitching failed while {stage}: {kind}")]
pub struct StitchError {
    pub stage: PipelineStage,
    pub kind: StitchErrorKind,
}

impl StitchError {
    pub fn new(stage: PipelineStage, kind: StitchErrorKind) -> Self {
        Self { stage, kind }
    }

    pub fn status(&self) -> Status {
        self.kind.status()
    }
}

/// Flat status code for callers across an FFI boundary.
///
/// The first four values line up with the classic stitcher status codes
/// (`OK`, `ERR_NEED_MORE_IMGS`, `ERR_HOMOGRAPHY_EST_FAIL`,
/// `ERR_CAMERA_PARAMS_ADJUST_FAIL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    InsufficientImages = 1,
    InsufficientOverlap = 2,
    DegenerateGeometry = 3,
    InternalNumericalFailure = 4,
    ImageTooSmall = 5,
    InvalidConfig = 6,
}

impl Status {
    pub fn of<T>(result: &std::result::Result<T, StitchError>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

pub type Result<T> = std::result::Result<T, StitchError>;
