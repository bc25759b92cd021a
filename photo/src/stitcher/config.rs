use super::error::StitchErrorKind;
use cv_features::{ExtractorConfig, RansacConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    Feather,
    #[default]
    MultiBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeamStrategy {
    /// Nearest warped image centre wins.
    Heuristic,
    /// Pairwise min-cut over the colour difference of each overlap.
    #[default]
    GraphCut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExposureMode {
    None,
    /// One gain per image.
    #[default]
    Gain,
    /// One gain per image and colour channel.
    ChannelGains,
}

/// Surface the aligned images are rendered onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Projection {
    /// Reference image plane; cameras are full homographies.
    Plane,
    /// Cylinder around the vertical axis of a rotating camera.
    #[default]
    Cylindrical,
    /// Sphere around a rotating camera.
    Spherical,
}

/// Tunable policy for one stitching run.
///
/// Every field has a default, so a JSON document only needs the fields it
/// wants to override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    pub match_confidence_threshold: f64,
    pub bundle_adjustment_max_iterations: usize,
    pub bundle_adjustment_epsilon: f64,
    pub projection: Projection,
    /// Straighten the horizon of rotational panoramas after refinement.
    pub wave_correction: bool,
    pub blend_mode: BlendMode,
    pub seam_strategy: SeamStrategy,
    pub exposure: ExposureMode,
    pub registration_max_dimension: Option<u32>,
    pub min_image_dimension: u32,
    pub max_features: usize,
    pub match_ratio: f32,
    pub ransac_threshold: f64,
    pub ransac_max_iterations: usize,
    pub ransac_seed: u64,
    pub min_inliers: usize,
    pub ba_max_points_per_edge: usize,
    pub feather_band: f32,
    pub multiband_levels: usize,
    pub max_canvas_pixels: u64,
    pub threads: Option<usize>,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            match_confidence_threshold: 0.5,
            bundle_adjustment_max_iterations: 100,
            bundle_adjustment_epsilon: 1e-8,
            projection: Projection::Cylindrical,
            wave_correction: true,
            blend_mode: BlendMode::MultiBand,
            seam_strategy: SeamStrategy::GraphCut,
            exposure: ExposureMode::Gain,
            registration_max_dimension: Some(1000),
            min_image_dimension: 16,
            max_features: 1500,
            match_ratio: 0.8,
            ransac_threshold: 3.0,
            ransac_max_iterations: 2000,
            ransac_seed: 0x5eed_cafe,
            min_inliers: 8,
            ba_max_points_per_edge: 200,
            feather_band: 12.0,
            multiband_levels: 5,
            max_canvas_pixels: 100_000_000,
            threads: None,
        }
    }
}

impl StitchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, StitchErrorKind> {
        let config: StitchConfig = serde_json::from_str(json)
            .map_err(|e| StitchErrorKind::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, StitchErrorKind> {
        serde_json::to_string_pretty(self).map_err(|e| StitchErrorKind::InvalidConfig(e.to_string()))
    }

    pub fn with_match_confidence_threshold(mut self, threshold: f64) -> Self {
        self.match_confidence_threshold = threshold;
        self
    }

    pub fn with_bundle_adjustment(mut self, max_iterations: usize, epsilon: f64) -> Self {
        self.bundle_adjustment_max_iterations = max_iterations;
        self.bundle_adjustment_epsilon = epsilon;
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_wave_correction(mut self, enabled: bool) -> Self {
        self.wave_correction = enabled;
        self
    }

    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    pub fn with_seam_strategy(mut self, strategy: SeamStrategy) -> Self {
        self.seam_strategy = strategy;
        self
    }

    pub fn with_exposure(mut self, mode: ExposureMode) -> Self {
        self.exposure = mode;
        self
    }

    pub fn with_registration_max_dimension(mut self, max: Option<u32>) -> Self {
        self.registration_max_dimension = max;
        self
    }

    pub fn with_max_features(mut self, n: usize) -> Self {
        self.max_features = n;
        self
    }

    pub fn with_ransac(mut self, threshold: f64, max_iterations: usize, seed: u64) -> Self {
        self.ransac_threshold = threshold;
        self.ransac_max_iterations = max_iterations;
        self.ransac_seed = seed;
        self
    }

    pub fn with_min_inliers(mut self, n: usize) -> Self {
        self.min_inliers = n;
        self
    }

    pub fn with_feather_band(mut self, band: f32) -> Self {
        self.feather_band = band;
        self
    }

    pub fn with_multiband_levels(mut self, levels: usize) -> Self {
        self.multiband_levels = levels;
        self
    }

    pub fn with_max_canvas_pixels(mut self, pixels: u64) -> Self {
        self.max_canvas_pixels = pixels;
        self
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    /// Inlier floor actually applied; a homography needs at least 4.
    pub fn effective_min_inliers(&self) -> usize {
        self.min_inliers.max(4)
    }

    pub fn validate(&self) -> Result<(), StitchErrorKind> {
        let fail = |msg: &str| Err(StitchErrorKind::InvalidConfig(msg.to_string()));
        if !(0.0..=1.0).contains(&self.match_confidence_threshold) {
            return fail("match_confidence_threshold must lie in [0, 1]");
        }
        if !(self.match_ratio > 0.0 && self.match_ratio <= 1.0) {
            return fail("match_ratio must lie in (0, 1]");
        }
        if !(self.ransac_threshold > 0.0 && self.ransac_threshold.is_finite()) {
            return fail("ransac_threshold must be positive");
        }
        if self.ransac_max_iterations == 0 {
            return fail("ransac_max_iterations must be >= 1");
        }
        if !(self.bundle_adjustment_epsilon > 0.0) {
            return fail("bundle_adjustment_epsilon must be positive");
        }
        if self.max_features == 0 {
            return fail("max_features must be >= 1");
        }
        if self.min_image_dimension == 0 {
            return fail("min_image_dimension must be >= 1");
        }
        if self.ba_max_points_per_edge < 4 {
            return fail("ba_max_points_per_edge must be >= 4");
        }
        if !(self.feather_band > 0.0 && self.feather_band.is_finite()) {
            return fail("feather_band must be positive");
        }
        if self.multiband_levels == 0 {
            return fail("multiband_levels must be >= 1");
        }
        if self.max_canvas_pixels == 0 {
            return fail("max_canvas_pixels must be >= 1");
        }
        if self.threads == Some(0) {
            return fail("threads must be >= 1");
        }
        Ok(())
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_features: self.max_features,
            min_dimension: self.min_image_dimension,
            registration_max_dimension: self.registration_max_dimension,
            ..ExtractorConfig::default()
        }
    }

    /// RANSAC settings for one pair, seeded from the pair's position so the
    /// result does not depend on scheduling.
    pub fn ransac_config(&self, src: usize, dst: usize) -> RansacConfig {
        let pair = ((src as u64) << 32) | dst as u64;
        RansacConfig {
            threshold: self.ransac_threshold,
            max_iterations: self.ransac_max_iterations,
            confidence: 0.995,
            seed: self.ransac_seed ^ pair.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = StitchConfig::default();
        assert_eq!(c.match_confidence_threshold, 0.5);
        assert_eq!(c.bundle_adjustment_max_iterations, 100);
        assert_eq!(c.blend_mode, BlendMode::MultiBand);
        assert_eq!(c.seam_strategy, SeamStrategy::GraphCut);
        assert_eq!(c.exposure, ExposureMode::Gain);
        assert_eq!(c.registration_max_dimension, Some(1000));
        assert_eq!(c.projection, Projection::Cylindrical);
        assert!(c.wave_correction);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let c = StitchConfig::from_json(r#"{"blend_mode": "Feather", "max_features": 300}"#).unwrap();
        assert_eq!(c.blend_mode, BlendMode::Feather);
        assert_eq!(c.max_features, 300);
        assert_eq!(c.match_ratio, 0.8);
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let c = StitchConfig::default()
            .with_exposure(ExposureMode::ChannelGains)
            .with_threads(Some(2));
        let back = StitchConfig::from_json(&c.to_json().unwrap()).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StitchConfig::from_json(r#"{"match_ratio": 1.5}"#).is_err());
        assert!(StitchConfig::from_json(r#"{"threads": 0}"#).is_err());
        assert!(StitchConfig::from_json("not json").is_err());
    }

    #[test]
    fn zero_multiband_levels_is_rejected() {
        let err = StitchConfig::default().with_multiband_levels(0).validate();
        assert!(matches!(err, Err(StitchErrorKind::InvalidConfig(m)) if m.contains("multiband_levels")));
        assert!(StitchConfig::from_json(r#"{"multiband_levels": 0}"#).is_err());
        assert!(StitchConfig::default().with_multiband_levels(1).validate().is_ok());
    }

    #[test]
    fn projection_parses_from_json() {
        let c = StitchConfig::from_json(r#"{"projection": "Plane", "wave_correction": false}"#).unwrap();
        assert_eq!(c.projection, Projection::Plane);
        assert!(!c.wave_correction);
    }

    #[test]
    fn builders_feed_derived_stage_configs() {
        let c = StitchConfig::default()
            .with_match_confidence_threshold(0.3)
            .with_max_features(500)
            .with_registration_max_dimension(None)
            .with_ransac(2.0, 750, 99);
        assert_eq!(c.match_confidence_threshold, 0.3);
        assert!(c.validate().is_ok());

        let extractor = c.extractor_config();
        assert_eq!(extractor.max_features, 500);
        assert_eq!(extractor.registration_max_dimension, None);

        let ransac = c.ransac_config(0, 1);
        assert_eq!(ransac.threshold, 2.0);
        assert_eq!(ransac.max_iterations, 750);
        assert_ne!(ransac.seed, c.ransac_config(0, 2).seed);
    }

    #[test]
    fn min_inliers_never_below_four() {
        assert_eq!(StitchConfig::default().with_min_inliers(2).effective_min_inliers(), 4);
    }

    #[test]
    fn ransac_seed_differs_per_pair() {
        let c = StitchConfig::default();
        assert_ne!(c.ransac_config(0, 1).seed, c.ransac_config(0, 2).seed);
        assert_eq!(c.ransac_config(1, 2).seed, c.ransac_config(1, 2).seed);
    }
}
