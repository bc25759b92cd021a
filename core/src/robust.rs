//! Robust Estimation Module
//!
//! Provides a generic RANSAC implementation that can be used for any model estimation task.
//! Sampling uses a seeded RNG so repeated runs on the same data give the same model.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use std::marker::PhantomData;

/// Configuration for robust estimation
#[derive(Debug, Clone)]
pub struct RobustConfig {
    pub threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RobustConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0x5eed_cafe,
        }
    }
}

/// Result of robust estimation
#[derive(Debug, Clone)]
pub struct RobustResult<M> {
    pub model: Option<M>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub residual: f64,
    pub iterations: usize,
}

impl<M> RobustResult<M> {
    fn empty(n: usize) -> Self {
        Self {
            model: None,
            inliers: vec![false; n],
            num_inliers: 0,
            residual: f64::INFINITY,
            iterations: 0,
        }
    }
}

/// Trait for models that can be estimated robustly
pub trait RobustModel<D> {
    type Model: Clone;

    /// Minimum number of data points required to estimate the model
    fn min_sample_size(&self) -> usize;

    /// Estimate model from a sample (minimal or not)
    fn estimate(&self, data: &[&D]) -> Option<Self::Model>;

    /// Compute error for a single data point against the model
    fn compute_error(&self, model: &Self::Model, data: &D) -> f64;

    /// Reject samples that cannot produce a well-posed model.
    fn is_degenerate(&self, _sample: &[&D]) -> bool {
        false
    }
}

/// Generic RANSAC engine
pub struct Ransac<D, M: RobustModel<D>> {
    config: RobustConfig,
    _phantom: PhantomData<(D, M)>,
}

impl<D, M: RobustModel<D>> Ransac<D, M> {
    pub fn new(config: RobustConfig) -> Self {
        Self {
            config,
            _phantom: PhantomData,
        }
    }

    pub fn run(&self, estimator: &M, data: &[D]) -> RobustResult<M::Model> {
        let n = data.len();
        let k = estimator.min_sample_size();

        if n < k || k == 0 {
            return RobustResult::empty(n);
        }

        let mut best = RobustResult::empty(n);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut required = self.config.max_iterations;
        let mut iteration = 0;

        while iteration < required.min(self.config.max_iterations) {
            iteration += 1;

            let sample: Vec<&D> = sample(&mut rng, n, k).iter().map(|i| &data[i]).collect();
            if estimator.is_degenerate(&sample) {
                continue;
            }
            let Some(model) = estimator.estimate(&sample) else {
                continue;
            };

            let (inliers, num_inliers, residual) =
                score(estimator, &model, data, self.config.threshold);

            if num_inliers > best.num_inliers
                || (num_inliers == best.num_inliers && num_inliers > 0 && residual < best.residual)
            {
                best = RobustResult {
                    model: Some(model),
                    inliers,
                    num_inliers,
                    residual,
                    iterations: iteration,
                };
                required = adaptive_iterations(num_inliers, n, k, self.config.confidence);
            }
        }

        best.iterations = iteration;
        best
    }
}

/// Classify every datum against `model`; returns the inlier mask, count and
/// mean inlier error.
pub fn score<D, M: RobustModel<D>>(
    estimator: &M,
    model: &M::Model,
    data: &[D],
    threshold: f64,
) -> (Vec<bool>, usize, f64) {
    let mut inliers = vec![false; data.len()];
    let mut num_inliers = 0;
    let mut total_error = 0.0;

    for (j, d) in data.iter().enumerate() {
        let err = estimator.compute_error(model, d);
        if err < threshold {
            inliers[j] = true;
            num_inliers += 1;
            total_error += err;
        }
    }

    let residual = if num_inliers > 0 {
        total_error / num_inliers as f64
    } else {
        f64::INFINITY
    };
    (inliers, num_inliers, residual)
}

/// Number of iterations needed to draw one all-inlier sample with the given
/// confidence.
fn adaptive_iterations(num_inliers: usize, n: usize, k: usize, confidence: f64) -> usize {
    let w = num_inliers as f64 / n as f64;
    let p_good = w.powi(k as i32);
    if p_good >= 1.0 - f64::EPSILON {
        return 1;
    }
    if p_good <= f64::EPSILON {
        return usize::MAX;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    if needed.is_finite() {
        needed.ceil().max(1.0) as usize
    } else {
        usize::MAX
    }
}
