//! Two-view matching and geometric verification.

use super::config::StitchConfig;
use cv_core::invert_homography;
use cv_features::{estimate_homography, match_descriptors, ImageFeatures, MatchPair};
use nalgebra::{Matrix3, Point2};
use rayon::prelude::*;
use tracing::debug;

/// Determinants outside this range are treated as singular or mirrored.
const DET_RANGE: (f64, f64) = (1e-6, 1e6);

/// One verified keypoint correspondence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub src_idx: usize,
    pub dst_idx: usize,
    pub src_pt: Point2<f64>,
    pub dst_pt: Point2<f64>,
}

/// Verified relation between two images of a run.
///
/// `src` and `dst` index the run's usable images with `src < dst` in
/// `(ImageId, position)` order; `homography` maps `src` pixels to `dst`
/// pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PairMatch {
    pub src: usize,
    pub dst: usize,
    pub homography: Matrix3<f64>,
    pub inliers: Vec<Correspondence>,
    pub num_candidates: usize,
    pub confidence: f64,
}

impl PairMatch {
    pub fn new(
        src: usize,
        dst: usize,
        homography: Matrix3<f64>,
        inliers: Vec<Correspondence>,
        num_candidates: usize,
    ) -> Self {
        let confidence = if num_candidates == 0 {
            0.0
        } else {
            inliers.len() as f64 / num_candidates as f64
        };
        Self {
            src,
            dst,
            homography,
            inliers,
            num_candidates,
            confidence,
        }
    }

    /// Transform taking `from` pixels to `to` pixels.
    pub fn homography_between(&self, from: usize, to: usize) -> Option<Matrix3<f64>> {
        if from == self.src && to == self.dst {
            Some(self.homography)
        } else if from == self.dst && to == self.src {
            invert_homography(&self.homography)
        } else {
            None
        }
    }
}

/// Order two image positions canonically.
pub fn canonical_pair<K: Ord + Copy>(keys: &[K], a: usize, b: usize) -> (usize, usize) {
    if (keys[a], a) <= (keys[b], b) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Match and verify images `a` and `b`. The result is the same whichever
/// order they are given in.
pub fn match_pair<K: Ord + Copy>(
    features: &[ImageFeatures],
    keys: &[K],
    a: usize,
    b: usize,
    config: &StitchConfig,
) -> Option<PairMatch> {
    if a == b {
        return None;
    }
    let (src, dst) = canonical_pair(keys, a, b);
    let fs = &features[src];
    let fd = &features[dst];
    let min_inliers = config.effective_min_inliers();

    let matches = match_descriptors(&fs.descriptors, &fd.descriptors, config.match_ratio);
    if matches.len() < min_inliers {
        debug!(src, dst, candidates = matches.len(), "too few candidate matches");
        return None;
    }

    let pairs: Vec<MatchPair> = matches
        .iter()
        .map(|m| {
            MatchPair::new(
                fs.keypoints.keypoints[m.query_idx].pt(),
                fd.keypoints.keypoints[m.train_idx].pt(),
            )
        })
        .collect();

    let result = estimate_homography(&pairs, &config.ransac_config(src, dst));
    let homography = result.model?;
    if result.num_inliers < min_inliers {
        debug!(src, dst, inliers = result.num_inliers, "too few inliers");
        return None;
    }

    let det = homography.determinant();
    if !det.is_finite() || det < DET_RANGE.0 || det > DET_RANGE.1 {
        debug!(src, dst, det, "rejecting singular or mirrored homography");
        return None;
    }

    let inliers: Vec<Correspondence> = matches
        .iter()
        .zip(&pairs)
        .zip(&result.inliers)
        .filter(|(_, &inlier)| inlier)
        .map(|((m, p), _)| Correspondence {
            src_idx: m.query_idx,
            dst_idx: m.train_idx,
            src_pt: p.src,
            dst_pt: p.dst,
        })
        .collect();

    let pair = PairMatch::new(src, dst, homography, inliers, matches.len());
    debug!(
        src,
        dst,
        candidates = pair.num_candidates,
        inliers = pair.inliers.len(),
        confidence = pair.confidence,
        "pair verified"
    );
    Some(pair)
}

/// Verified matches of every unordered pair, in `(src, dst)` order.
pub fn match_all_pairs<K: Ord + Copy + Sync>(
    features: &[ImageFeatures],
    keys: &[K],
    config: &StitchConfig,
) -> Vec<PairMatch> {
    let n = features.len();
    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| canonical_pair(keys, i, j)))
        .collect();

    let mut matches: Vec<PairMatch> = pairs
        .par_iter()
        .filter_map(|&(a, b)| match_pair(features, keys, a, b, config))
        .collect();
    matches.sort_by_key(|m| (m.src, m.dst));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cv_core::translation;

    fn shifted_pair() -> PairMatch {
        PairMatch::new(0, 1, translation(-30.0, 4.0), Vec::new(), 10)
    }

    #[test]
    fn homography_between_inverts_for_reverse_direction() {
        let m = shifted_pair();
        let fwd = m.homography_between(0, 1).unwrap();
        let back = m.homography_between(1, 0).unwrap();
        assert_relative_eq!(fwd * back, Matrix3::identity(), epsilon = 1e-12);
        assert!(m.homography_between(0, 2).is_none());
    }

    #[test]
    fn confidence_is_inlier_ratio() {
        let c = Correspondence {
            src_idx: 0,
            dst_idx: 0,
            src_pt: Point2::new(0.0, 0.0),
            dst_pt: Point2::new(0.0, 0.0),
        };
        let m = PairMatch::new(0, 1, Matrix3::identity(), vec![c; 6], 8);
        assert_relative_eq!(m.confidence, 0.75);
        assert_eq!(PairMatch::new(0, 1, Matrix3::identity(), vec![], 0).confidence, 0.0);
    }

    #[test]
    fn canonical_pair_orders_by_key_then_position() {
        let keys = [5u32, 2, 2];
        assert_eq!(canonical_pair(&keys, 0, 1), (1, 0));
        assert_eq!(canonical_pair(&keys, 2, 1), (1, 2));
    }
}
