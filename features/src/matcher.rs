use cv_core::{Descriptor, Descriptors, FeatureMatch, Matches};
use rayon::prelude::*;

/// Brute-force Hamming matcher with optional ratio test and cross check.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    cross_check: bool,
    ratio_threshold: Option<f32>,
}

/// Best and second best neighbour of one query descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbours {
    pub best: usize,
    pub best_distance: u32,
    pub second_distance: Option<u32>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cross_check(mut self) -> Self {
        self.cross_check = true;
        self
    }

    pub fn with_ratio_test(mut self, threshold: f32) -> Self {
        self.ratio_threshold = Some(threshold);
        self
    }

    /// Matches from `query` into `train`, ordered by query index.
    pub fn match_descriptors(&self, query: &Descriptors, train: &Descriptors) -> Matches {
        if query.is_empty() || train.is_empty() {
            return Matches::new();
        }

        let forward = knn2(query, train);
        let backward = if self.cross_check {
            Some(knn2(train, query))
        } else {
            None
        };

        let mut matches = Matches::with_capacity(forward.len());
        for (query_idx, nn) in forward.iter().enumerate() {
            let Some(nn) = nn else { continue };

            if let (Some(ratio), Some(second)) = (self.ratio_threshold, nn.second_distance) {
                if nn.best_distance as f32 >= ratio * second as f32 {
                    continue;
                }
            }

            if let Some(backward) = &backward {
                if backward[nn.best].map(|b| b.best) != Some(query_idx) {
                    continue;
                }
            }

            matches.push(FeatureMatch::new(query_idx, nn.best, nn.best_distance as f32));
        }
        matches
    }
}

/// Two nearest neighbours for every query descriptor. Equal distances keep
/// the lower train index.
pub fn knn2(query: &Descriptors, train: &Descriptors) -> Vec<Option<Neighbours>> {
    query
        .descriptors
        .par_iter()
        .map(|q| nearest_two(q, &train.descriptors))
        .collect()
}

fn nearest_two(q: &Descriptor, train: &[Descriptor]) -> Option<Neighbours> {
    let mut best: Option<(usize, u32)> = None;
    let mut second: Option<u32> = None;

    for (idx, t) in train.iter().enumerate() {
        let d = q.hamming_distance(t);
        match best {
            Some((_, bd)) if d >= bd => {
                if second.map_or(true, |s| d < s) {
                    second = Some(d);
                }
            }
            Some((_, bd)) => {
                second = Some(bd);
                best = Some((idx, d));
            }
            None => best = Some((idx, d)),
        }
    }

    best.map(|(best, best_distance)| Neighbours {
        best,
        best_distance,
        second_distance: second,
    })
}

/// Ratio-tested, cross-checked Hamming matching.
pub fn match_descriptors(query: &Descriptors, train: &Descriptors, ratio: f32) -> Matches {
    Matcher::new()
        .with_ratio_test(ratio)
        .with_cross_check()
        .match_descriptors(query, train)
}
