use nalgebra::Point2;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    pub size: f64,
    pub angle: f64,
    pub response: f64,
    pub octave: i32,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            size: 1.0,
            angle: -1.0,
            response: 0.0,
            octave: 0,
        }
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_response(mut self, response: f64) -> Self {
        self.response = response;
        self
    }

    pub fn with_octave(mut self, octave: i32) -> Self {
        self.octave = octave;
        self
    }

    /// Strongest response first, then top-to-bottom, left-to-right.
    pub fn response_order(&self, other: &KeyPoint) -> Ordering {
        other
            .response
            .total_cmp(&self.response)
            .then(self.y.total_cmp(&other.y))
            .then(self.x.total_cmp(&other.x))
    }

    pub fn pt(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

impl Default for KeyPoint {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// A descriptor correspondence between a query set and a train set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

impl FeatureMatch {
    pub fn new(query_idx: usize, train_idx: usize, distance: f32) -> Self {
        Self {
            query_idx,
            train_idx,
            distance,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matches {
    pub matches: Vec<FeatureMatch>,
}

impl Matches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            matches: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, m: FeatureMatch) {
        self.matches.push(m);
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureMatch> {
        self.matches.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyPoints {
    pub keypoints: Vec<KeyPoint>,
}

impl KeyPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kp: KeyPoint) {
        self.keypoints.push(kp);
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyPoint> {
        self.keypoints.iter()
    }

    /// Sort by descending response, breaking ties by position so the order
    /// does not depend on detection order.
    pub fn sort_by_response(&mut self) {
        self.keypoints.sort_by(KeyPoint::response_order);
    }
}
