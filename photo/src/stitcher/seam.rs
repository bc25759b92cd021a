//! Seam finding: assign every covered canvas pixel to exactly one image.

use super::config::SeamStrategy;
use super::maxflow::FlowGraph;
use super::warp::{Canvas, WarpedImage};
use cv_core::Rect;
use image::{GrayImage, Luma};
use rayon::prelude::*;
use tracing::debug;

/// Added to every cut cost so flat regions still prefer short seams.
const CUT_EPS: f64 = 1e-3;

/// Canvas-sized owner map; labels index the warped images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeamMask {
    pub width: u32,
    pub height: u32,
    pub labels: Vec<Option<u32>>,
}

impl SeamMask {
    pub fn label(&self, x: u32, y: u32) -> Option<u32> {
        self.labels[(y * self.width + x) as usize]
    }

    /// Owned pixels of image `index` inside `roi`, ROI-local (255 = owned).
    pub fn mask_for(&self, index: u32, roi: Rect) -> GrayImage {
        GrayImage::from_fn(roi.width, roi.height, |x, y| {
            let cx = roi.x + x as i64;
            let cy = roi.y + y as i64;
            let owned = cx >= 0
                && cy >= 0
                && (cx as u32) < self.width
                && (cy as u32) < self.height
                && self.label(cx as u32, cy as u32) == Some(index);
            Luma([if owned { 255 } else { 0 }])
        })
    }

    pub fn covered(&self) -> usize {
        self.labels.iter().filter(|l| l.is_some()).count()
    }
}

/// Covering image with the nearest warped centre; ties to the lower index.
fn nearest_centre(warped: &[WarpedImage], x: i64, y: i64, allowed: impl Fn(usize) -> bool) -> Option<u32> {
    let mut best: Option<(usize, f64)> = None;
    for (i, w) in warped.iter().enumerate() {
        if !allowed(i) || !w.covers(x, y) {
            continue;
        }
        let d = w.distance_to_centre(x, y);
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i as u32)
}

fn heuristic_seams(canvas: &Canvas, warped: &[WarpedImage]) -> SeamMask {
    let width = canvas.width();
    let mut labels = vec![None; canvas.width() as usize * canvas.height() as usize];
    labels
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, label) in row.iter_mut().enumerate() {
                *label = nearest_centre(warped, x as i64, y as i64, |_| true);
            }
        });
    SeamMask {
        width,
        height: canvas.height(),
        labels,
    }
}

/// Per-pixel colour difference of two samples, L1 over channels on a 0-3 scale.
fn colour_difference(a: [f32; 3], b: [f32; 3]) -> f64 {
    a.iter()
        .zip(&b)
        .map(|(x, y)| (*x as f64 - *y as f64).abs())
        .sum::<f64>()
        / 255.0
}

/// Shared pixels of images `i` and `j`, both still owning them.
struct Overlap {
    rect: Rect,
    /// Node index per rect pixel, `None` outside the overlap.
    nodes: Vec<Option<usize>>,
    pixels: Vec<(i64, i64)>,
    cost: Vec<f64>,
}

fn owns(owned: &GrayImage, roi: &Rect, x: i64, y: i64) -> bool {
    roi.contains(x, y) && owned.get_pixel((x - roi.x) as u32, (y - roi.y) as u32).0[0] != 0
}

fn disown(owned: &mut GrayImage, roi: &Rect, x: i64, y: i64) {
    owned.put_pixel((x - roi.x) as u32, (y - roi.y) as u32, Luma([0]));
}

fn find_overlap(warped: &[WarpedImage], owned: &[GrayImage], i: usize, j: usize) -> Option<Overlap> {
    let (a, b) = (&warped[i], &warped[j]);
    let rect = a.roi.intersect(&b.roi)?;
    let mut nodes = vec![None; rect.area() as usize];
    let mut pixels = Vec::new();
    let mut cost = Vec::new();
    for y in rect.y..rect.bottom() {
        for x in rect.x..rect.right() {
            if !(owns(&owned[i], &a.roi, x, y) && owns(&owned[j], &b.roi, x, y)) {
                continue;
            }
            let (Some(pa), Some(pb)) = (a.sample(x, y), b.sample(x, y)) else {
                continue;
            };
            nodes[((y - rect.y) * rect.width as i64 + (x - rect.x)) as usize] = Some(pixels.len());
            pixels.push((x, y));
            cost.push(colour_difference(pa, pb));
        }
    }
    (!pixels.is_empty()).then_some(Overlap {
        rect,
        nodes,
        pixels,
        cost,
    })
}

/// Min-cut between `i` (source) and `j` (sink) over their current overlap.
/// Returns, per overlap pixel, whether `i` keeps it.
fn cut_overlap(warped: &[WarpedImage], owned: &[GrayImage], i: usize, j: usize, ov: &Overlap) -> Vec<bool> {
    let n = ov.pixels.len();
    let (source, sink) = (n, n + 1);
    let mut graph = FlowGraph::new(n + 2);
    let node_at = |x: i64, y: i64| -> Option<usize> {
        if !ov.rect.contains(x, y) {
            return None;
        }
        ov.nodes[((y - ov.rect.y) * ov.rect.width as i64 + (x - ov.rect.x)) as usize]
    };

    for (p, &(x, y)) in ov.pixels.iter().enumerate() {
        for (dx, dy) in [(1i64, 0i64), (0, 1), (-1, 0), (0, -1)] {
            let (qx, qy) = (x + dx, y + dy);
            match node_at(qx, qy) {
                Some(q) => {
                    // each undirected link once
                    if dx > 0 || dy > 0 {
                        let c = ov.cost[p] + ov.cost[q] + CUT_EPS;
                        graph.add_edge(p, q, c, c);
                    }
                }
                None => {
                    let by_i = owns(&owned[i], &warped[i].roi, qx, qy);
                    let by_j = owns(&owned[j], &warped[j].roi, qx, qy);
                    let c = 2.0 * ov.cost[p] + CUT_EPS;
                    if by_i && !by_j {
                        graph.add_edge(source, p, c, 0.0);
                    } else if by_j && !by_i {
                        graph.add_edge(p, sink, c, 0.0);
                    }
                }
            }
        }
    }

    let flow = graph.max_flow(source, sink);
    let side = graph.min_cut_source_side(source);
    debug!(a = i, b = j, pixels = n, flow, "overlap cut");
    side[..n].to_vec()
}

fn graph_cut_seams(canvas: &Canvas, warped: &[WarpedImage]) -> SeamMask {
    let mut owned: Vec<GrayImage> = warped.iter().map(|w| w.mask.clone()).collect();

    for i in 0..warped.len() {
        for j in i + 1..warped.len() {
            let Some(ov) = find_overlap(warped, &owned, i, j) else {
                continue;
            };
            let keep_i = cut_overlap(warped, &owned, i, j, &ov);
            for (&(x, y), keep) in ov.pixels.iter().zip(keep_i) {
                if keep {
                    disown(&mut owned[j], &warped[j].roi, x, y);
                } else {
                    disown(&mut owned[i], &warped[i].roi, x, y);
                }
            }
        }
    }

    let width = canvas.width();
    let mut labels = vec![None; width as usize * canvas.height() as usize];
    labels
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for (x, label) in row.iter_mut().enumerate() {
                let x = x as i64;
                let mut owner = None;
                let mut owners = 0;
                for (k, w) in warped.iter().enumerate() {
                    if owns(&owned[k], &w.roi, x, y) {
                        owner = Some(k as u32);
                        owners += 1;
                    }
                }
                *label = if owners == 1 {
                    owner
                } else {
                    nearest_centre(warped, x, y, |k| owners == 0 || owns(&owned[k], &warped[k].roi, x, y))
                };
            }
        });

    SeamMask {
        width,
        height: canvas.height(),
        labels,
    }
}

/// Label every covered canvas pixel with one warped image.
pub fn find_seams(canvas: &Canvas, warped: &[WarpedImage], strategy: SeamStrategy) -> SeamMask {
    let mask = match strategy {
        SeamStrategy::Heuristic => heuristic_seams(canvas, warped),
        SeamStrategy::GraphCut => graph_cut_seams(canvas, warped),
    };
    debug!(?strategy, covered = mask.covered(), "seams found");
    mask
}
