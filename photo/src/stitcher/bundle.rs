//! Levenberg-Marquardt refinement of the component cameras.
//!
//! Two models share one solver:
//!
//! * planar: every non-reference image contributes 8 parameters (its
//!   homography with `h33 = 1`) and the residual of a correspondence is the
//!   distance between its two ends after both are mapped into the reference
//!   frame;
//! * rotational: every image contributes its focal length and every
//!   non-reference image a rotation update, and the residual is the
//!   difference of the two unit rays scaled by the focal lengths.

use super::camera::CameraModel;
use super::config::StitchConfig;
use super::error::StitchErrorKind;
use super::graph::Component;
use super::pairwise::PairMatch;
use super::rotation::{camera_ray, RotationCamera};
use cv_core::PROJECTIVE_EPS;
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Rotation3, SMatrix, Vector2, Vector3};
use tracing::{debug, warn};

const PARAMS: usize = 8;
/// Smallest eigenvalue of the column-scaled normal matrix below which a
/// parameter counts as unconstrained.
const MIN_SCALED_EIGENVALUE: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e12;

type Block = SMatrix<f64, 2, PARAMS>;

/// Diagnostics of one refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleReport {
    pub iterations: usize,
    pub observations: usize,
    /// Root mean square transfer error (px) before refinement.
    pub initial_rms: f64,
    pub final_rms: f64,
    pub converged: bool,
}

/// One correspondence between slot `a` and slot `b` of the component.
#[derive(Debug, Clone, Copy)]
struct Observation {
    a: usize,
    b: usize,
    pa: Point2<f64>,
    pb: Point2<f64>,
}

/// Evenly spaced inliers of every component edge, at most `max_per_edge`
/// each.
fn collect_observations(component: &Component, edges: &[PairMatch], max_per_edge: usize) -> Vec<Observation> {
    let mut observations = Vec::new();
    for &ei in &component.edges {
        let e = &edges[ei];
        let (Some(a), Some(b)) = (component.slot(e.src), component.slot(e.dst)) else {
            continue;
        };
        let n = e.inliers.len();
        let take = n.min(max_per_edge.max(1));
        for k in 0..take {
            let c = &e.inliers[k * n / take];
            observations.push(Observation {
                a,
                b,
                pa: c.src_pt,
                pb: c.dst_pt,
            });
        }
    }
    observations
}

/// Sum-of-squares problem over a flat parameter vector.
trait LeastSquares {
    fn num_observations(&self) -> usize;

    /// `None` when the parameters leave the model's domain.
    fn cost(&self, params: &DVector<f64>) -> Option<f64>;

    /// Normal equations `J^T J`, `J^T r` and the cost.
    fn linearize(&self, params: &DVector<f64>) -> Option<(DMatrix<f64>, DVector<f64>, f64)>;

    /// Human readable name of parameter `index`.
    fn parameter_name(&self, index: usize) -> String;
}

struct HomographyProblem {
    /// Parameter block of each slot, `None` for the reference.
    blocks: Vec<Option<usize>>,
    observations: Vec<Observation>,
    num_free: usize,
}

impl HomographyProblem {
    fn new(component: &Component, edges: &[PairMatch], cameras: &[CameraModel], max_per_edge: usize) -> Self {
        let mut blocks = Vec::with_capacity(cameras.len());
        let mut num_free = 0;
        for cam in cameras {
            if cam.is_reference {
                blocks.push(None);
            } else {
                blocks.push(Some(num_free));
                num_free += 1;
            }
        }

        Self {
            blocks,
            observations: collect_observations(component, edges, max_per_edge),
            num_free,
        }
    }

    fn to_parameters(&self, homographies: &[Matrix3<f64>]) -> DVector<f64> {
        let mut params = DVector::zeros(self.num_free * PARAMS);
        for (slot, block) in self.blocks.iter().enumerate() {
            let Some(b) = block else { continue };
            let h = homographies[slot];
            let o = b * PARAMS;
            params[o] = h[(0, 0)];
            params[o + 1] = h[(0, 1)];
            params[o + 2] = h[(0, 2)];
            params[o + 3] = h[(1, 0)];
            params[o + 4] = h[(1, 1)];
            params[o + 5] = h[(1, 2)];
            params[o + 6] = h[(2, 0)];
            params[o + 7] = h[(2, 1)];
        }
        params
    }

    fn from_parameters(&self, params: &DVector<f64>) -> Vec<Matrix3<f64>> {
        self.blocks
            .iter()
            .map(|block| match block {
                None => Matrix3::identity(),
                Some(b) => {
                    let o = b * PARAMS;
                    Matrix3::new(
                        params[o],
                        params[o + 1],
                        params[o + 2],
                        params[o + 3],
                        params[o + 4],
                        params[o + 5],
                        params[o + 6],
                        params[o + 7],
                        1.0,
                    )
                }
            })
            .collect()
    }

    /// Sum of squared residuals; `None` if a point maps to infinity.
    fn transfer_cost(&self, homographies: &[Matrix3<f64>]) -> Option<f64> {
        let mut total = 0.0;
        for obs in &self.observations {
            let (qa, _) = project(&homographies[obs.a], &obs.pa)?;
            let (qb, _) = project(&homographies[obs.b], &obs.pb)?;
            total += (qa - qb).norm_squared();
        }
        total.is_finite().then_some(total)
    }

    fn normal_equations(&self, homographies: &[Matrix3<f64>]) -> Option<(DMatrix<f64>, DVector<f64>, f64)> {
        let n = self.num_free * PARAMS;
        let mut jtj = DMatrix::zeros(n, n);
        let mut jtr = DVector::zeros(n);
        let mut cost = 0.0;

        for obs in &self.observations {
            let (qa, ja) = project(&homographies[obs.a], &obs.pa)?;
            let (qb, jb) = project(&homographies[obs.b], &obs.pb)?;
            let r = qa - qb;
            cost += r.norm_squared();

            let terms = [
                (self.blocks[obs.a], ja),
                (self.blocks[obs.b], -jb),
            ];
            for &(bi, ji) in &terms {
                let Some(bi) = bi else { continue };
                let mut g = jtr.fixed_rows_mut::<PARAMS>(bi * PARAMS);
                g += ji.transpose() * r;
                for &(bj, jj) in &terms {
                    let Some(bj) = bj else { continue };
                    let mut blk = jtj.fixed_view_mut::<PARAMS, PARAMS>(bi * PARAMS, bj * PARAMS);
                    blk += ji.transpose() * jj;
                }
            }
        }

        cost.is_finite().then_some((jtj, jtr, cost))
    }
}

impl LeastSquares for HomographyProblem {
    fn num_observations(&self) -> usize {
        self.observations.len()
    }

    fn cost(&self, params: &DVector<f64>) -> Option<f64> {
        self.transfer_cost(&self.from_parameters(params))
    }

    fn linearize(&self, params: &DVector<f64>) -> Option<(DMatrix<f64>, DVector<f64>, f64)> {
        self.normal_equations(&self.from_parameters(params))
    }

    fn parameter_name(&self, index: usize) -> String {
        format!("homography parameter {} of image block {}", index % PARAMS, index / PARAMS)
    }
}

/// Map `p` through `h`, returning the image point and its derivative with
/// respect to the 8 free entries of `h`.
fn project(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<(Vector2<f64>, Block)> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() <= PROJECTIVE_EPS || !v.z.is_finite() {
        return None;
    }
    let iw = 1.0 / v.z;
    let qx = v.x * iw;
    let qy = v.y * iw;
    let (x, y) = (p.x, p.y);

    #[rustfmt::skip]
    let j = Block::from_row_slice(&[
        x * iw, y * iw, iw, 0.0, 0.0, 0.0, -qx * x * iw, -qx * y * iw,
        0.0, 0.0, 0.0, x * iw, y * iw, iw, -qy * x * iw, -qy * y * iw,
    ]);
    Some((Vector2::new(qx, qy), j))
}

fn solve(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    match a.clone().cholesky() {
        Some(chol) => Some(chol.solve(b)),
        None => a.lu().solve(b),
    }
}

/// Reject problems where some parameter is not constrained by the data.
fn check_conditioning(jtj: &DMatrix<f64>, name: impl Fn(usize) -> String) -> Result<(), StitchErrorKind> {
    let n = jtj.nrows();
    let mut scale = DVector::zeros(n);
    for i in 0..n {
        let d = jtj[(i, i)];
        if d <= 0.0 || !d.is_finite() {
            return Err(StitchErrorKind::degenerate(format!("{} is unconstrained", name(i))));
        }
        scale[i] = 1.0 / d.sqrt();
    }
    let scaled = DMatrix::from_fn(n, n, |r, c| jtj[(r, c)] * scale[r] * scale[c]);
    let smallest = scaled.symmetric_eigenvalues().min();
    if smallest < MIN_SCALED_EIGENVALUE {
        return Err(StitchErrorKind::degenerate(format!(
            "alignment is under-determined (scaled eigenvalue {smallest:.3e})"
        )));
    }
    Ok(())
}

/// How a Levenberg-Marquardt run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// The step fell below the relative tolerance.
    Converged,
    /// No damping up to `MAX_LAMBDA` produced a cheaper step.
    Stalled,
    IterationCap,
}

struct Solution {
    params: DVector<f64>,
    iterations: usize,
    initial_cost: f64,
    cost: f64,
    termination: Termination,
}

fn levenberg_marquardt<P: LeastSquares>(
    problem: &P,
    start: DVector<f64>,
    max_iterations: usize,
    eps: f64,
) -> Result<Solution, StitchErrorKind> {
    let mut params = start;
    let (mut jtj, mut jtr, mut cost) = problem
        .linearize(&params)
        .ok_or_else(|| StitchErrorKind::numerical("initial alignment error is not finite"))?;
    let initial_cost = cost;

    if params.is_empty() {
        return Ok(Solution {
            params,
            iterations: 0,
            initial_cost,
            cost,
            termination: Termination::Converged,
        });
    }
    check_conditioning(&jtj, |i| problem.parameter_name(i))?;

    let mut lambda = 1e-3;
    let mut iterations = 0;
    let mut termination = Termination::IterationCap;

    while iterations < max_iterations {
        iterations += 1;

        let mut a = jtj.clone();
        for i in 0..a.nrows() {
            a[(i, i)] += lambda * jtj[(i, i)];
        }
        let Some(delta) = solve(a, &(-&jtr)) else {
            lambda *= 10.0;
            if lambda > MAX_LAMBDA {
                termination = Termination::Stalled;
                break;
            }
            continue;
        };

        if delta.norm() <= eps * (params.norm() + eps) {
            termination = Termination::Converged;
            break;
        }

        let candidate = &params + &delta;
        match problem.cost(&candidate) {
            Some(new_cost) if new_cost < cost => {
                let Some((j, g, c)) = problem.linearize(&candidate) else {
                    lambda *= 10.0;
                    continue;
                };
                params = candidate;
                jtj = j;
                jtr = g;
                cost = c;
                lambda = (lambda / 10.0).max(1e-12);
            }
            _ => {
                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    termination = Termination::Stalled;
                    break;
                }
            }
        }
    }

    Ok(Solution {
        params,
        iterations,
        initial_cost,
        cost,
        termination,
    })
}

fn report(solution: &Solution, observations: usize) -> BundleReport {
    let rms = |cost: f64| (cost / observations.max(1) as f64).sqrt();
    let report = BundleReport {
        iterations: solution.iterations,
        observations,
        initial_rms: rms(solution.initial_cost),
        final_rms: rms(solution.cost),
        converged: solution.termination == Termination::Converged,
    };
    match solution.termination {
        Termination::Converged => debug!(
            iterations = report.iterations,
            initial_rms = report.initial_rms,
            final_rms = report.final_rms,
            "bundle adjustment converged"
        ),
        Termination::Stalled => warn!(
            iterations = report.iterations,
            final_rms = report.final_rms,
            "bundle adjustment stalled, no damped step reduces the error"
        ),
        Termination::IterationCap => warn!(
            iterations = report.iterations,
            final_rms = report.final_rms,
            "bundle adjustment hit the iteration cap"
        ),
    }
    report
}

/// Refine planar `cameras` (ordered like `component.nodes`) in place.
pub fn bundle_adjust(
    component: &Component,
    edges: &[PairMatch],
    cameras: &mut [CameraModel],
    config: &StitchConfig,
) -> Result<BundleReport, StitchErrorKind> {
    let problem = HomographyProblem::new(component, edges, cameras, config.ba_max_points_per_edge);
    let start: Vec<Matrix3<f64>> = cameras.iter().map(|c| c.homography).collect();
    let solution = levenberg_marquardt(
        &problem,
        problem.to_parameters(&start),
        config.bundle_adjustment_max_iterations,
        config.bundle_adjustment_epsilon,
    )?;

    for (cam, h) in cameras.iter_mut().zip(problem.from_parameters(&solution.params)) {
        if !h.iter().all(|v| v.is_finite()) || h.try_inverse().is_none() {
            return Err(StitchErrorKind::numerical(format!(
                "refined homography of image {} is not invertible",
                cam.image
            )));
        }
        cam.homography = h;
    }
    Ok(report(&solution, problem.num_observations()))
}

/// RMS transfer error of `cameras` over every component edge.
pub fn transfer_rms(component: &Component, edges: &[PairMatch], cameras: &[CameraModel], max_per_edge: usize) -> Option<f64> {
    let problem = HomographyProblem::new(component, edges, cameras, max_per_edge);
    let hs: Vec<Matrix3<f64>> = cameras.iter().map(|c| c.homography).collect();
    let cost = problem.transfer_cost(&hs)?;
    Some((cost / problem.observations.len().max(1) as f64).sqrt())
}

/// Parameter layout of one rotating camera: its focal at `offset`, followed
/// by a 3-vector rotation update unless it is the reference.
#[derive(Debug, Clone, Copy)]
struct RayBlock {
    offset: usize,
    rotates: bool,
}

impl RayBlock {
    fn len(&self) -> usize {
        if self.rotates {
            4
        } else {
            1
        }
    }
}

struct RayProblem {
    /// Rotation each update is applied to.
    base: Vec<Matrix3<f64>>,
    principal: Vec<Point2<f64>>,
    blocks: Vec<RayBlock>,
    observations: Vec<Observation>,
    num_params: usize,
}

impl RayProblem {
    fn new(component: &Component, edges: &[PairMatch], cameras: &[RotationCamera], max_per_edge: usize) -> Self {
        let mut blocks = Vec::with_capacity(cameras.len());
        let mut offset = 0;
        for cam in cameras {
            let block = RayBlock {
                offset,
                rotates: !cam.is_reference,
            };
            offset += block.len();
            blocks.push(block);
        }
        Self {
            base: cameras.iter().map(|c| c.rotation).collect(),
            principal: cameras.iter().map(|c| c.principal_point).collect(),
            blocks,
            observations: collect_observations(component, edges, max_per_edge),
            num_params: offset,
        }
    }

    fn to_parameters(&self, cameras: &[RotationCamera]) -> DVector<f64> {
        let mut params = DVector::zeros(self.num_params);
        for (block, cam) in self.blocks.iter().zip(cameras) {
            params[block.offset] = cam.focal;
        }
        params
    }

    fn local<'p>(&self, params: &'p DVector<f64>, slot: usize) -> &'p [f64] {
        let block = self.blocks[slot];
        &params.as_slice()[block.offset..block.offset + block.len()]
    }

    /// Focal and rotation of `slot` from its parameter block.
    fn camera(&self, slot: usize, local: &[f64]) -> (f64, Matrix3<f64>) {
        let rotation = if self.blocks[slot].rotates {
            let update = Rotation3::new(Vector3::new(local[1], local[2], local[3]));
            update.matrix() * self.base[slot]
        } else {
            self.base[slot]
        };
        (local[0], rotation)
    }

    fn residual(&self, obs: &Observation, a: &(f64, Matrix3<f64>), b: &(f64, Matrix3<f64>)) -> Option<Vector3<f64>> {
        let ((fa, ra), (fb, rb)) = (a, b);
        if *fa <= 0.0 || *fb <= 0.0 || !fa.is_finite() || !fb.is_finite() {
            return None;
        }
        let xa = camera_ray(*fa, &self.principal[obs.a], ra, &obs.pa);
        let xb = camera_ray(*fb, &self.principal[obs.b], rb, &obs.pb);
        let r = (fa * fb).sqrt() * (xa - xb);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }
}

/// Central difference step for entry `k` of a camera block.
fn difference_step(k: usize, local: &[f64]) -> f64 {
    if k == 0 {
        1e-4 * local[0].abs().max(1.0)
    } else {
        1e-6
    }
}

impl LeastSquares for RayProblem {
    fn num_observations(&self) -> usize {
        self.observations.len()
    }

    fn cost(&self, params: &DVector<f64>) -> Option<f64> {
        let cameras: Vec<(f64, Matrix3<f64>)> = (0..self.blocks.len())
            .map(|slot| self.camera(slot, self.local(params, slot)))
            .collect();
        let mut total = 0.0;
        for obs in &self.observations {
            total += self.residual(obs, &cameras[obs.a], &cameras[obs.b])?.norm_squared();
        }
        total.is_finite().then_some(total)
    }

    /// Central differences, local to the two cameras of each observation.
    fn linearize(&self, params: &DVector<f64>) -> Option<(DMatrix<f64>, DVector<f64>, f64)> {
        let n = self.num_params;
        let mut jtj = DMatrix::zeros(n, n);
        let mut jtr = DVector::zeros(n);
        let mut cost = 0.0;

        let cameras: Vec<(f64, Matrix3<f64>)> = (0..self.blocks.len())
            .map(|slot| self.camera(slot, self.local(params, slot)))
            .collect();

        for obs in &self.observations {
            let r = self.residual(obs, &cameras[obs.a], &cameras[obs.b])?;
            cost += r.norm_squared();

            let mut columns: Vec<(usize, Vector3<f64>)> = Vec::with_capacity(8);
            for (slot, is_b) in [(obs.a, false), (obs.b, true)] {
                let block = self.blocks[slot];
                let base = self.local(params, slot);
                for k in 0..block.len() {
                    let h = difference_step(k, base);
                    let mut plus = base.to_vec();
                    let mut minus = base.to_vec();
                    plus[k] += h;
                    minus[k] -= h;
                    let (cp, cm) = (self.camera(slot, &plus), self.camera(slot, &minus));
                    let (rp, rm) = if is_b {
                        (
                            self.residual(obs, &cameras[obs.a], &cp)?,
                            self.residual(obs, &cameras[obs.a], &cm)?,
                        )
                    } else {
                        (
                            self.residual(obs, &cp, &cameras[obs.b])?,
                            self.residual(obs, &cm, &cameras[obs.b])?,
                        )
                    };
                    columns.push((block.offset + k, (rp - rm) / (2.0 * h)));
                }
            }

            for &(i, ji) in &columns {
                jtr[i] += ji.dot(&r);
                for &(j, jj) in &columns {
                    jtj[(i, j)] += ji.dot(&jj);
                }
            }
        }

        cost.is_finite().then_some((jtj, jtr, cost))
    }

    fn parameter_name(&self, index: usize) -> String {
        let slot = self
            .blocks
            .iter()
            .rposition(|b| b.offset <= index)
            .unwrap_or(0);
        match index - self.blocks[slot].offset {
            0 => format!("focal length of image block {slot}"),
            k => format!("rotation axis {} of image block {slot}", k - 1),
        }
    }
}

/// Refine focal lengths and rotations of `cameras` (ordered like
/// `component.nodes`) in place. The reference keeps its rotation.
pub fn bundle_adjust_rays(
    component: &Component,
    edges: &[PairMatch],
    cameras: &mut [RotationCamera],
    config: &StitchConfig,
) -> Result<BundleReport, StitchErrorKind> {
    let problem = RayProblem::new(component, edges, cameras, config.ba_max_points_per_edge);
    let solution = levenberg_marquardt(
        &problem,
        problem.to_parameters(cameras),
        config.bundle_adjustment_max_iterations,
        config.bundle_adjustment_epsilon,
    )?;

    for (slot, cam) in cameras.iter_mut().enumerate() {
        let (focal, rotation) = problem.camera(slot, problem.local(&solution.params, slot));
        if focal <= 0.0 || !focal.is_finite() || !rotation.iter().all(|v| v.is_finite()) {
            return Err(StitchErrorKind::numerical(format!(
                "refined camera of image {} is invalid (focal {focal})",
                cam.image
            )));
        }
        cam.focal = focal;
        cam.rotation = rotation;
    }
    Ok(report(&solution, problem.num_observations()))
}

/// RMS ray error (px at the cameras' focal lengths) over every component
/// edge.
pub fn ray_rms(component: &Component, edges: &[PairMatch], cameras: &[RotationCamera], max_per_edge: usize) -> Option<f64> {
    let problem = RayProblem::new(component, edges, cameras, max_per_edge);
    let cost = problem.cost(&problem.to_parameters(cameras))?;
    Some((cost / problem.observations.len().max(1) as f64).sqrt())
}
