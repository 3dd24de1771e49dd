use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use lincore::data::interval::ChannelRange;
use lincore::data::spectrum::ReductionGroup;

use crate::cluster::FeaturePoint;
use crate::config::MaskingConfig;
use crate::validate::{ClusterValidation, SkyGrid, SubCluster};

/// Singular-value cutoffs tried when the design matrix is ill-conditioned,
/// relative to the largest singular value.
const EPSILON_GRID: [f64; 8] = [1e-11, 1e-10, 1e-9, 1e-8, 1e-7, 1e-6, 1e-5, 1e-4];

/// A fit is rejected when even the best cutoff leaves this mean relative
/// residual.
const MAX_REL_RESIDUAL: f64 = 0.5;

const MAX_REFINE_ITER: usize = 3;

/// One fitting sample: the merged channel extent of one row's detections
/// at its sky position, as offsets from the sample centroid.
#[derive(Clone, Debug)]
pub struct FitSample {
    pub x: f64,
    pub y: f64,
    pub chan_min: f64,
    pub chan_max: f64,
    pub active: bool,
}

/// Fitted polynomial pair predicting the low and high channel bounds as
/// functions of sky position. `x0`/`y0` restore the centering applied to
/// the samples, so `eval` takes absolute degrees.
#[derive(Clone, Debug)]
pub struct Surface2D {
    pub xorder: usize,
    pub yorder: usize,
    x0: f64,
    y0: f64,
    coef_min: Vec<f64>,
    coef_max: Vec<f64>,
}

impl Surface2D {
    /// Predicted (chan_min, chan_max) at a sky position in degrees.
    pub fn eval(&self, ra: f64, dec: f64) -> (f64, f64) {
        let x = ra - self.x0;
        let y = dec - self.y0;
        let mut lo = 0.0f64;
        let mut hi = 0.0f64;
        let mut idx = 0;
        let mut xp = 1.0f64;
        for _ in 0..=self.xorder {
            let mut yp = 1.0f64;
            for _ in 0..=self.yorder {
                lo += self.coef_min[idx] * xp * yp;
                hi += self.coef_max[idx] * xp * yp;
                idx += 1;
                yp *= y;
            }
            xp *= x;
        }
        (lo, hi)
    }
}

/// Explicit fit result; degeneracy is a value, not an exception.
pub enum FitOutcome {
    Solved(Surface2D),
    Singular,
}

/// Fit attrition counters for the diagnostics bundle.
#[derive(Clone, Copy, Debug, Default)]
pub struct FitStats {
    pub fitted: usize,
    pub singular: usize,
}

/// Fit every retained sub-cluster and evaluate the surfaces into per-row
/// protection-mask contributions. Sub-clusters are independent and run in
/// parallel; one row may collect contributions from several clusters, the
/// mask merger unions them later.
pub fn fit_and_evaluate(
    validations: &[ClusterValidation],
    points: &[FeaturePoint],
    grid: &SkyGrid,
    group: &ReductionGroup,
    config: &MaskingConfig,
) -> (Vec<(usize, ChannelRange)>, FitStats) {
    let subs: Vec<&SubCluster> = validations
        .iter()
        .filter(|v| v.valid)
        .flat_map(|v| v.sub_clusters.iter())
        .collect();

    let results: Vec<Option<Vec<(usize, ChannelRange)>>> = subs
        .par_iter()
        .map(|&sc| {
            fit_sub_cluster(sc, points, group, config)
                .map(|surface| evaluate_sub_cluster(&surface, sc, grid, group, config))
        })
        .collect();

    let mut stats = FitStats::default();
    let mut contributions = Vec::new();
    for r in results {
        match r {
            Some(mut c) => {
                stats.fitted += 1;
                contributions.append(&mut c);
            }
            None => stats.singular += 1,
        }
    }
    (contributions, stats)
}

/// Fit one sub-cluster, reducing the polynomial orders stepwise on
/// degeneracy. `None` means unfittable at every order, which drops the
/// sub-cluster without touching any row's mask.
pub fn fit_sub_cluster(
    sc: &SubCluster,
    points: &[FeaturePoint],
    group: &ReductionGroup,
    config: &MaskingConfig,
) -> Option<Surface2D> {
    let (mut samples, x0, y0) = collect_samples(sc, points, group);
    if samples.is_empty() {
        return None;
    }

    // adaptive order: one less than the distinct grid positions on each
    // axis, capped at 5
    let nx = sc.cells.iter().map(|&(ix, _)| ix).unique().count();
    let ny = sc.cells.iter().map(|&(_, iy)| iy).unique().count();
    let mut xorder = nx.saturating_sub(1).min(5);
    let mut yorder = ny.saturating_sub(1).min(5);

    loop {
        match fit_with_refinement(&mut samples, xorder, yorder, config.nsigma, x0, y0) {
            FitOutcome::Solved(surface) => return Some(surface),
            FitOutcome::Singular => {
                if xorder == 0 && yorder == 0 {
                    log::debug!(
                        "sub-cluster of cluster {} unfittable at every order, dropping",
                        sc.cluster_id
                    );
                    return None;
                }
                xorder = xorder.saturating_sub(1);
                yorder = yorder.saturating_sub(1);
                for s in samples.iter_mut() {
                    s.active = true; // clipping restarts with the new order
                }
            }
        }
    }
}

/// Merge same-row detections into one (chan_min, chan_max) per row and
/// center the sky coordinates on the sample centroid. Returns the samples
/// and the centroid they are relative to.
fn collect_samples(
    sc: &SubCluster,
    points: &[FeaturePoint],
    group: &ReductionGroup,
) -> (Vec<FitSample>, f64, f64) {
    let mut per_row: FxHashMap<usize, (f64, f64)> = FxHashMap::default();
    for &pi in &sc.point_indices {
        let p = &points[pi];
        let lo = p.range.start as f64;
        let hi = p.range.end as f64;
        per_row
            .entry(p.row_idx)
            .and_modify(|(a, b)| {
                *a = a.min(lo);
                *b = b.max(hi);
            })
            .or_insert((lo, hi));
    }
    if per_row.is_empty() {
        return (Vec::new(), 0.0, 0.0);
    }

    let x0 = per_row
        .keys()
        .map(|&r| group.rows[r].position.ra_deg)
        .sum::<f64>()
        / per_row.len() as f64;
    let y0 = per_row
        .keys()
        .map(|&r| group.rows[r].position.dec_deg)
        .sum::<f64>()
        / per_row.len() as f64;

    let mut rows: Vec<usize> = per_row.keys().copied().collect();
    rows.sort_unstable();
    let samples = rows
        .iter()
        .map(|&r| {
            let (lo, hi) = per_row[&r];
            let p = group.rows[r].position;
            FitSample {
                x: p.ra_deg - x0,
                y: p.dec_deg - y0,
                chan_min: lo,
                chan_max: hi,
                active: true,
            }
        })
        .collect();
    (samples, x0, y0)
}

/// One fit at fixed orders with up to three sigma-clipped refinement
/// passes. Each design matrix is decomposed once; the decomposition serves
/// both right-hand sides and the whole cutoff search.
fn fit_with_refinement(
    samples: &mut [FitSample],
    xorder: usize,
    yorder: usize,
    nsigma: f64,
    x0: f64,
    y0: f64,
) -> FitOutcome {
    let mut last_flagged = usize::MAX;
    let mut surface: Option<Surface2D> = None;

    for _ in 0..MAX_REFINE_ITER {
        let active: Vec<usize> = (0..samples.len()).filter(|&i| samples[i].active).collect();
        let s = match solve_once(samples, &active, xorder, yorder, x0, y0) {
            FitOutcome::Solved(s) => s,
            FitOutcome::Singular => return FitOutcome::Singular,
        };

        // residuals in (center, width) space
        let resid: Vec<f64> = active
            .iter()
            .map(|&i| {
                let (plo, phi) = s.eval(samples[i].x + x0, samples[i].y + y0);
                let pc = 0.5 * (plo + phi);
                let pw = phi - plo;
                let oc = 0.5 * (samples[i].chan_min + samples[i].chan_max);
                let ow = samples[i].chan_max - samples[i].chan_min;
                ((pc - oc) * (pc - oc) + (pw - ow) * (pw - ow)).sqrt()
            })
            .collect();

        let thr = if resid.len() == 1 {
            2.0 * resid[0]
        } else {
            let (m, sd) = lincore::algorithm::smoothing::mean_std(&resid);
            m + nsigma * sd
        };

        let newly_flagged: Vec<usize> = active
            .iter()
            .zip(&resid)
            .filter(|(_, &r)| r > thr)
            .map(|(&i, _)| i)
            .collect();

        surface = Some(s);
        if newly_flagged.is_empty() || newly_flagged.len() == last_flagged {
            break; // converged, or the clip count cycles
        }
        last_flagged = newly_flagged.len();
        for i in newly_flagged {
            samples[i].active = false;
        }
    }

    match surface {
        Some(s) => FitOutcome::Solved(s),
        None => FitOutcome::Singular,
    }
}

/// SVD least-squares solve of both polynomials, searching the singular
/// value cutoff that minimizes the mean relative residual.
fn solve_once(
    samples: &[FitSample],
    active: &[usize],
    xorder: usize,
    yorder: usize,
    x0: f64,
    y0: f64,
) -> FitOutcome {
    let ncoef = (xorder + 1) * (yorder + 1);
    if active.len() < ncoef {
        return FitOutcome::Singular;
    }

    let nrow = active.len();
    let mut a = DMatrix::<f64>::zeros(nrow, ncoef);
    for (r, &i) in active.iter().enumerate() {
        let mut col = 0;
        let mut xp = 1.0f64;
        for _ in 0..=xorder {
            let mut yp = 1.0f64;
            for _ in 0..=yorder {
                a[(r, col)] = xp * yp;
                col += 1;
                yp *= samples[i].y;
            }
            xp *= samples[i].x;
        }
    }
    let b_min = DVector::<f64>::from_iterator(nrow, active.iter().map(|&i| samples[i].chan_min));
    let b_max = DVector::<f64>::from_iterator(nrow, active.iter().map(|&i| samples[i].chan_max));

    let svd = a.clone().svd(true, true);
    let sv_max = svd.singular_values.iter().copied().fold(0.0f64, f64::max);
    if !(sv_max > 0.0) {
        return FitOutcome::Singular;
    }

    let mut best: Option<(f64, Vec<f64>, Vec<f64>)> = None;
    for &eps in &EPSILON_GRID {
        let cut = eps * sv_max;
        let sol_min = match svd.solve(&b_min, cut) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let sol_max = match svd.solve(&b_max, cut) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let res = mean_relative_residual(&a, &sol_min, &b_min)
            .max(mean_relative_residual(&a, &sol_max, &b_max));
        if !res.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |(r, _, _)| res < *r) {
            best = Some((
                res,
                sol_min.iter().copied().collect(),
                sol_max.iter().copied().collect(),
            ));
        }
    }

    match best {
        Some((res, coef_min, coef_max)) if res <= MAX_REL_RESIDUAL => FitOutcome::Solved(Surface2D {
            xorder,
            yorder,
            x0,
            y0,
            coef_min,
            coef_max,
        }),
        _ => FitOutcome::Singular,
    }
}

fn mean_relative_residual(a: &DMatrix<f64>, solution: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let pred = a * solution;
    let mut acc = 0.0f64;
    for i in 0..b.len() {
        acc += (pred[i] - b[i]).abs() / b[i].abs().max(1.0);
    }
    acc / b.len() as f64
}

/// Evaluate a fitted surface into protection-mask contributions.
///
/// Rows in the component's own cells are evaluated at their true position;
/// rows in blur cells are evaluated at the center of the nearest component
/// cell, never at the extrapolated query position. Positions whose fitted
/// width falls below the detection floor emit nothing.
pub fn evaluate_sub_cluster(
    surface: &Surface2D,
    sc: &SubCluster,
    grid: &SkyGrid,
    group: &ReductionGroup,
    config: &MaskingConfig,
) -> Vec<(usize, ChannelRange)> {
    let mut out = Vec::new();

    for &(ix, iy) in &sc.cells {
        for &row in &grid.cell_rows[grid.plane_index(ix, iy)] {
            let p = group.rows[row].position;
            let (lo, hi) = surface.eval(p.ra_deg, p.dec_deg);
            if let Some(range) = mask_from_fit(lo, hi, group.nchan, config) {
                out.push((row, range));
            }
        }
    }

    for &(bx, by) in &sc.blur_cells {
        let nearest = sc
            .cells
            .iter()
            .min_by(|&&(ax, ay), &&(cx, cy)| {
                let da = dist2(ax, ay, bx, by);
                let dc = dist2(cx, cy, bx, by);
                da.partial_cmp(&dc).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied();
        let (nx, ny) = match nearest {
            Some(c) => c,
            None => continue,
        };
        let center = grid.cell_center(nx, ny);
        let (lo, hi) = surface.eval(center.ra_deg, center.dec_deg);
        if let Some(range) = mask_from_fit(lo, hi, group.nchan, config) {
            for &row in &grid.cell_rows[grid.plane_index(bx, by)] {
                out.push((row, range));
            }
        }
    }

    out
}

#[inline]
fn dist2(ax: usize, ay: usize, bx: usize, by: usize) -> f64 {
    let dx = ax as f64 - bx as f64;
    let dy = ay as f64 - by as f64;
    dx * dx + dy * dy
}

/// Convert a fitted (chan_min, chan_max) into a protection range with the
/// width-dependent allowance, linearly interpolated between
/// `2 * MinFWHM + 10` at the detection floor and `MaxFWHM` at the ceiling.
fn mask_from_fit(lo: f64, hi: f64, nchan: usize, config: &MaskingConfig) -> Option<ChannelRange> {
    let width = hi - lo;
    if width < config.min_fwhm as f64 {
        return None;
    }
    let center = 0.5 * (lo + hi);
    let min_f = config.min_fwhm as f64;
    let max_f = config.max_fwhm as f64;
    let t = ((width - min_f) / (max_f - min_f)).clamp(0.0, 1.0);
    let allowance = (1.0 - t) * (2.0 * min_f + 10.0) + t * max_f;

    let start = (center - 0.5 * allowance).round().max(0.0) as usize;
    let end = ((center + 0.5 * allowance).round() as usize).min(nchan.saturating_sub(1));
    if end < start || nchan == 0 {
        return None;
    }
    Some(ChannelRange::new(start, end))
}
