use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use lincore::data::spectrum::{ReductionGroup, SkyPosition};

use crate::cluster::{ClusteringOutcome, FeaturePoint};
use crate::config::MaskingConfig;

/// Regular sky tiling covering the group's valid pointings. Cell indices
/// are `(ix, iy)` with RA along x (scaled by cos dec) and DEC along y;
/// planes over the grid are row-major `iy * nra + ix`.
#[derive(Clone, Debug)]
pub struct SkyGrid {
    pub nra: usize,
    pub ndec: usize,
    ra0: f64,
    dec0: f64,
    step_ra: f64,
    step_dec: f64,
    /// Spectra per cell.
    pub member_count: Vec<usize>,
    /// Cell of every arena row; `None` for flagged-invalid rows.
    pub row_cell: Vec<Option<(usize, usize)>>,
    /// Arena rows per cell.
    pub cell_rows: Vec<Vec<usize>>,
}

impl SkyGrid {
    pub fn build(group: &ReductionGroup, spacing_deg: f64) -> SkyGrid {
        let valid = group.valid_indices();
        if valid.is_empty() {
            return SkyGrid {
                nra: 0,
                ndec: 0,
                ra0: 0.0,
                dec0: 0.0,
                step_ra: spacing_deg,
                step_dec: spacing_deg,
                member_count: Vec::new(),
                row_cell: vec![None; group.len()],
                cell_rows: Vec::new(),
            };
        }

        let mut ra_lo = f64::INFINITY;
        let mut ra_hi = f64::NEG_INFINITY;
        let mut dec_lo = f64::INFINITY;
        let mut dec_hi = f64::NEG_INFINITY;
        for &i in &valid {
            let p = group.rows[i].position;
            ra_lo = ra_lo.min(p.ra_deg);
            ra_hi = ra_hi.max(p.ra_deg);
            dec_lo = dec_lo.min(p.dec_deg);
            dec_hi = dec_hi.max(p.dec_deg);
        }
        let dec_mid = 0.5 * (dec_lo + dec_hi);
        let step_dec = spacing_deg;
        let step_ra = spacing_deg / dec_mid.to_radians().cos().max(1e-6);

        let nra = ((ra_hi - ra_lo) / step_ra).floor() as usize + 1;
        let ndec = ((dec_hi - dec_lo) / step_dec).floor() as usize + 1;

        let mut grid = SkyGrid {
            nra,
            ndec,
            ra0: ra_lo,
            dec0: dec_lo,
            step_ra,
            step_dec,
            member_count: vec![0; nra * ndec],
            row_cell: vec![None; group.len()],
            cell_rows: vec![Vec::new(); nra * ndec],
        };
        for &i in &valid {
            let p = group.rows[i].position;
            let ix = (((p.ra_deg - ra_lo) / step_ra) as usize).min(nra - 1);
            let iy = (((p.dec_deg - dec_lo) / step_dec) as usize).min(ndec - 1);
            grid.row_cell[i] = Some((ix, iy));
            let idx = grid.plane_index(ix, iy);
            grid.member_count[idx] += 1;
            grid.cell_rows[idx].push(i);
        }
        grid
    }

    #[inline]
    pub fn plane_index(&self, ix: usize, iy: usize) -> usize {
        iy * self.nra + ix
    }

    #[inline]
    pub fn ncells(&self) -> usize {
        self.nra * self.ndec
    }

    /// Sky position of a cell center.
    pub fn cell_center(&self, ix: usize, iy: usize) -> SkyPosition {
        SkyPosition::new(
            self.ra0 + (ix as f64 + 0.5) * self.step_ra,
            self.dec0 + (iy as f64 + 0.5) * self.step_dec,
        )
    }
}

/// Occupancy planes of the four validation stages, kept for the QA side
/// channel. `final_plane` is the binary marginal cut before isolation
/// pruning.
#[derive(Clone, Debug, Serialize)]
pub struct StagePlanes {
    pub nra: usize,
    pub ndec: usize,
    pub detection: Vec<f64>,
    pub validation: Vec<f64>,
    pub smoothing: Vec<f64>,
    pub final_plane: Vec<bool>,
}

impl StagePlanes {
    fn zeroed(nra: usize, ndec: usize) -> Self {
        StagePlanes {
            nra,
            ndec,
            detection: vec![0.0; nra * ndec],
            validation: vec![0.0; nra * ndec],
            smoothing: vec![0.0; nra * ndec],
            final_plane: vec![false; nra * ndec],
        }
    }
}

/// One spatially connected component of a cluster's validated plane,
/// independently fitted downstream.
#[derive(Clone, Debug)]
pub struct SubCluster {
    pub cluster_id: usize,
    pub cells: Vec<(usize, usize)>,
    /// Dilated neighborhood cells outside `cells`; masks there are
    /// evaluated at the nearest valid cell, never extrapolated.
    pub blur_cells: Vec<(usize, usize)>,
    /// Feature-point indices contributing to this component.
    pub point_indices: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct ClusterValidation {
    pub cluster_id: usize,
    pub valid: bool,
    pub planes: StagePlanes,
    pub sub_clusters: Vec<SubCluster>,
}

/// Run the four-stage occupancy validation for every cluster.
pub fn validate_clusters(
    grid: &SkyGrid,
    points: &[FeaturePoint],
    outcome: &ClusteringOutcome,
    config: &MaskingConfig,
) -> Vec<ClusterValidation> {
    (0..outcome.ncluster())
        .into_par_iter()
        .map(|cid| validate_one(grid, points, outcome, config, cid))
        .collect()
}

fn validate_one(
    grid: &SkyGrid,
    points: &[FeaturePoint],
    outcome: &ClusteringOutcome,
    config: &MaskingConfig,
    cid: usize,
) -> ClusterValidation {
    let (nra, ndec) = (grid.nra, grid.ndec);
    let mut planes = StagePlanes::zeroed(nra, ndec);
    let mut result = ClusterValidation {
        cluster_id: cid,
        valid: false,
        planes: StagePlanes::zeroed(nra, ndec),
        sub_clusters: Vec::new(),
    };
    if grid.ncells() == 0 {
        return result;
    }

    let member_points: Vec<usize> = (0..points.len())
        .filter(|&i| outcome.category[i] == Some(cid) && outcome.is_member[i])
        .collect();

    // stage 1: detection counts, half-weight for binned detections, max
    // across binning variants so one line seen at two binnings counts once
    let mut per_bin: FxHashMap<(usize, usize), f64> = FxHashMap::default();
    for &i in &member_points {
        if let Some((ix, iy)) = grid.row_cell[points[i].row_idx] {
            let w = if points[i].binning > 1 { 0.5 } else { 1.0 };
            *per_bin.entry((grid.plane_index(ix, iy), points[i].binning)).or_insert(0.0) += w;
        }
    }
    for (&(idx, _), &v) in &per_bin {
        planes.detection[idx] = planes.detection[idx].max(v);
    }

    // stage 2: normalize by spectra per cell
    for idx in 0..grid.ncells() {
        let mc = grid.member_count[idx];
        planes.validation[idx] = if mc == 0 {
            0.0
        } else {
            let v = planes.detection[idx] / mc as f64;
            if mc == 1 && v > 0.9 {
                1.0
            } else {
                v
            }
        };
    }
    if !planes
        .validation
        .iter()
        .any(|&v| v > config.threshold_questionable)
    {
        result.planes = planes;
        return result;
    }

    // stage 3: inverse-squared-distance smoothing, doubled
    for iy in 0..ndec {
        for ix in 0..nra {
            let mut acc = 0.0f64;
            let mut norm = 0.0f64;
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let jx = ix as i64 + dx;
                    let jy = iy as i64 + dy;
                    if jx < 0 || jy < 0 || jx >= nra as i64 || jy >= ndec as i64 {
                        continue;
                    }
                    let w = if dx == 0 && dy == 0 {
                        6.0
                    } else {
                        1.0 / (dx * dx + dy * dy) as f64
                    };
                    acc += w * planes.validation[grid.plane_index(jx as usize, jy as usize)];
                    norm += w;
                }
            }
            planes.smoothing[grid.plane_index(ix, iy)] =
                if norm > 0.0 { 2.0 * acc / norm } else { 0.0 };
        }
    }
    if !planes
        .smoothing
        .iter()
        .any(|&v| v > config.threshold_questionable)
    {
        result.planes = planes;
        return result;
    }

    // stage 4: marginal cut, connected components, isolation pruning
    for idx in 0..grid.ncells() {
        planes.final_plane[idx] = planes.smoothing[idx] > config.threshold_marginal;
    }
    let components = connected_components(&planes.final_plane, nra, ndec);
    if components.is_empty() {
        result.planes = planes;
        return result;
    }

    let max_size = components.iter().map(|c| c.len()).max().unwrap_or(0);
    let keep_limit = (0.5 * max_size as f64).min(3.0);
    let mut sub_clusters = Vec::new();
    for cells in components {
        if (cells.len() as f64) < keep_limit {
            continue;
        }
        if cells.len() == 1 {
            let (ix, iy) = cells[0];
            if grid.member_count[grid.plane_index(ix, iy)] < 2 {
                continue;
            }
        }
        let cell_set: FxHashSet<(usize, usize)> = cells.iter().copied().collect();
        let point_indices: Vec<usize> = member_points
            .iter()
            .copied()
            .filter(|&i| {
                grid.row_cell[points[i].row_idx]
                    .map_or(false, |c| cell_set.contains(&c))
            })
            .collect();
        if point_indices.is_empty() {
            continue;
        }
        let blur_cells = blur_dilation(&cells, nra, ndec, config.blur_ratio);
        sub_clusters.push(SubCluster {
            cluster_id: cid,
            cells,
            blur_cells,
            point_indices,
        });
    }

    result.valid = !sub_clusters.is_empty();
    result.planes = planes;
    result.sub_clusters = sub_clusters;
    result
}

/// 8-connected components of a binary plane, flood-filled with an explicit
/// stack.
fn connected_components(plane: &[bool], nra: usize, ndec: usize) -> Vec<Vec<(usize, usize)>> {
    let mut seen = vec![false; plane.len()];
    let mut out = Vec::new();
    for iy in 0..ndec {
        for ix in 0..nra {
            let idx = iy * nra + ix;
            if !plane[idx] || seen[idx] {
                continue;
            }
            let mut cells = Vec::new();
            let mut stack = vec![(ix, iy)];
            seen[idx] = true;
            while let Some((cx, cy)) = stack.pop() {
                cells.push((cx, cy));
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let jx = cx as i64 + dx;
                        let jy = cy as i64 + dy;
                        if jx < 0 || jy < 0 || jx >= nra as i64 || jy >= ndec as i64 {
                            continue;
                        }
                        let j = jy as usize * nra + jx as usize;
                        if plane[j] && !seen[j] {
                            seen[j] = true;
                            stack.push((jx as usize, jy as usize));
                        }
                    }
                }
            }
            out.push(cells);
        }
    }
    out
}

/// Disk dilation of a component: cells within
/// `sqrt(area / pi) * blur_ratio + 1.5` of any component cell, minus the
/// component itself.
fn blur_dilation(
    cells: &[(usize, usize)],
    nra: usize,
    ndec: usize,
    blur_ratio: f64,
) -> Vec<(usize, usize)> {
    let radius = (cells.len() as f64 / std::f64::consts::PI).sqrt() * blur_ratio + 1.5;
    let r = radius.ceil() as i64;
    let r2 = radius * radius;
    let cell_set: FxHashSet<(usize, usize)> = cells.iter().copied().collect();
    let mut blur: FxHashSet<(usize, usize)> = FxHashSet::default();
    for &(cx, cy) in cells {
        for dy in -r..=r {
            for dx in -r..=r {
                if (dx * dx + dy * dy) as f64 > r2 {
                    continue;
                }
                let jx = cx as i64 + dx;
                let jy = cy as i64 + dy;
                if jx < 0 || jy < 0 || jx >= nra as i64 || jy >= ndec as i64 {
                    continue;
                }
                let cell = (jx as usize, jy as usize);
                if !cell_set.contains(&cell) {
                    blur.insert(cell);
                }
            }
        }
    }
    let mut out: Vec<(usize, usize)> = blur.into_iter().collect();
    out.sort_unstable();
    out
}
