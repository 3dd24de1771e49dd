use lincore::algorithm::linefind::{find_lines, LineFinderError, LineFinderParams};
use lincore::algorithm::smoothing::{bin_spectrum, binning_schedule};
use lincore::data::interval::ChannelRange;
use lincore::data::spectrum::ReductionGroup;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::MaskingConfig;
use crate::progress::ProgressObserver;

/// One detected line candidate with its binning provenance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCandidate {
    pub range: ChannelRange,
    pub binning: usize,
}

/// Detection output for one row. An empty candidate list is the sentinel
/// "no detection" value and flows through all later stages unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowDetections {
    pub row_idx: usize,
    pub row_id: usize,
    pub candidates: Vec<LineCandidate>,
}

/// Run the line finder over every valid row of the group at every binning
/// factor of the schedule and assemble the per-row candidate map.
///
/// A non-empty predefined window short-circuits before any per-row work:
/// every row gets the window verbatim. Rows that are flagged invalid emit
/// the sentinel (empty) candidate list.
pub fn detect_lines(
    group: &ReductionGroup,
    config: &MaskingConfig,
    progress: &dyn ProgressObserver,
) -> Result<Vec<RowDetections>, LineFinderError> {
    let nchan = group.nchan;
    let nrow = group.len();

    // user override: no detection at all
    if !config.window.is_empty() {
        let candidates: Vec<LineCandidate> = config
            .window
            .iter()
            .map(|&range| LineCandidate { range, binning: 1 })
            .collect();
        return Ok(group
            .rows
            .iter()
            .enumerate()
            .map(|(idx, r)| RowDetections {
                row_idx: idx,
                row_id: r.row_id,
                candidates: candidates.clone(),
            })
            .collect());
    }

    // shared edge precondition, surfaced once for the whole group
    if config.edge.0 + config.edge.1 >= nchan {
        return Err(LineFinderError::InvalidEdgeConfiguration {
            left: config.edge.0,
            right: config.edge.1,
            nchan,
        });
    }

    if group.valid_indices().is_empty() {
        log::info!("no valid rows in reduction group, skipping line detection");
        return Ok(group
            .rows
            .iter()
            .enumerate()
            .map(|(idx, r)| RowDetections {
                row_idx: idx,
                row_id: r.row_id,
                candidates: Vec::new(),
            })
            .collect());
    }

    let schedule = if config.broadline {
        binning_schedule(nchan)
    } else {
        vec![1]
    };
    let params = config.line_finder_params();

    let out: Vec<RowDetections> = (0..nrow)
        .into_par_iter()
        .map(|idx| {
            let row = &group.rows[idx];
            let mut det = RowDetections {
                row_idx: idx,
                row_id: row.row_id,
                candidates: Vec::new(),
            };
            if !row.flag_valid || progress.is_cancelled() {
                return det;
            }
            det.candidates = detect_row(
                group.spectrum(idx),
                group.mask(idx),
                config,
                &params,
                &schedule,
            );
            progress.report("detect", idx + 1, nrow);
            det
        })
        .collect();

    Ok(out)
}

/// Search one spectrum at every binning factor and map candidates back to
/// native channels.
fn detect_row(
    spectrum: &[f32],
    mask: &[bool],
    config: &MaskingConfig,
    params: &LineFinderParams,
    schedule: &[usize],
) -> Vec<LineCandidate> {
    let nchan = spectrum.len();
    let usable = nchan - config.edge.0 - config.edge.1;
    let max_width = config.max_fwhm.min(usable / 3).max(1);
    let margin = (nchan as f64 * config.ignore_edge_fraction) as usize;

    let mut out: Vec<LineCandidate> = Vec::new();
    for &b in schedule {
        let (by, bm);
        let (y, m) = if b == 1 {
            (spectrum, mask)
        } else {
            let t = bin_spectrum(spectrum, mask, b);
            by = t.0;
            bm = t.1;
            (by.as_slice(), bm.as_slice())
        };
        let nbin = y.len();
        let edge_b = ((config.edge.0 + b - 1) / b, (config.edge.1 + b - 1) / b);
        if edge_b.0 + edge_b.1 >= nbin {
            continue;
        }

        // width limits are enforced in native channels below; at the binned
        // resolution only require a credible two-bin run
        let binned_params = LineFinderParams {
            min_fwhm: if b == 1 { params.min_fwhm } else { 2 },
            ..params.clone()
        };
        let found = match find_lines(y, m, edge_b, &binned_params) {
            Ok(f) => f,
            Err(_) => continue, // binned edge degenerate for this factor only
        };

        for r in found {
            let start = r.start * b;
            let end = (r.end * b + b - 1).min(nchan - 1);
            let native = ChannelRange::new(start, end);
            let w = native.width();
            if w < config.min_fwhm || w > max_width {
                continue;
            }
            if start < margin || end >= nchan - margin {
                continue;
            }
            out.push(LineCandidate {
                range: native,
                binning: b,
            });
        }
    }

    // identical ranges found at several binnings keep the finest one
    out.sort_by_key(|c| (c.range.start, c.range.end, c.binning));
    out.dedup_by_key(|c| c.range);
    out
}

/// Cross-row identity merge: rows observed at the same sky position (within
/// `radius_arcsec`) vet each other's candidates.
///
/// A candidate survives only if candidates of the same binning overlapping
/// it by at least 70% exist in at least `agreement_fraction` of the
/// co-located rows (the owning row counts). Groups smaller than three rows
/// are left untouched: the fraction threshold degenerates there, and the
/// grid validator still prunes isolated noise downstream.
pub fn clean_colocated_detections(
    detections: &[RowDetections],
    group: &ReductionGroup,
    radius_arcsec: f64,
    agreement_fraction: f64,
) -> Vec<RowDetections> {
    let groups = colocated_groups(group, radius_arcsec);

    let mut out: Vec<RowDetections> = detections.to_vec();
    for members in groups.iter().filter(|g| g.len() >= 3) {
        let need = agreement_fraction * members.len() as f64;
        let kept: Vec<Vec<LineCandidate>> = members
            .iter()
            .map(|&idx| {
                detections[idx]
                    .candidates
                    .iter()
                    .copied()
                    .filter(|cand| {
                        let agree = members
                            .iter()
                            .filter(|&&other| {
                                detections[other].candidates.iter().any(|c| {
                                    c.binning == cand.binning
                                        && c.range.overlap_fraction(&cand.range) >= 0.7
                                })
                            })
                            .count();
                        agree as f64 >= need
                    })
                    .collect()
            })
            .collect();
        for (&idx, candidates) in members.iter().zip(kept) {
            out[idx].candidates = candidates;
        }
    }
    out
}

/// Group arena indices of valid rows lying within `radius_arcsec` of each
/// other, using a spatial hash with cell size equal to the radius and a
/// 3x3 neighborhood probe. Flagged-invalid rows carry no detections and
/// must not dilute the agreement vote, so they stay out of every group.
fn colocated_groups(group: &ReductionGroup, radius_arcsec: f64) -> Vec<Vec<usize>> {
    let nrow = group.len();
    let valid = group.valid_indices();
    let mut cells: FxHashMap<(i64, i64), Vec<usize>> = FxHashMap::default();
    let key = |idx: usize| -> (i64, i64) {
        let p = group.rows[idx].position;
        let x = p.ra_deg * p.dec_deg.to_radians().cos() * 3600.0 / radius_arcsec;
        let y = p.dec_deg * 3600.0 / radius_arcsec;
        (x.floor() as i64, y.floor() as i64)
    };
    for &idx in &valid {
        cells.entry(key(idx)).or_default().push(idx);
    }

    // union-find over rows, linking pairs closer than the radius
    let mut parent: Vec<usize> = (0..nrow).collect();
    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        let mut r = i;
        while parent[r] != r {
            parent[r] = parent[parent[r]];
            r = parent[r];
        }
        r
    }
    for &idx in &valid {
        let (kx, ky) = key(idx);
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(neighbors) = cells.get(&(kx + dx, ky + dy)) {
                    for &other in neighbors {
                        if other <= idx {
                            continue;
                        }
                        let sep = group.rows[idx]
                            .position
                            .separation_arcsec(&group.rows[other].position);
                        if sep <= radius_arcsec {
                            let (a, b) = (find(&mut parent, idx), find(&mut parent, other));
                            if a != b {
                                parent[a] = b;
                            }
                        }
                    }
                }
            }
        }
    }

    let mut by_root: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for &idx in &valid {
        let root = find(&mut parent, idx);
        by_root.entry(root).or_default().push(idx);
    }
    let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
    groups.sort_by_key(|g| g[0]);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use lincore::data::spectrum::{SkyPosition, SpectrumRow};

    fn make_row(id: usize, ra_arcsec: f64, dec_arcsec: f64, time_group: u32) -> SpectrumRow {
        SpectrumRow {
            row_id: id,
            position: SkyPosition::new(ra_arcsec / 3600.0, dec_arcsec / 3600.0),
            flag_valid: true,
            time_group,
        }
    }

    fn flat_group(nrow: usize, nchan: usize) -> ReductionGroup {
        let mut g = ReductionGroup::new(nchan);
        for i in 0..nrow {
            g.push_row(
                make_row(i, i as f64 * 30.0, 0.0, 0),
                &vec![0.0; nchan],
                &vec![false; nchan],
            );
        }
        g
    }

    #[test]
    fn test_window_override_short_circuits() {
        let g = flat_group(3, 256);
        let mut cfg = MaskingConfig::default();
        cfg.window = vec![ChannelRange::new(10, 30)];
        let det = detect_lines(&g, &cfg, &NullProgress).unwrap();
        assert_eq!(det.len(), 3);
        for d in &det {
            assert_eq!(d.candidates.len(), 1);
            assert_eq!(d.candidates[0].range, ChannelRange::new(10, 30));
            assert_eq!(d.candidates[0].binning, 1);
        }
    }

    #[test]
    fn test_bad_edge_surfaced_once() {
        let g = flat_group(2, 128);
        let mut cfg = MaskingConfig::default();
        cfg.edge = (100, 28);
        assert!(matches!(
            detect_lines(&g, &cfg, &NullProgress),
            Err(LineFinderError::InvalidEdgeConfiguration { .. })
        ));
    }

    #[test]
    fn test_invalid_rows_emit_sentinel() {
        let mut g = ReductionGroup::new(256);
        let mut bad = make_row(0, 0.0, 0.0, 0);
        bad.flag_valid = false;
        let mut y = vec![0.0f32; 256];
        for c in 100..120 {
            y[c] = 50.0;
        }
        g.push_row(bad, &y, &vec![false; 256]);
        let det = detect_lines(&g, &MaskingConfig::default(), &NullProgress).unwrap();
        assert!(det[0].candidates.is_empty());
    }

    #[test]
    fn test_colocated_groups_split_by_distance() {
        let mut g = ReductionGroup::new(8);
        // three rows on one position (a 3-way time split), one far away
        for t in 0..3 {
            g.push_row(make_row(t, 100.0, 50.0, t as u32), &[0.0; 8], &[false; 8]);
        }
        g.push_row(make_row(3, 160.0, 50.0, 0), &[0.0; 8], &[false; 8]);
        let groups = colocated_groups(&g, 1.0);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![0, 1, 2]);
        assert_eq!(groups[1], vec![3]);
    }

    #[test]
    fn test_cleaning_drops_unsupported_candidate() {
        let mut g = ReductionGroup::new(64);
        for t in 0..3 {
            g.push_row(make_row(t, 0.0, 0.0, t as u32), &[0.0; 64], &[false; 64]);
        }
        let shared = LineCandidate {
            range: ChannelRange::new(20, 29),
            binning: 1,
        };
        let spurious = LineCandidate {
            range: ChannelRange::new(50, 55),
            binning: 1,
        };
        let det = vec![
            RowDetections { row_idx: 0, row_id: 0, candidates: vec![shared, spurious] },
            RowDetections { row_idx: 1, row_id: 1, candidates: vec![shared] },
            RowDetections { row_idx: 2, row_id: 2, candidates: vec![shared] },
        ];
        let cleaned = clean_colocated_detections(&det, &g, 1.0, 2.0 / 3.0);
        assert_eq!(cleaned[0].candidates, vec![shared]);
        assert_eq!(cleaned[1].candidates, vec![shared]);
    }

    #[test]
    fn test_cleaning_keeps_small_groups_untouched() {
        let mut g = ReductionGroup::new(64);
        for t in 0..2 {
            g.push_row(make_row(t, 0.0, 0.0, t as u32), &[0.0; 64], &[false; 64]);
        }
        let lone = LineCandidate {
            range: ChannelRange::new(10, 19),
            binning: 1,
        };
        let det = vec![
            RowDetections { row_idx: 0, row_id: 0, candidates: vec![lone] },
            RowDetections { row_idx: 1, row_id: 1, candidates: vec![] },
        ];
        let cleaned = clean_colocated_detections(&det, &g, 1.0, 2.0 / 3.0);
        assert_eq!(cleaned[0].candidates, vec![lone]);
    }
}
