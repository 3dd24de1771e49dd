use thiserror::Error;

use crate::algorithm::smoothing::{box_smooth, median_f32, robust_noise_mad};
use crate::data::interval::ChannelRange;

#[derive(Debug, Error)]
pub enum LineFinderError {
    #[error("edge mask ({left} + {right} channels) consumes the whole {nchan}-channel spectrum")]
    InvalidEdgeConfiguration {
        left: usize,
        right: usize,
        nchan: usize,
    },
}

/// Per-spectrum line-search parameters.
///
/// `threshold_snr` is in robust-sigma units per channel. `max_fwhm` is the
/// configured ceiling; the effective ceiling is further capped at one third
/// of the usable (edge-trimmed) bandwidth so a "line" can never swallow the
/// spectrum.
#[derive(Clone, Debug)]
pub struct LineFinderParams {
    pub threshold_snr: f32,
    pub min_fwhm: usize,
    pub max_fwhm: usize,
    pub smooth_half_width: usize,
    pub merge_gap_fraction: f64,
}

impl Default for LineFinderParams {
    fn default() -> Self {
        LineFinderParams {
            threshold_snr: 5.0,
            min_fwhm: 4,
            max_fwhm: 900,
            smooth_half_width: 2,
            merge_gap_fraction: 0.25,
        }
    }
}

impl LineFinderParams {
    /// Effective maximum width for an `nchan`-channel spectrum with the
    /// given edge trim.
    pub fn effective_max_fwhm(&self, nchan: usize, edge: (usize, usize)) -> usize {
        let usable = nchan.saturating_sub(edge.0 + edge.1);
        self.max_fwhm.min(usable / 3).max(1)
    }
}

/// Scan one spectrum for emission-line candidates.
///
/// Channels outside `[edge.0, nchan - edge.1)` and channels flagged in
/// `mask` are excluded both from the noise statistics and from any returned
/// range. Returns the surviving ranges sorted ascending; an empty vector
/// means no detection.
pub fn find_lines(
    spectrum: &[f32],
    mask: &[bool],
    edge: (usize, usize),
    params: &LineFinderParams,
) -> Result<Vec<ChannelRange>, LineFinderError> {
    let nchan = spectrum.len();
    assert_eq!(mask.len(), nchan, "spectrum/mask length mismatch");
    if edge.0 + edge.1 >= nchan {
        return Err(LineFinderError::InvalidEdgeConfiguration {
            left: edge.0,
            right: edge.1,
            nchan,
        });
    }

    let lo = edge.0;
    let hi = nchan - edge.1; // exclusive

    let valid: Vec<f32> = (lo..hi)
        .filter(|&c| !mask[c])
        .map(|c| spectrum[c])
        .collect();
    if valid.is_empty() {
        return Ok(Vec::new());
    }

    let baseline = median_f32(&valid);
    let noise = robust_noise_mad(&valid);
    if noise <= 0.0 {
        // flat or fully degenerate spectrum: nothing to detect against
        return Ok(Vec::new());
    }
    let cut = baseline + params.threshold_snr * noise;

    let smoothed = box_smooth(spectrum, params.smooth_half_width);

    // contiguous runs above threshold; masked channels break runs
    let mut runs: Vec<ChannelRange> = Vec::new();
    let mut open: Option<usize> = None;
    for c in lo..hi {
        let above = !mask[c] && smoothed[c] > cut;
        match (open, above) {
            (None, true) => open = Some(c),
            (Some(s), false) => {
                runs.push(ChannelRange::new(s, c - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(s) = open {
        runs.push(ChannelRange::new(s, hi - 1));
    }

    let merged = merge_close_runs(&runs, params.merge_gap_fraction);

    let max_fwhm = params.effective_max_fwhm(nchan, edge);
    Ok(merged
        .into_iter()
        .filter(|r| r.width() >= params.min_fwhm && r.width() <= max_fwhm)
        .collect())
}

/// Merge adjacent runs whose gap is smaller than `gap_fraction` of the
/// narrower run, so one broad line split by a few noisy channels stays one
/// candidate. Input must be sorted ascending and disjoint.
fn merge_close_runs(runs: &[ChannelRange], gap_fraction: f64) -> Vec<ChannelRange> {
    let mut out: Vec<ChannelRange> = Vec::with_capacity(runs.len());
    for &r in runs {
        if let Some(prev) = out.last_mut() {
            let gap = r.start - prev.end - 1;
            let limit = gap_fraction * prev.width().min(r.width()) as f64;
            if (gap as f64) < limit {
                prev.end = r.end;
                continue;
            }
        }
        out.push(r);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::distribution::Normal;

    fn noise_spectrum(n: usize, sigma: f64, seed: u64) -> Vec<f32> {
        use rand::distributions::Distribution;
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(0.0, sigma).unwrap();
        (0..n).map(|_| dist.sample(&mut rng) as f32).collect()
    }

    fn inject_gaussian(y: &mut [f32], center: f64, fwhm: f64, amp: f32) {
        let sigma = fwhm / 2.3548;
        for (c, v) in y.iter_mut().enumerate() {
            let d = (c as f64 - center) / sigma;
            *v += amp * (-0.5 * d * d).exp() as f32;
        }
    }

    #[test]
    fn test_invalid_edge_rejected() {
        let y = vec![0.0f32; 64];
        let m = vec![false; 64];
        let err = find_lines(&y, &m, (40, 24), &LineFinderParams::default());
        assert!(matches!(
            err,
            Err(LineFinderError::InvalidEdgeConfiguration { .. })
        ));
    }

    #[test]
    fn test_noise_only_gives_no_detection() {
        let y = noise_spectrum(1024, 1.0, 3);
        let m = vec![false; 1024];
        let found = find_lines(&y, &m, (8, 8), &LineFinderParams::default()).unwrap();
        assert!(found.is_empty(), "false detections: {:?}", found);
    }

    #[test]
    fn test_single_line_detected_with_bounds() {
        let mut y = noise_spectrum(1024, 1.0, 11);
        inject_gaussian(&mut y, 500.0, 20.0, 15.0);
        let m = vec![false; 1024];
        let params = LineFinderParams::default();
        let edge = (8, 8);
        let found = find_lines(&y, &m, edge, &params).unwrap();
        assert_eq!(found.len(), 1, "found: {:?}", found);
        let r = found[0];
        assert!(r.contains_channel(500));
        // property: width and edge bounds
        let max_fwhm = params.effective_max_fwhm(1024, edge);
        assert!(r.width() >= params.min_fwhm && r.width() <= max_fwhm);
        assert!(r.start >= edge.0 && r.end < 1024 - edge.1);
    }

    #[test]
    fn test_line_in_edge_region_ignored() {
        let mut y = noise_spectrum(1024, 1.0, 7);
        inject_gaussian(&mut y, 4.0, 10.0, 30.0);
        let m = vec![false; 1024];
        let found = find_lines(&y, &m, (16, 16), &LineFinderParams::default()).unwrap();
        assert!(found.is_empty(), "edge line leaked: {:?}", found);
    }

    #[test]
    fn test_masked_line_not_reported() {
        let mut y = noise_spectrum(1024, 1.0, 19);
        inject_gaussian(&mut y, 300.0, 16.0, 20.0);
        let mut m = vec![false; 1024];
        for c in 280..320 {
            m[c] = true;
        }
        let found = find_lines(&y, &m, (8, 8), &LineFinderParams::default()).unwrap();
        assert!(found.is_empty(), "masked line leaked: {:?}", found);
    }

    #[test]
    fn test_close_runs_merged() {
        let runs = vec![
            ChannelRange::new(100, 119),
            ChannelRange::new(122, 141), // gap 2 < 0.25 * 20
            ChannelRange::new(200, 219), // far away
        ];
        let merged = merge_close_runs(&runs, 0.25);
        assert_eq!(
            merged,
            vec![ChannelRange::new(100, 141), ChannelRange::new(200, 219)]
        );
    }

    #[test]
    fn test_broad_run_capped_by_max_fwhm() {
        // plateau wider than a third of the band must be rejected
        let mut y = noise_spectrum(300, 1.0, 23);
        for c in 50..170 {
            y[c] += 20.0;
        }
        let m = vec![false; 300];
        let found = find_lines(&y, &m, (0, 0), &LineFinderParams::default()).unwrap();
        assert!(found.is_empty(), "oversize run kept: {:?}", found);
    }
}
