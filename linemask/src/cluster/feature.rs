use lincore::data::interval::ChannelRange;

use crate::detect::RowDetections;

/// Scale applied to line widths before clustering, decoupling the metric's
/// sensitivity to width from its sensitivity to center position.
pub const WHITEN_FACTOR: f64 = 1.0;

/// One line candidate mapped into (width, center) feature space, with the
/// provenance needed to get back to its spectrum.
#[derive(Clone, Debug)]
pub struct FeaturePoint {
    pub width: f64,
    pub center: f64,
    pub row_idx: usize,
    pub range: ChannelRange,
    pub binning: usize,
}

/// Euclidean distance in whitened (width, center) space.
#[inline]
pub fn feature_distance(w0: f64, c0: f64, w1: f64, c1: f64) -> f64 {
    let dw = w0 - w1;
    let dc = c0 - c1;
    (dw * dw + dc * dc).sqrt()
}

/// Map every candidate of every row into feature space. Sentinel (empty)
/// rows contribute nothing, which is how they stay excluded from
/// clustering.
pub fn build_feature_points(detections: &[RowDetections]) -> Vec<FeaturePoint> {
    let mut out = Vec::new();
    for det in detections {
        for cand in &det.candidates {
            out.push(FeaturePoint {
                width: (cand.range.width() as f64 - 1.0) / WHITEN_FACTOR,
                center: cand.range.center(),
                row_idx: det.row_idx,
                range: cand.range,
                binning: cand.binning,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::LineCandidate;

    #[test]
    fn test_feature_mapping() {
        let det = vec![
            RowDetections {
                row_idx: 0,
                row_id: 0,
                candidates: vec![LineCandidate {
                    range: ChannelRange::new(100, 120),
                    binning: 1,
                }],
            },
            RowDetections {
                row_idx: 1,
                row_id: 1,
                candidates: Vec::new(), // sentinel stays out of feature space
            },
        ];
        let pts = build_feature_points(&det);
        assert_eq!(pts.len(), 1);
        assert!((pts[0].center - 110.0).abs() < 1e-12);
        assert!((pts[0].width - 20.0 / WHITEN_FACTOR).abs() < 1e-12);
    }

    #[test]
    fn test_distance_symmetry() {
        let d0 = feature_distance(3.0, 100.0, 7.0, 104.0);
        let d1 = feature_distance(7.0, 104.0, 3.0, 100.0);
        assert!((d0 - d1).abs() < 1e-12);
        assert!((d0 - 32.0f64.sqrt()).abs() < 1e-12);
    }
}
