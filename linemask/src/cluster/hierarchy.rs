use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use lincore::algorithm::smoothing::mean_std;

use crate::cluster::engine::{ClusterLine, ClusteringOutcome};
use crate::cluster::feature::{feature_distance, FeaturePoint};

/// Linkage update rule for the agglomeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkageMethod {
    Single,
    Complete,
    Average,
    Centroid,
    Median,
    Ward,
}

impl LinkageMethod {
    /// Centroid-family methods run the Lance-Williams recurrence on
    /// squared distances; merge heights are reported unsquared either way.
    fn on_squared(self) -> bool {
        matches!(
            self,
            LinkageMethod::Centroid | LinkageMethod::Median | LinkageMethod::Ward
        )
    }
}

#[derive(Clone, Debug)]
pub struct HierarchyParams {
    pub method: LinkageMethod,
    /// Sigma multiplier for the dendrogram cut and the member cleaning.
    pub n_threshold: f64,
    /// Channel count of the group; fixes the anchor positions.
    pub nchan: usize,
}

/// Synthetic points pinned at the extreme channel positions. They join the
/// linkage so the merge-height distribution always contains a few large
/// values, which keeps the mean + n*sigma cut stable on compact data sets.
const ANCHOR_COUNT: usize = 4;

/// A merge sequence over a point subset. `steps[s]` merges slot `b` into
/// slot `a` at `heights[s]`; slots index the subset, not the full set.
struct Linkage {
    steps: Vec<(usize, usize)>,
    heights: Vec<f64>,
}

/// Hierarchical clustering over (width, center) feature points.
///
/// The dendrogram over points + anchors is cut at
/// `mean(height) + n_threshold * stddev`; each resulting cluster is then
/// re-cut once with the second-level threshold
/// `mean + 1.5 * n_threshold * stddev` of its own merge heights, which
/// splits compound clusters a single global threshold cannot separate.
/// Refinement runs off an explicit queue with a bounded depth, never
/// recursion. After cleaning, clusters with fewer than three surviving
/// members are discarded wholesale and their points become unclustered.
pub fn cluster_hierarchy(points: &[FeaturePoint], params: &HierarchyParams) -> ClusteringOutcome {
    let n = points.len();
    if n == 0 {
        return ClusteringOutcome::empty(0);
    }

    let mut all: Vec<(f64, f64)> = points.iter().map(|p| (p.width, p.center)).collect();
    all.extend(anchor_points(points, params.nchan));

    let full: Vec<usize> = (0..all.len()).collect();
    let lk = linkage(&all, &full, params.method);
    let (m, s) = mean_std(&lk.heights);
    let t1 = m + params.n_threshold * s;
    let level1 = cut(&full, &lk, t1);

    // one re-cut per first-level cluster, queue-driven
    let mut final_clusters: Vec<Vec<usize>> = Vec::new();
    let mut queue: VecDeque<(Vec<usize>, usize)> =
        level1.into_iter().map(|c| (c, 0usize)).collect();
    while let Some((members, depth)) = queue.pop_front() {
        if depth >= 1 || members.len() < 3 {
            final_clusters.push(members);
            continue;
        }
        let sub = linkage(&all, &members, params.method);
        let (m2, s2) = mean_std(&sub.heights);
        let t2 = m2 + 1.5 * params.n_threshold * s2;
        for part in cut(&members, &sub, t2) {
            queue.push_back((part, depth + 1));
        }
    }

    // anchors have served their purpose
    for c in &mut final_clusters {
        c.retain(|&i| i < n);
    }
    final_clusters.retain(|c| !c.is_empty());

    // clean members and renumber the survivors densely
    let mut category: Vec<Option<usize>> = vec![None; n];
    let mut is_member = vec![false; n];
    let mut lines: Vec<ClusterLine> = Vec::new();
    for members in &final_clusters {
        if let Some((line, survivors)) = clean_cluster(points, members, params.n_threshold) {
            let cid = lines.len();
            for &i in &survivors {
                category[i] = Some(cid);
                is_member[i] = true;
            }
            lines.push(line);
        }
    }

    ClusteringOutcome {
        lines,
        category,
        is_member,
        score_history: Vec::new(),
        converged: true,
    }
}

fn anchor_points(points: &[FeaturePoint], nchan: usize) -> Vec<(f64, f64)> {
    let w_lo = points.iter().map(|p| p.width).fold(f64::INFINITY, f64::min);
    let w_hi = points
        .iter()
        .map(|p| p.width)
        .fold(f64::NEG_INFINITY, f64::max);
    let c_hi = nchan.saturating_sub(1) as f64;
    debug_assert_eq!(ANCHOR_COUNT, 4);
    vec![(w_lo, 0.0), (w_hi, 0.0), (w_lo, c_hi), (w_hi, c_hi)]
}

/// Generic agglomeration via the Lance-Williams recurrence over an active
/// distance matrix. Quadratic memory, cubic worst-case time; adequate for
/// the point counts one reduction group produces.
fn linkage(all: &[(f64, f64)], subset: &[usize], method: LinkageMethod) -> Linkage {
    let n = subset.len();
    let mut steps = Vec::with_capacity(n.saturating_sub(1));
    let mut heights = Vec::with_capacity(n.saturating_sub(1));
    if n < 2 {
        return Linkage { steps, heights };
    }

    let squared = method.on_squared();
    let mut d = vec![0.0f64; n * n];
    for i in 0..n {
        for j in i + 1..n {
            let (wa, ca) = all[subset[i]];
            let (wb, cb) = all[subset[j]];
            let mut dist = feature_distance(wa, ca, wb, cb);
            if squared {
                dist *= dist;
            }
            d[i * n + j] = dist;
            d[j * n + i] = dist;
        }
    }

    let mut active = vec![true; n];
    let mut size = vec![1.0f64; n];

    for _ in 0..n - 1 {
        // minimal active pair
        let mut bi = usize::MAX;
        let mut bj = usize::MAX;
        let mut bd = f64::INFINITY;
        for i in 0..n {
            if !active[i] {
                continue;
            }
            for j in i + 1..n {
                if active[j] && d[i * n + j] < bd {
                    bd = d[i * n + j];
                    bi = i;
                    bj = j;
                }
            }
        }

        heights.push(if squared { bd.max(0.0).sqrt() } else { bd });
        steps.push((bi, bj));

        let (ni, nj, dij) = (size[bi], size[bj], d[bi * n + bj]);
        for k in 0..n {
            if !active[k] || k == bi || k == bj {
                continue;
            }
            let dik = d[bi * n + k];
            let djk = d[bj * n + k];
            let updated = match method {
                LinkageMethod::Single => dik.min(djk),
                LinkageMethod::Complete => dik.max(djk),
                LinkageMethod::Average => (ni * dik + nj * djk) / (ni + nj),
                LinkageMethod::Centroid => {
                    (ni * dik + nj * djk) / (ni + nj) - ni * nj * dij / ((ni + nj) * (ni + nj))
                }
                LinkageMethod::Median => 0.5 * dik + 0.5 * djk - 0.25 * dij,
                LinkageMethod::Ward => {
                    let nk = size[k];
                    ((nk + ni) * dik + (nk + nj) * djk - nk * dij) / (nk + ni + nj)
                }
            };
            d[bi * n + k] = updated;
            d[k * n + bi] = updated;
        }
        size[bi] += size[bj];
        active[bj] = false;
    }

    Linkage { steps, heights }
}

/// Flatten a linkage at `threshold`: replay merges in order until the
/// first one above the threshold, then report the surviving slots as
/// clusters of global point indices.
fn cut(subset: &[usize], lk: &Linkage, threshold: f64) -> Vec<Vec<usize>> {
    let mut members: Vec<Vec<usize>> = subset.iter().map(|&g| vec![g]).collect();
    for (s, &(a, b)) in lk.steps.iter().enumerate() {
        if lk.heights[s] > threshold {
            break;
        }
        let moved = std::mem::take(&mut members[b]);
        members[a].extend(moved);
    }
    members.retain(|m| !m.is_empty());
    members
}

/// Discard members farther from the cluster centroid than
/// `median(distance) + n_threshold * stddev`; a cluster left with fewer
/// than three members is discarded entirely. Centroid and the reported
/// line use the member mean, matching the historical behavior of this
/// variant.
fn clean_cluster(
    points: &[FeaturePoint],
    members: &[usize],
    n_threshold: f64,
) -> Option<(ClusterLine, Vec<usize>)> {
    if members.len() < 3 {
        return None;
    }
    let mw = members.iter().map(|&i| points[i].width).sum::<f64>() / members.len() as f64;
    let mc = members.iter().map(|&i| points[i].center).sum::<f64>() / members.len() as f64;

    let dists: Vec<f64> = members
        .iter()
        .map(|&i| feature_distance(points[i].width, points[i].center, mw, mc))
        .collect();
    let med = {
        let mut s = dists.clone();
        s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        s[s.len() / 2]
    };
    let (_, sd) = mean_std(&dists);
    let thr = med + n_threshold * sd;

    let survivors: Vec<usize> = members
        .iter()
        .zip(&dists)
        .filter(|(_, &d)| d <= thr)
        .map(|(&i, _)| i)
        .collect();
    if survivors.len() < 3 {
        return None;
    }

    let w = survivors.iter().map(|&i| points[i].width).sum::<f64>() / survivors.len() as f64;
    let c = survivors.iter().map(|&i| points[i].center).sum::<f64>() / survivors.len() as f64;
    let radius = survivors
        .iter()
        .map(|&i| feature_distance(points[i].width, points[i].center, w, c))
        .fold(0.0f64, f64::max);

    Some((
        ClusterLine {
            center: c,
            width: w,
            valid: true,
            radius,
        },
        survivors,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lincore::data::interval::ChannelRange;

    fn point(width: f64, center: f64, row_idx: usize) -> FeaturePoint {
        let half = (width / 2.0) as usize;
        let c = center as usize;
        FeaturePoint {
            width,
            center,
            row_idx,
            range: ChannelRange::new(c.saturating_sub(half), c + half),
            binning: 1,
        }
    }

    fn params(nchan: usize) -> HierarchyParams {
        HierarchyParams {
            method: LinkageMethod::Single,
            n_threshold: 2.5,
            nchan,
        }
    }

    #[test]
    fn test_empty_points() {
        let o = cluster_hierarchy(&[], &params(2048));
        assert_eq!(o.ncluster(), 0);
        assert!(o.converged);
    }

    #[test]
    fn test_single_clump_survives_anchors() {
        let mut pts = Vec::new();
        for i in 0..60 {
            let j = (i % 6) as f64 - 2.5;
            pts.push(point(20.0 + 0.2 * j, 1000.0 + 0.5 * j, i));
        }
        let o = cluster_hierarchy(&pts, &params(2048));
        assert_eq!(o.ncluster(), 1, "lines: {:?}", o.lines);
        assert!((o.lines[0].center - 1000.0).abs() < 3.0);
        assert_eq!(o.is_member.iter().filter(|&&m| m).count(), 60);
    }

    #[test]
    fn test_two_separated_lines_split() {
        let mut pts = Vec::new();
        for i in 0..25 {
            let j = (i % 5) as f64 - 2.0;
            pts.push(point(20.0 + 0.2 * j, 210.0 + 0.4 * j, i));
            pts.push(point(20.0 + 0.2 * j, 1810.0 + 0.4 * j, i + 25));
        }
        let o = cluster_hierarchy(&pts, &params(2048));
        assert_eq!(o.ncluster(), 2, "lines: {:?}", o.lines);
        let mut centers: Vec<f64> = o.lines.iter().map(|l| l.center).collect();
        centers.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((centers[0] - 210.0).abs() < 3.0);
        assert!((centers[1] - 1810.0).abs() < 3.0);
    }

    #[test]
    fn test_tiny_cluster_discarded_as_noise() {
        let mut pts = Vec::new();
        for i in 0..20 {
            let j = (i % 4) as f64 - 1.5;
            pts.push(point(18.0, 400.0 + j, i));
        }
        // two stray points far away can never form a 3-member cluster
        pts.push(point(6.0, 1500.0, 20));
        pts.push(point(6.0, 1510.0, 21));
        let o = cluster_hierarchy(&pts, &params(2048));
        assert_eq!(o.ncluster(), 1);
        assert!(o.category[20].is_none());
        assert!(o.category[21].is_none());
        assert!(!o.is_member[20]);
    }

    #[test]
    fn test_dense_renumbering() {
        let mut pts = Vec::new();
        for c in [300.0f64, 900.0, 1500.0] {
            for i in 0..10 {
                let j = (i % 5) as f64 - 2.0;
                pts.push(point(15.0, c + j, pts.len()));
            }
        }
        let o = cluster_hierarchy(&pts, &params(2048));
        assert_eq!(o.ncluster(), 3);
        let mut seen: Vec<usize> = o.category.iter().flatten().copied().collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_ward_linkage_also_splits() {
        let mut pts = Vec::new();
        for i in 0..20 {
            let j = (i % 5) as f64 - 2.0;
            pts.push(point(20.0, 210.0 + j, i));
            pts.push(point(20.0, 1810.0 + j, i + 20));
        }
        let mut p = params(2048);
        p.method = LinkageMethod::Ward;
        let o = cluster_hierarchy(&pts, &p);
        assert_eq!(o.ncluster(), 2);
    }
}
