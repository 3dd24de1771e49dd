use serde::Serialize;

use crate::cluster::feature::FeaturePoint;
use crate::cluster::hierarchy::{cluster_hierarchy, HierarchyParams};
use crate::cluster::kmeans::{cluster_kmeans, KMeansParams};
use crate::config::{ClusterAlgorithm, MaskingConfig};
use crate::progress::ProgressObserver;

/// Feature-space properties of one surviving cluster.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ClusterLine {
    pub center: f64,
    pub width: f64,
    pub valid: bool,
    /// Largest member distance that survived sigma-clipping.
    pub radius: f64,
}

/// One scored clustering attempt of the k-means search.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ScoreRecord {
    pub k: usize,
    pub attempt: usize,
    pub score: f64,
}

/// Common output shape of both clustering variants.
///
/// `category[i]` is the dense cluster id of feature point `i`, `None` for
/// unclustered/noise points; `is_member[i]` tells whether the point
/// survived the per-cluster sigma-clip. Both vectors are indexed like the
/// input point slice.
#[derive(Clone, Debug, Default)]
pub struct ClusteringOutcome {
    pub lines: Vec<ClusterLine>,
    pub category: Vec<Option<usize>>,
    pub is_member: Vec<bool>,
    pub score_history: Vec<ScoreRecord>,
    pub converged: bool,
}

impl ClusteringOutcome {
    pub fn empty(npoints: usize) -> Self {
        ClusteringOutcome {
            lines: Vec::new(),
            category: vec![None; npoints],
            is_member: vec![false; npoints],
            score_history: Vec::new(),
            converged: true,
        }
    }

    #[inline]
    pub fn ncluster(&self) -> usize {
        self.lines.len()
    }
}

/// Strategy dispatcher over the two interchangeable clustering variants.
#[derive(Clone, Debug)]
pub enum LineClusterer {
    KMean(KMeansParams),
    Hierarchy(HierarchyParams),
}

impl LineClusterer {
    pub fn from_config(config: &MaskingConfig, nchan: usize) -> Self {
        match config.algorithm {
            ClusterAlgorithm::KMean => LineClusterer::KMean(KMeansParams {
                max_cluster: config.max_cluster,
                seed: config.kmeans_seed,
                ..KMeansParams::default()
            }),
            ClusterAlgorithm::Hierarchy => LineClusterer::Hierarchy(HierarchyParams {
                method: config.linkage,
                n_threshold: config.hierarchy_threshold,
                nchan,
            }),
        }
    }

    pub fn cluster(
        &self,
        points: &[FeaturePoint],
        nsigma: f64,
        progress: &dyn ProgressObserver,
    ) -> ClusteringOutcome {
        match self {
            LineClusterer::KMean(p) => cluster_kmeans(points, nsigma, p, progress),
            LineClusterer::Hierarchy(p) => cluster_hierarchy(points, p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_outcome_shape() {
        let o = ClusteringOutcome::empty(5);
        assert_eq!(o.ncluster(), 0);
        assert_eq!(o.category.len(), 5);
        assert!(o.category.iter().all(|c| c.is_none()));
        assert!(o.converged);
    }

    #[test]
    fn test_dispatcher_picks_variant() {
        let mut cfg = MaskingConfig::default();
        cfg.algorithm = ClusterAlgorithm::KMean;
        assert!(matches!(
            LineClusterer::from_config(&cfg, 1024),
            LineClusterer::KMean(_)
        ));
        cfg.algorithm = ClusterAlgorithm::Hierarchy;
        assert!(matches!(
            LineClusterer::from_config(&cfg, 1024),
            LineClusterer::Hierarchy(_)
        ));
    }
}
