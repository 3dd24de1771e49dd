use serde::Serialize;

use crate::cluster::{ClusterLine, ScoreRecord};
use crate::validate::StagePlanes;

/// Stage attrition counters: how much survived each step of the run.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AttritionCounters {
    pub points_total: usize,
    pub points_clustered: usize,
    pub clusters_found: usize,
    pub clusters_validated: usize,
    pub sub_clusters_fitted: usize,
    pub sub_clusters_singular: usize,
    pub rows_changed: usize,
}

/// QA side channel of one masking run: cluster properties, the four
/// occupancy planes per cluster, the clustering score history and the
/// attrition counters. Purely informational; masking correctness never
/// depends on it.
#[derive(Clone, Debug, Serialize)]
pub struct MaskingDiagnostics {
    pub ncluster: usize,
    pub clusters: Vec<ClusterLine>,
    pub stage_planes: Vec<StagePlanes>,
    pub score_history: Vec<ScoreRecord>,
    pub converged: bool,
    pub attrition: AttritionCounters,
}

impl MaskingDiagnostics {
    pub fn empty() -> Self {
        MaskingDiagnostics {
            ncluster: 0,
            clusters: Vec::new(),
            stage_planes: Vec::new(),
            score_history: Vec::new(),
            converged: true,
            attrition: AttritionCounters::default(),
        }
    }

    /// Human-readable run report.
    pub fn summary(&self) -> String {
        let a = &self.attrition;
        format!(
            "MaskingDiagnostics: {} cluster(s), converged: {}\n\
             Attrition:\n\
             - feature points: {}\n\
             - points clustered: {}\n\
             - clusters found: {}\n\
             - clusters validated: {}\n\
             - sub-clusters fitted: {}\n\
             - sub-clusters singular: {}\n\
             - rows changed: {}",
            self.ncluster,
            self.converged,
            a.points_total,
            a.points_clustered,
            a.clusters_found,
            a.clusters_validated,
            a.sub_clusters_fitted,
            a.sub_clusters_singular,
            a.rows_changed,
        )
    }

    /// JSON export for external QA rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
