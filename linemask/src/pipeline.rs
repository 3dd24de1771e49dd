use thiserror::Error;

use lincore::algorithm::linefind::LineFinderError;
use lincore::data::spectrum::ReductionGroup;

use crate::cluster::{build_feature_points, LineClusterer};
use crate::config::{ConfigError, MaskingConfig};
use crate::detect::{clean_colocated_detections, detect_lines};
use crate::diagnostics::MaskingDiagnostics;
use crate::mask::MaskStore;
use crate::progress::ProgressObserver;
use crate::surface::fit_and_evaluate;
use crate::validate::{validate_clusters, SkyGrid};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("line detection failed: {0}")]
    Detection(#[from] LineFinderError),
}

/// One reduction group's masking stage: detection, cross-row cleaning,
/// clustering, grid validation, surface fitting and mask merging.
///
/// The pipeline holds nothing but its validated configuration; every run
/// allocates its clusters and grids afresh, and the only state written
/// outside is the caller's `MaskStore`.
pub struct MaskingPipeline {
    config: MaskingConfig,
}

impl MaskingPipeline {
    pub fn new(config: MaskingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(MaskingPipeline { config })
    }

    pub fn config(&self) -> &MaskingConfig {
        &self.config
    }

    /// Run the full stage over one group, writing masks for every row into
    /// `store`. `iteration` feeds the per-row no-change markers.
    pub fn run(
        &self,
        group: &ReductionGroup,
        store: &mut MaskStore,
        iteration: u32,
        progress: &dyn ProgressObserver,
    ) -> Result<MaskingDiagnostics, PipelineError> {
        let cfg = &self.config;
        let detections = detect_lines(group, cfg, progress)?;

        // predefined window: the detections already carry the window for
        // every row, no clustering or fitting applies
        if !cfg.window.is_empty() {
            let contributions: Vec<_> = detections
                .iter()
                .flat_map(|d| d.candidates.iter().map(move |c| (d.row_idx, c.range)))
                .collect();
            let mut diag = MaskingDiagnostics::empty();
            diag.attrition.rows_changed = store.apply(&contributions, iteration);
            return Ok(diag);
        }

        let cleaned = clean_colocated_detections(
            &detections,
            group,
            cfg.colocation_radius_arcsec,
            cfg.agreement_fraction,
        );
        let points = build_feature_points(&cleaned);

        let mut diag = MaskingDiagnostics::empty();
        diag.attrition.points_total = points.len();
        if points.is_empty() {
            // nothing detected anywhere: every row gets the empty mask
            diag.attrition.rows_changed = store.apply(&[], iteration);
            return Ok(diag);
        }

        let clusterer = LineClusterer::from_config(cfg, group.nchan);
        let outcome = clusterer.cluster(&points, cfg.nsigma, progress);
        progress.report("cluster", 1, 1);

        let grid = SkyGrid::build(group, cfg.grid_spacing_deg);
        let validations = validate_clusters(&grid, &points, &outcome, cfg);
        progress.report("validate", 1, 1);

        let (contributions, fit_stats) =
            fit_and_evaluate(&validations, &points, &grid, group, cfg);
        progress.report("fit", 1, 1);

        diag.ncluster = outcome.ncluster();
        diag.clusters = outcome.lines.clone();
        for v in &validations {
            // grid validation downgrades clusters without spatial support
            diag.clusters[v.cluster_id].valid = v.valid;
        }
        diag.score_history = outcome.score_history.clone();
        diag.converged = outcome.converged;
        diag.stage_planes = validations.iter().map(|v| v.planes.clone()).collect();
        diag.attrition.points_clustered = outcome
            .category
            .iter()
            .zip(&outcome.is_member)
            .filter(|(c, &m)| c.is_some() && m)
            .count();
        diag.attrition.clusters_found = outcome.ncluster();
        diag.attrition.clusters_validated = validations.iter().filter(|v| v.valid).count();
        diag.attrition.sub_clusters_fitted = fit_stats.fitted;
        diag.attrition.sub_clusters_singular = fit_stats.singular;
        diag.attrition.rows_changed = store.apply(&contributions, iteration);

        Ok(diag)
    }
}
