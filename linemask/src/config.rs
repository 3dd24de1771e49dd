use lincore::algorithm::linefind::LineFinderParams;
use lincore::data::interval::ChannelRange;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::hierarchy::LinkageMethod;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("occupancy thresholds must satisfy 0 < questionable ({questionable}) < marginal ({marginal}) < valid ({valid}) <= 1")]
    BadThresholdOrder {
        questionable: f64,
        marginal: f64,
        valid: f64,
    },
    #[error("FWHM bounds must satisfy 1 <= min ({min}) < max ({max})")]
    BadFwhmBounds { min: usize, max: usize },
    #[error("max_cluster must be at least 1")]
    BadMaxCluster,
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("agreement_fraction must be in (0, 1], got {0}")]
    BadAgreementFraction(f64),
}

/// Clustering strategy selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgorithm {
    KMean,
    Hierarchy,
}

/// Immutable configuration for one masking run.
///
/// Every stage receives this by reference; there is no ambient parameter
/// state anywhere in the pipeline. Occupancy thresholds are fractions of
/// the spectra in a grid cell; FWHM bounds are native channels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskingConfig {
    // line detection
    pub threshold_snr: f32,
    pub min_fwhm: usize,
    pub max_fwhm: usize,
    pub edge: (usize, usize),
    pub ignore_edge_fraction: f64,
    /// Search binned spectra as well, catching broad lines at the cost of
    /// channel resolution. Off restricts the schedule to the native
    /// resolution.
    pub broadline: bool,

    // cross-row detection cleaning
    pub colocation_radius_arcsec: f64,
    pub agreement_fraction: f64,

    // clustering
    pub algorithm: ClusterAlgorithm,
    pub linkage: LinkageMethod,
    pub hierarchy_threshold: f64,
    pub max_cluster: usize,
    pub nsigma: f64,
    pub kmeans_seed: u64,

    // grid validation
    pub threshold_valid: f64,
    pub threshold_marginal: f64,
    pub threshold_questionable: f64,
    pub blur_ratio: f64,
    pub grid_spacing_deg: f64,

    /// Predefined line windows. Non-empty skips detection and clustering
    /// entirely and protects these ranges in every row.
    pub window: Vec<ChannelRange>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        MaskingConfig {
            threshold_snr: 5.0,
            min_fwhm: 4,
            max_fwhm: 900,
            edge: (0, 0),
            ignore_edge_fraction: 0.025,
            broadline: true,

            colocation_radius_arcsec: 1.0,
            agreement_fraction: 2.0 / 3.0,

            algorithm: ClusterAlgorithm::Hierarchy,
            linkage: LinkageMethod::Single,
            hierarchy_threshold: 2.5,
            max_cluster: 100,
            nsigma: 4.0,
            kmeans_seed: 2_718_281,

            threshold_valid: 0.5,
            threshold_marginal: 0.35,
            threshold_questionable: 0.2,
            blur_ratio: 0.1,
            grid_spacing_deg: 9.0 / 3600.0,

            window: Vec::new(),
        }
    }
}

impl MaskingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (q, m, v) = (
            self.threshold_questionable,
            self.threshold_marginal,
            self.threshold_valid,
        );
        if !(q > 0.0 && q < m && m < v && v <= 1.0) {
            return Err(ConfigError::BadThresholdOrder {
                questionable: q,
                marginal: m,
                valid: v,
            });
        }
        if self.min_fwhm < 1 || self.min_fwhm >= self.max_fwhm {
            return Err(ConfigError::BadFwhmBounds {
                min: self.min_fwhm,
                max: self.max_fwhm,
            });
        }
        if self.max_cluster < 1 {
            return Err(ConfigError::BadMaxCluster);
        }
        for (name, value) in [
            ("nsigma", self.nsigma),
            ("blur_ratio", self.blur_ratio),
            ("grid_spacing_deg", self.grid_spacing_deg),
            ("hierarchy_threshold", self.hierarchy_threshold),
            ("colocation_radius_arcsec", self.colocation_radius_arcsec),
            ("threshold_snr", self.threshold_snr as f64),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        if !(self.agreement_fraction > 0.0 && self.agreement_fraction <= 1.0) {
            return Err(ConfigError::BadAgreementFraction(self.agreement_fraction));
        }
        Ok(())
    }

    /// Line-finder parameters for this configuration.
    pub fn line_finder_params(&self) -> LineFinderParams {
        LineFinderParams {
            threshold_snr: self.threshold_snr,
            min_fwhm: self.min_fwhm,
            max_fwhm: self.max_fwhm,
            ..LineFinderParams::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MaskingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_order_enforced() {
        let mut cfg = MaskingConfig::default();
        cfg.threshold_marginal = 0.6; // above valid
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadThresholdOrder { .. })
        ));
    }

    #[test]
    fn test_fwhm_bounds_enforced() {
        let mut cfg = MaskingConfig::default();
        cfg.min_fwhm = 900;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BadFwhmBounds { .. })
        ));
    }

    #[test]
    fn test_algorithm_selector_roundtrip() {
        let j = serde_json::to_string(&ClusterAlgorithm::KMean).unwrap();
        assert_eq!(j, "\"kmean\"");
        let back: ClusterAlgorithm = serde_json::from_str("\"hierarchy\"").unwrap();
        assert_eq!(back, ClusterAlgorithm::Hierarchy);
    }
}
