pub mod engine;
pub mod feature;
pub mod hierarchy;
pub mod kmeans;

// Re-export commonly used types
pub use engine::{ClusterLine, ClusteringOutcome, LineClusterer, ScoreRecord};
pub use feature::{build_feature_points, feature_distance, FeaturePoint, WHITEN_FACTOR};
