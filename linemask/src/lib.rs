pub mod cluster;
pub mod config;
pub mod detect;
pub mod diagnostics;
pub mod mask;
pub mod pipeline;
pub mod progress;
pub mod surface;
pub mod validate;

// Re-export commonly used types
pub use config::{ClusterAlgorithm, ConfigError, MaskingConfig};
pub use mask::{MaskStore, RowMaskRecord};
pub use pipeline::{MaskingPipeline, PipelineError};
pub use progress::{NullProgress, ProgressObserver};
