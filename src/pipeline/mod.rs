//! Job orchestration: partitioned execution, detection, and classification.

mod classification;
mod detection;
mod executor;
pub mod features;
mod metrics;
mod scheduler;


pub use classification::{
    ClassificationOrchestrator, ClassificationRequest, Classifier, CommandClassifier, DenseVector,
    Outcome, Stage,
};
pub use detection::{
    CommandDetector, DetectionExecutor, DetectionParams, Detector, PartitionSummary,
    PixelOutcome,
};
pub use executor::{ContextGuard, ExecutionContext, Retained};
pub use features::FeatureRow;
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
