//! Core types for the strain load generator: metrics, thresholds, stages,
//! datasets and run configuration.

pub mod config;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod outcome;
pub mod stage;
pub mod threshold;

pub use config::{
    ActionConfig, CountRule, EngineConfig, ExecutorConfig, FollowUp, HttpConfig, IntRange,
    RequestConfig, Reweight, RunConfig, ScenarioConfig, ThinkTime, ThresholdConfig,
};
pub use dataset::{Dataset, DatasetConfig, Datasets};
pub use error::{MetricError, StrainError, StrainResult};
pub use metrics::{
    Labels, MetricDecl, MetricKind, MetricSink, MetricsSnapshot, RunCondition, SeriesKey,
    TrendSummary,
};
pub use outcome::{Outcome, Termination};
pub use stage::{DemandCurve, Preset, Stage, StageCurve};
pub use threshold::{Threshold, ThresholdReport, ThresholdStatus, Verdict};
