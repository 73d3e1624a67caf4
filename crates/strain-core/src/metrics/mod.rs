//! Metric sink: counters, rates and duration trends keyed by label sets
//!
//! Every sample is recorded against a `(metric name, label set)` key. The sink
//! is the only mutable state shared between virtual users; it is append-only
//! and never mutates a sample after it has been recorded.

mod sink;
mod snapshot;
mod trend;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use sink::{MetricSink, DEFAULT_RESERVOIR_CAPACITY};
pub use snapshot::{Aggregate, MetricsSnapshot, RunCondition, SeriesEntry, SeriesSnapshot};
pub use trend::TrendSummary;

/// Label set attached to a metric sample.
pub type Labels = BTreeMap<String, String>;

/// Kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic integer counter.
    Counter,
    /// Ratio of `true` samples over all samples.
    Rate,
    /// Distribution of durations in milliseconds.
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Rate => "rate",
            Self::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// Declaration of a metric family, used to validate thresholds up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDecl {
    pub name: String,
    pub kind: MetricKind,
}

impl MetricDecl {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Key of a single series inside the sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Labels,
}

impl SeriesKey {
    pub fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }

    /// True when every `filter` pair is present in this key's labels.
    pub fn matches(&self, name: &str, filter: &Labels) -> bool {
        self.name == name
            && filter
                .iter()
                .all(|(k, v)| self.labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.labels.is_empty() {
            let pairs: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            write!(f, "{{{}}}", pairs.join(","))?;
        }
        Ok(())
    }
}

/// Names of the metrics recorded by the engine itself.
pub mod builtin {
    use super::{MetricDecl, MetricKind};

    pub const PROBE_DURATION: &str = "probe_duration";
    pub const PROBE_ATTEMPTS: &str = "probe_attempts";
    pub const PROBE_SUCCESSES: &str = "probe_successes";
    pub const PROBE_FAILED: &str = "probe_failed";
    pub const FORCED_TERMINATIONS: &str = "forced_terminations";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const SLOW_PROBES: &str = "slow_probes";
    pub const VERY_SLOW_PROBES: &str = "very_slow_probes";

    pub const LABEL_SCENARIO: &str = "scenario";
    pub const LABEL_ACTION: &str = "action";

    /// All built-in metric declarations.
    pub fn declarations() -> Vec<MetricDecl> {
        vec![
            MetricDecl::new(PROBE_DURATION, MetricKind::Trend),
            MetricDecl::new(PROBE_ATTEMPTS, MetricKind::Counter),
            MetricDecl::new(PROBE_SUCCESSES, MetricKind::Counter),
            MetricDecl::new(PROBE_FAILED, MetricKind::Rate),
            MetricDecl::new(FORCED_TERMINATIONS, MetricKind::Counter),
            MetricDecl::new(ITERATIONS, MetricKind::Counter),
            MetricDecl::new(ITERATION_DURATION, MetricKind::Trend),
            MetricDecl::new(DROPPED_ITERATIONS, MetricKind::Counter),
            MetricDecl::new(SLOW_PROBES, MetricKind::Counter),
            MetricDecl::new(VERY_SLOW_PROBES, MetricKind::Counter),
        ]
    }
}

/// Builds a label set from string pairs.
pub fn labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
