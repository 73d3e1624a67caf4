//! The probe seam between the engine and whatever is being load-tested

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use strain_core::metrics::builtin;
use strain_core::{
    ActionConfig, Datasets, Labels, MetricDecl, MetricError, MetricKind, MetricSink, RunConfig,
    StrainResult,
};
use thiserror::Error;

/// Successful probe result.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Overrides the duration measured by the executor.
    pub duration: Option<Duration>,
    /// Extra labels for the outcome (`endpoint`, `status`, ...).
    pub labels: Labels,
}

impl ProbeReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// A failed probe. Recorded as a failed outcome, never aborts the run.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProbeError {
    pub message: String,
    pub duration: Option<Duration>,
    pub labels: Labels,
}

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            duration: None,
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Per-VU state handed to every probe call.
///
/// The context lives as long as its VU; `iteration`, `identity` and `action`
/// are updated by the executor before each call.
pub struct ProbeContext {
    pub vu: u64,
    pub scenario: Arc<str>,
    pub action: Arc<str>,
    /// Zero-based iteration index of this VU.
    pub iteration: u64,
    /// Identity drawn from the scenario's identity dataset for this iteration.
    pub identity: Option<String>,
    pub datasets: Datasets,
    pub rng: StdRng,
    sink: Arc<MetricSink>,
}

impl ProbeContext {
    pub fn new(
        vu: u64,
        scenario: Arc<str>,
        datasets: Datasets,
        rng: StdRng,
        sink: Arc<MetricSink>,
    ) -> Self {
        Self {
            vu,
            scenario,
            action: Arc::from(""),
            iteration: 0,
            identity: None,
            datasets,
            rng,
            sink,
        }
    }

    /// Random element of a dataset, owned.
    pub fn sample(&mut self, dataset: &str) -> Option<String> {
        self.datasets
            .sample(dataset, &mut self.rng)
            .map(str::to_string)
    }

    /// Records a custom metric sample tagged with this VU's scenario and action.
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        labels: &Labels,
    ) -> Result<(), MetricError> {
        let mut tagged = labels.clone();
        tagged
            .entry(builtin::LABEL_SCENARIO.to_string())
            .or_insert_with(|| self.scenario.to_string());
        tagged
            .entry(builtin::LABEL_ACTION.to_string())
            .or_insert_with(|| self.action.to_string());
        self.sink.record(name, kind, value, &tagged)
    }

    pub(crate) fn sink(&self) -> &Arc<MetricSink> {
        &self.sink
    }
}

/// One kind of work a virtual user can perform.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Performs the action once.
    async fn call(&self, ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError>;

    /// Custom metrics this probe records through [`ProbeContext::record`].
    fn metrics(&self) -> Vec<MetricDecl> {
        Vec::new()
    }
}

/// Builds probes for the actions declared in a profile.
pub trait ProbeFactory: Send + Sync {
    fn build(
        &self,
        name: &str,
        action: &ActionConfig,
        run: &RunConfig,
    ) -> StrainResult<Arc<dyn Probe>>;
}
