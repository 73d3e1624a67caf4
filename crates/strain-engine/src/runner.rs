//! Run orchestration
//!
//! A [`Runner`] turns a [`RunConfig`] into a running test:
//! 1. everything is validated and wired before the first VU exists
//!    (probes, metric declarations, thresholds, datasets, weight tables)
//! 2. one [`ScenarioScheduler`] task per scenario, all sharing one sink
//! 3. `abort_on_fail` thresholds are checked while the run is in progress
//! 4. the final snapshot is evaluated into a [`RunReport`]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strain_core::metrics::builtin;
use strain_core::threshold::{evaluate, Violation};
use strain_core::{
    Datasets, MetricError, MetricSink, MetricsSnapshot, RunConfig, StrainError, StrainResult,
    Threshold, ThresholdReport, Verdict,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::VuSettings;
use crate::probe::{Probe, ProbeFactory};
use crate::registry::ActionRegistry;
use crate::scheduler::{ScenarioPlan, ScenarioScheduler, ScenarioSummary, StopTokens};

/// Process exit status for a run whose thresholds all passed.
pub const EXIT_PASSED: i32 = 0;
/// At least one threshold failed.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Nothing failed but some threshold never saw data.
pub const EXIT_NO_DATA: i32 = 98;
/// The profile was rejected before the run started.
pub const EXIT_CONFIGURATION: i32 = 78;
/// Any other runtime failure.
pub const EXIT_RUNTIME_ERROR: i32 = 1;

/// Handle for stopping a run from outside (signal handlers, tests).
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    tokens: StopTokens,
}

impl RunControl {
    /// Graceful stop: in-flight probes may finish within the grace period.
    pub fn stop(&self) {
        self.tokens.stop.cancel();
    }

    /// Forced stop: in-flight probes are abandoned at once.
    pub fn kill(&self) {
        self.tokens.stop.cancel();
        self.tokens.kill.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.tokens.stop.is_cancelled()
    }
}

/// Everything the run needs, validated and wired, before any task exists.
pub struct PreparedRun {
    config: RunConfig,
    sink: Arc<MetricSink>,
    datasets: Datasets,
    thresholds: Vec<Threshold>,
    scenarios: Vec<(ScenarioPlan, Arc<ActionRegistry>)>,
}

impl std::fmt::Debug for PreparedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRun")
            .field("config", &self.config)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl PreparedRun {
    pub fn sink(&self) -> &Arc<MetricSink> {
        &self.sink
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn scenario_names(&self) -> Vec<&str> {
        self.scenarios
            .iter()
            .map(|(plan, _)| &*plan.settings.scenario)
            .collect()
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
    pub thresholds: ThresholdReport,
    pub scenarios: Vec<ScenarioSummary>,
    /// An `abort_on_fail` threshold stopped the run early.
    pub aborted_by_threshold: bool,
    /// The run was stopped from outside before its scenarios finished.
    pub interrupted: bool,
}

impl RunReport {
    pub fn verdict(&self) -> Verdict {
        self.thresholds.verdict
    }

    pub fn exit_code(&self) -> i32 {
        match self.verdict() {
            Verdict::Passed => EXIT_PASSED,
            Verdict::Failed => EXIT_THRESHOLDS_FAILED,
            Verdict::NoData => EXIT_NO_DATA,
        }
    }

    pub fn duration(&self) -> Duration {
        self.snapshot.elapsed
    }
}

/// Builds and executes one load test run.
pub struct Runner {
    config: RunConfig,
    probes: BTreeMap<String, Arc<dyn Probe>>,
    factory: Option<Arc<dyn ProbeFactory>>,
    datasets: Option<Datasets>,
    control: RunControl,
}

impl Runner {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            probes: BTreeMap::new(),
            factory: None,
            datasets: None,
            control: RunControl::default(),
        }
    }

    /// Registers a probe for an action name. Takes precedence over the factory.
    pub fn with_probe(mut self, name: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        self.probes.insert(name.into(), probe);
        self
    }

    /// Builds probes for actions declared in the profile's `actions` table.
    pub fn with_probe_factory(mut self, factory: Arc<dyn ProbeFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Uses these datasets instead of loading the profile's dataset files.
    pub fn with_datasets(mut self, datasets: Datasets) -> Self {
        self.datasets = Some(datasets);
        self
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Validates the run and wires its components. Nothing runs yet.
    pub fn prepare(&self) -> StrainResult<PreparedRun> {
        let config = self.config.clone();
        config.validate()?;

        let datasets = match &self.datasets {
            Some(datasets) => datasets.clone(),
            None => Datasets::load_all(&config.datasets)?,
        };
        for (name, scenario) in &config.scenarios {
            if let Some(identity) = &scenario.identity {
                if !datasets.contains(identity) {
                    return Err(StrainError::configuration(format!(
                        "scenario `{name}`: identity dataset `{identity}` is not loaded"
                    )));
                }
            }
        }

        let probes = self.resolve_probes(&config)?;

        let sink = Arc::new(MetricSink::with_reservoir_capacity(
            config.engine.reservoir_capacity,
        ));
        let declarations = builtin::declarations()
            .into_iter()
            .chain(config.metric_declarations())
            .chain(probes.values().flat_map(|probe| probe.metrics()));
        for decl in declarations {
            sink.declare(&decl).map_err(|err| match err {
                MetricError::KindMismatch { .. } => StrainError::configuration(err.to_string()),
                other => StrainError::Metric(other),
            })?;
        }

        let thresholds = config.thresholds()?;
        for threshold in &thresholds {
            let name = &threshold.selector.name;
            let kind = sink.kind_of(name).ok_or_else(|| {
                StrainError::configuration(format!(
                    "threshold `{}` names unknown metric `{name}`",
                    threshold.source
                ))
            })?;
            threshold.check_kind(kind)?;
        }

        let mut scenarios = Vec::with_capacity(config.scenarios.len());
        for (name, scenario) in &config.scenarios {
            let registry = Arc::new(ActionRegistry::new());
            for (action, weight) in &scenario.weights {
                let probe = probes.get(action).ok_or_else(|| {
                    StrainError::internal(format!("probe for `{action}` was not resolved"))
                })?;
                registry.register(action.as_str(), *weight, Arc::clone(probe))?;
            }

            let settings = VuSettings {
                scenario: Arc::from(name.as_str()),
                think_time: config.think_time_for(scenario),
                iteration_pause: scenario.iteration_pause,
                actions_per_iteration: scenario.actions_per_iteration,
                identity: scenario.identity.clone(),
                slow_probe_ms: scenario.slow_probe_ms,
                very_slow_probe_ms: scenario.very_slow_probe_ms,
            };
            let plan = ScenarioPlan {
                executor: scenario.executor.clone(),
                curve: scenario.executor.demand_curve(config.preset)?,
                start_time: scenario.start_time,
                graceful_stop: config.graceful_stop_for(scenario),
                tick_interval: config.engine.tick_interval,
                reweights: scenario.reweights.clone(),
                settings: Arc::new(settings),
            };
            scenarios.push((plan, registry));
        }

        Ok(PreparedRun {
            config,
            sink,
            datasets,
            thresholds,
            scenarios,
        })
    }

    /// Prepares and executes the run.
    pub async fn run(self) -> StrainResult<RunReport> {
        let prepared = self.prepare()?;
        self.execute(prepared).await
    }

    /// Executes a prepared run until every scenario has finished.
    pub async fn execute(&self, prepared: PreparedRun) -> StrainResult<RunReport> {
        let PreparedRun {
            config,
            sink,
            datasets,
            thresholds,
            scenarios,
        } = prepared;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let tokens = self.control.tokens.clone();

        info!(
            run_id = %run_id,
            name = %config.name,
            scenarios = scenarios.len(),
            thresholds = thresholds.len(),
            "Starting load test"
        );

        let ids = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(scenarios.len());
        for (plan, registry) in scenarios {
            let scheduler = ScenarioScheduler::new(
                plan,
                registry,
                Arc::clone(&sink),
                datasets.clone(),
                tokens.clone(),
            )
            .with_seed(config.seed)
            .with_id_counter(Arc::clone(&ids));
            let name = scheduler.name().to_string();
            handles.push((name, tokio::spawn(scheduler.run())));
        }

        let aborted = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        let guarded: Vec<Threshold> = thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .cloned()
            .collect();
        let monitor = (!guarded.is_empty()).then(|| {
            tokio::spawn(watch_thresholds(
                Arc::clone(&sink),
                guarded,
                config.engine.threshold_check_interval,
                tokens.stop.clone(),
                done.clone(),
                Arc::clone(&aborted),
            ))
        });

        let mut summaries = Vec::with_capacity(handles.len());
        let mut failure = None;
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(err)) => {
                    error!(scenario = %name, error = %err, "Scenario failed");
                    tokens.stop.cancel();
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    error!(scenario = %name, error = %err, "Scenario task panicked");
                    tokens.stop.cancel();
                    failure.get_or_insert(StrainError::internal(format!(
                        "scenario `{name}` task failed: {err}"
                    )));
                }
            }
        }

        done.cancel();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!(error = %err, "Threshold monitor task failed");
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let aborted_by_threshold = aborted.load(Ordering::SeqCst);
        let interrupted = tokens.stop.is_cancelled() && !aborted_by_threshold;
        let snapshot = sink.snapshot();
        let threshold_report = evaluate(&snapshot, &thresholds);

        for condition in &snapshot.conditions {
            warn!(?condition, "Run condition raised");
        }
        if snapshot.rejected_samples > 0 {
            warn!(rejected = snapshot.rejected_samples, "Metric samples were rejected");
        }
        info!(
            run_id = %run_id,
            verdict = %threshold_report.verdict,
            elapsed = ?snapshot.elapsed,
            violations = threshold_report.violations.len(),
            aborted_by_threshold,
            interrupted,
            "Load test finished"
        );

        Ok(RunReport {
            run_id,
            name: config.name,
            started_at,
            finished_at: Utc::now(),
            snapshot,
            thresholds: threshold_report,
            scenarios: summaries,
            aborted_by_threshold,
            interrupted,
        })
    }

    fn resolve_probes(&self, config: &RunConfig) -> StrainResult<BTreeMap<String, Arc<dyn Probe>>> {
        let mut resolved = BTreeMap::new();
        for (scenario, settings) in &config.scenarios {
            for action in settings.weights.keys() {
                if resolved.contains_key(action) {
                    continue;
                }
                let probe = if let Some(probe) = self.probes.get(action) {
                    Arc::clone(probe)
                } else {
                    match (config.actions.get(action), &self.factory) {
                        (Some(declared), Some(factory)) => factory.build(action, declared, config)?,
                        (Some(_), None) => {
                            return Err(StrainError::configuration(format!(
                                "action `{action}` is declared but no probe factory is installed"
                            )))
                        }
                        (None, _) => {
                            return Err(StrainError::configuration(format!(
                                "scenario `{scenario}` weights unknown action `{action}`"
                            )))
                        }
                    }
                };
                resolved.insert(action.clone(), probe);
            }
        }
        Ok(resolved)
    }
}

/// Re-evaluates `thresholds` until one fails or `done` fires.
async fn watch_thresholds(
    sink: Arc<MetricSink>,
    thresholds: Vec<Threshold>,
    every: Duration,
    stop: CancellationToken,
    done: CancellationToken,
    aborted: Arc<AtomicBool>,
) -> Option<Vec<Violation>> {
    let names: Vec<&str> = thresholds
        .iter()
        .map(|t| t.selector.name.as_str())
        .collect();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = done.cancelled() => return None,
        }
        let report = evaluate(&sink.snapshot_of(&names), &thresholds);
        if !report.violations.is_empty() {
            for violation in &report.violations {
                warn!(
                    metric = %violation.metric,
                    expression = %violation.expression,
                    actual = violation.actual,
                    "Threshold crossed, aborting run"
                );
            }
            aborted.store(true, Ordering::SeqCst);
            stop.cancel();
            return Some(report.violations);
        }
    }
}
