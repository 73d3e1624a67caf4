//! Virtual user executor
//!
//! A VU loops `SelectingAction -> Invoking -> Recording -> Sleeping` until it
//! is told to stop. Every suspension point (the probe call and the
//! think-time sleep) is raced against the VU's stop signal.
//!
//! Stop semantics:
//! - graceful: a sleeping VU stops at once; an in-flight probe may finish
//!   until the grace deadline, after which it is abandoned
//! - forced: an in-flight probe is abandoned immediately
//!
//! An abandoned probe is recorded as a forced outcome.

use std::sync::Arc;
use std::time::Duration;

use strain_core::metrics::builtin;
use strain_core::{IntRange, Labels, MetricSink, Outcome, ThinkTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::probe::ProbeContext;
use crate::registry::{Action, SelectionTable};

/// Stop signal observed by a VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Run,
    /// Finish the in-flight probe, but not past `deadline`.
    Graceful { deadline: Instant },
    /// Abandon everything now.
    Forced,
}

/// Lifecycle state of a VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuPhase {
    Idle,
    SelectingAction,
    Invoking,
    Recording,
    Sleeping,
    Stopped,
}

/// Scenario-level settings shared by all VUs of a scenario.
#[derive(Debug, Clone)]
pub struct VuSettings {
    pub scenario: Arc<str>,
    pub think_time: ThinkTime,
    pub iteration_pause: Option<ThinkTime>,
    pub actions_per_iteration: IntRange,
    /// Dataset the per-iteration identity is drawn from.
    pub identity: Option<String>,
    pub slow_probe_ms: Option<f64>,
    pub very_slow_probe_ms: Option<f64>,
}

impl VuSettings {
    pub fn new(scenario: impl Into<Arc<str>>) -> Self {
        Self {
            scenario: scenario.into(),
            think_time: ThinkTime::default(),
            iteration_pause: None,
            actions_per_iteration: IntRange::default(),
            identity: None,
            slow_probe_ms: None,
            very_slow_probe_ms: None,
        }
    }
}

/// Where a VU gets permission to start its next iteration.
#[derive(Debug)]
pub enum IterationSource {
    /// Back-to-back iterations until stopped.
    Continuous,
    /// Exactly this many iterations, then stop.
    Fixed(u64),
    /// One iteration per start handed out by an arrival-rate scheduler. The
    /// VU reports its id on `idle` after every iteration.
    Assigned {
        starts: mpsc::Receiver<Instant>,
        idle: mpsc::UnboundedSender<u64>,
    },
}

/// What a VU did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuSummary {
    pub id: u64,
    pub iterations: u64,
    pub actions: u64,
    /// The VU abandoned an in-flight probe.
    pub forced: bool,
}

enum Flow {
    Continue,
    Stopped,
}

/// A single virtual user.
pub struct VuExecutor {
    settings: Arc<VuSettings>,
    table: watch::Receiver<Arc<SelectionTable>>,
    stop: watch::Receiver<StopSignal>,
    source: IterationSource,
    ctx: ProbeContext,
    phase: VuPhase,
    summary: VuSummary,
}

impl VuExecutor {
    pub fn new(
        settings: Arc<VuSettings>,
        table: watch::Receiver<Arc<SelectionTable>>,
        stop: watch::Receiver<StopSignal>,
        source: IterationSource,
        ctx: ProbeContext,
    ) -> Self {
        let id = ctx.vu;
        Self {
            settings,
            table,
            stop,
            source,
            ctx,
            phase: VuPhase::Idle,
            summary: VuSummary {
                id,
                iterations: 0,
                actions: 0,
                forced: false,
            },
        }
    }

    pub fn phase(&self) -> VuPhase {
        self.phase
    }

    /// Runs until stopped or out of iterations.
    pub async fn run(mut self) -> VuSummary {
        debug!(scenario = %self.settings.scenario, vu = self.summary.id, "VU started");

        loop {
            if !self.next_iteration().await {
                break;
            }
            let flow = self.run_iteration().await;
            if let IterationSource::Assigned { idle, .. } = &self.source {
                let _ = idle.send(self.summary.id);
            }
            if matches!(flow, Flow::Stopped) {
                break;
            }
        }

        self.phase = VuPhase::Stopped;
        debug!(
            scenario = %self.settings.scenario,
            vu = self.summary.id,
            iterations = self.summary.iterations,
            forced = self.summary.forced,
            "VU stopped"
        );
        self.summary
    }

    async fn next_iteration(&mut self) -> bool {
        if self.stopping() {
            return false;
        }
        match &mut self.source {
            IterationSource::Continuous => true,
            IterationSource::Fixed(total) => self.summary.iterations < *total,
            IterationSource::Assigned { starts, .. } => {
                self.phase = VuPhase::Idle;
                tokio::select! {
                    start = starts.recv() => start.is_some(),
                    _ = stop_requested(&mut self.stop) => false,
                }
            }
        }
    }

    async fn run_iteration(&mut self) -> Flow {
        let started = Instant::now();
        let table = Arc::clone(&self.table.borrow_and_update());

        self.ctx.iteration = self.summary.iterations;
        self.ctx.identity = match &self.settings.identity {
            Some(dataset) => self.ctx.sample(dataset),
            None => None,
        };

        let actions = self.settings.actions_per_iteration.sample(&mut self.ctx.rng);
        for _ in 0..actions {
            if self.stopping() {
                return Flow::Stopped;
            }

            self.phase = VuPhase::SelectingAction;
            let Some(action) = table.select_weighted(&mut self.ctx.rng).cloned() else {
                warn!(scenario = %self.settings.scenario, "No actions to select from");
                return Flow::Stopped;
            };

            let outcome = self.invoke(&action).await;
            self.phase = VuPhase::Recording;
            self.record(&action, &outcome);
            if outcome.is_forced() {
                return Flow::Stopped;
            }

            let think = self.settings.think_time.sample(&mut self.ctx.rng);
            if !self.sleep(think).await {
                return Flow::Stopped;
            }
        }

        if let Some(pause) = self.settings.iteration_pause {
            let pause = pause.sample(&mut self.ctx.rng);
            if !self.sleep(pause).await {
                return Flow::Stopped;
            }
        }

        self.summary.iterations += 1;
        let labels = self.scenario_labels();
        let sink = self.ctx.sink();
        if let Err(err) = sink.add_counter(builtin::ITERATIONS, 1, &labels) {
            warn!(error = %err, "Failed to record iteration");
        }
        if let Err(err) = sink.add_duration(builtin::ITERATION_DURATION, started.elapsed(), &labels)
        {
            warn!(error = %err, "Failed to record iteration duration");
        }
        Flow::Continue
    }

    async fn invoke(&mut self, action: &Action) -> Outcome {
        self.phase = VuPhase::Invoking;
        self.ctx.action = Arc::clone(&action.name);
        self.summary.actions += 1;

        let mut labels = self.scenario_labels();
        labels.insert(builtin::LABEL_ACTION.to_string(), action.name.to_string());

        let started = Instant::now();
        let result = tokio::select! {
            result = action.probe.call(&mut self.ctx) => Some(result),
            _ = abandon_requested(&mut self.stop) => None,
        };

        match result {
            Some(Ok(report)) => {
                let duration = report.duration.unwrap_or_else(|| started.elapsed());
                labels.extend(report.labels);
                trace!(action = %action.name, duration_ms = duration.as_millis() as u64, "Probe succeeded");
                Outcome::completed(true, duration, labels)
            }
            Some(Err(err)) => {
                let duration = err.duration.unwrap_or_else(|| started.elapsed());
                labels.extend(err.labels.clone());
                debug!(
                    scenario = %self.settings.scenario,
                    vu = self.summary.id,
                    action = %action.name,
                    error = %err,
                    "Probe failed"
                );
                Outcome::completed(false, duration, labels)
            }
            None => {
                self.summary.forced = true;
                warn!(
                    scenario = %self.settings.scenario,
                    vu = self.summary.id,
                    action = %action.name,
                    "Abandoned in-flight probe at stop deadline"
                );
                Outcome::forced(labels)
            }
        }
    }

    fn record(&self, action: &Action, outcome: &Outcome) {
        let sink: &MetricSink = self.ctx.sink();
        if let Err(err) = sink.record_outcome(outcome) {
            warn!(action = %action.name, error = %err, "Failed to record outcome");
        }
        if outcome.is_forced() {
            return;
        }

        let classes = [
            (self.settings.slow_probe_ms, builtin::SLOW_PROBES),
            (self.settings.very_slow_probe_ms, builtin::VERY_SLOW_PROBES),
        ];
        for (limit, metric) in classes {
            let Some(limit) = limit else { continue };
            if outcome.duration_ms > limit {
                let mut labels = self.scenario_labels();
                labels.insert(builtin::LABEL_ACTION.to_string(), action.name.to_string());
                if let Err(err) = sink.add_counter(metric, 1, &labels) {
                    warn!(error = %err, "Failed to record slow probe");
                }
                warn!(
                    scenario = %self.settings.scenario,
                    action = %action.name,
                    duration_ms = outcome.duration_ms,
                    limit_ms = limit,
                    "{metric}: probe exceeded limit"
                );
            }
        }
    }

    /// Sleeps for `duration` unless a stop signal arrives first. Returns
    /// `false` when the sleep was cut short.
    async fn sleep(&mut self, duration: Duration) -> bool {
        if self.stopping() {
            return false;
        }
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return !self.stopping();
        }
        self.phase = VuPhase::Sleeping;
        tokio::select! {
            _ = sleep(duration) => true,
            _ = stop_requested(&mut self.stop) => false,
        }
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow() != StopSignal::Run
    }

    fn scenario_labels(&self) -> Labels {
        let mut labels = Labels::new();
        labels.insert(
            builtin::LABEL_SCENARIO.to_string(),
            self.settings.scenario.to_string(),
        );
        labels
    }
}

/// Resolves once the signal leaves `Run`, or the controller is gone.
async fn stop_requested(stop: &mut watch::Receiver<StopSignal>) {
    loop {
        if *stop.borrow_and_update() != StopSignal::Run {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves when an in-flight probe must be abandoned: on a forced stop, or
/// when a graceful stop's deadline passes.
async fn abandon_requested(stop: &mut watch::Receiver<StopSignal>) {
    loop {
        let signal = *stop.borrow_and_update();
        match signal {
            StopSignal::Forced => return,
            StopSignal::Run => {
                if stop.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            StopSignal::Graceful { deadline } => {
                tokio::select! {
                    _ = sleep_until(deadline) => return,
                    changed = stop.changed() => {
                        if changed.is_err() {
                            sleep_until(deadline).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}
