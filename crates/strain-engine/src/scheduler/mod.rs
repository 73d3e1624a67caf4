//! Concurrency scheduler
//!
//! One scheduler task per scenario. It owns the scenario's concurrency
//! dimension and walks the demand curve on a fixed tick:
//! - VU executors keep the live VU count at the demand, retiring the most
//!   recently started VUs first on ramp-down
//! - arrival-rate executors turn the integral of demand into iteration starts
//!   handed to idle VUs (see [`arrival`])
//! - `per-vu-iterations` starts its VUs once and waits for them
//!
//! The tick never awaits a probe.

mod arrival;
mod pool;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strain_core::stage::vus_for_demand;
use strain_core::{
    DemandCurve, Datasets, ExecutorConfig, MetricSink, Reweight, StageCurve, StrainError,
    StrainResult,
};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{IterationSource, VuSettings, VuSummary};
use crate::registry::ActionRegistry;

use self::pool::{PoolSummary, VuPool};

/// Everything a scenario scheduler needs to know about its scenario.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub executor: ExecutorConfig,
    /// Resolved demand curve; `None` for `per-vu-iterations`.
    pub curve: Option<StageCurve>,
    pub start_time: Duration,
    pub graceful_stop: Duration,
    pub tick_interval: Duration,
    pub reweights: Vec<Reweight>,
    pub settings: Arc<VuSettings>,
}

/// What one scenario did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: String,
    pub peak_vus: u32,
    pub iterations: u64,
    pub dropped_iterations: u64,
    pub forced_vus: u64,
    #[serde(skip)]
    pub vus: Vec<VuSummary>,
}

/// Global stop controls shared by every scheduler of a run.
#[derive(Debug, Clone, Default)]
pub struct StopTokens {
    /// Graceful stop: wind down with the scenario's grace period.
    pub stop: CancellationToken,
    /// Forced stop: abandon in-flight probes now.
    pub kill: CancellationToken,
}

/// Drives one scenario from its start offset to its end.
pub struct ScenarioScheduler {
    plan: ScenarioPlan,
    registry: Arc<ActionRegistry>,
    sink: Arc<MetricSink>,
    datasets: Datasets,
    seed: Option<u64>,
    ids: Arc<AtomicU64>,
    tokens: StopTokens,
}

impl ScenarioScheduler {
    pub fn new(
        plan: ScenarioPlan,
        registry: Arc<ActionRegistry>,
        sink: Arc<MetricSink>,
        datasets: Datasets,
        tokens: StopTokens,
    ) -> Self {
        Self {
            plan,
            registry,
            sink,
            datasets,
            seed: None,
            ids: Arc::new(AtomicU64::new(0)),
            tokens,
        }
    }

    /// Seeds every VU random generator of this scenario.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Shares a VU id counter with other schedulers so ids are unique per run.
    pub fn with_id_counter(mut self, ids: Arc<AtomicU64>) -> Self {
        self.ids = ids;
        self
    }

    pub fn name(&self) -> &str {
        &self.plan.settings.scenario
    }

    pub async fn run(self) -> StrainResult<ScenarioSummary> {
        let name = self.plan.settings.scenario.to_string();
        let executor = self.plan.executor.kind().to_string();

        if !self.plan.start_time.is_zero() {
            debug!(scenario = %name, start_time = ?self.plan.start_time, "Waiting for scenario start");
            tokio::select! {
                _ = sleep(self.plan.start_time) => {}
                _ = self.tokens.stop.cancelled() => {
                    info!(scenario = %name, "Run stopped before scenario start");
                    return Ok(ScenarioSummary {
                        name,
                        executor,
                        peak_vus: 0,
                        iterations: 0,
                        dropped_iterations: 0,
                        forced_vus: 0,
                        vus: Vec::new(),
                    });
                }
            }
        }

        let started = Instant::now();
        info!(scenario = %name, executor = %executor, "Scenario started");
        let reweights = self.spawn_reweights(started);

        let pool = VuPool::new(
            Arc::clone(&self.plan.settings),
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
            self.datasets.clone(),
            self.seed,
            Arc::clone(&self.ids),
        );

        let result = match (&self.plan.executor, &self.plan.curve) {
            (ExecutorConfig::PerVuIterations { vus, iterations, max_duration }, _) => {
                Ok(self.run_per_vu(pool, *vus, *iterations, started + *max_duration).await)
            }
            (
                ExecutorConfig::RampingArrivalRate {
                    time_unit,
                    pre_allocated_vus,
                    max_vus,
                    max_queue_wait,
                    ..
                }
                | ExecutorConfig::ConstantArrivalRate {
                    time_unit,
                    pre_allocated_vus,
                    max_vus,
                    max_queue_wait,
                    ..
                },
                Some(curve),
            ) => {
                let limits = arrival::ArrivalLimits {
                    time_unit: *time_unit,
                    pre_allocated_vus: *pre_allocated_vus,
                    max_vus: *max_vus,
                    max_queue_wait: *max_queue_wait,
                };
                Ok(arrival::run(&self, pool, curve, limits, started).await)
            }
            (ExecutorConfig::RampingVus { .. } | ExecutorConfig::ConstantVus { .. }, Some(curve)) => {
                Ok(self.run_vus(pool, curve, started).await)
            }
            (_, None) => Err(StrainError::internal(format!(
                "scenario `{name}` has no demand curve"
            ))),
        };
        reweights.abort();

        let (pool_summary, dropped) = result?;
        let summary = ScenarioSummary {
            iterations: pool_summary.vus.iter().map(|v| v.iterations).sum(),
            forced_vus: pool_summary.vus.iter().filter(|v| v.forced).count() as u64,
            peak_vus: pool_summary.peak,
            dropped_iterations: dropped,
            vus: pool_summary.vus,
            name,
            executor,
        };
        info!(
            scenario = %summary.name,
            elapsed = ?started.elapsed(),
            iterations = summary.iterations,
            peak_vus = summary.peak_vus,
            "Scenario finished"
        );
        Ok(summary)
    }

    /// Keeps the live VU count at the demand until the curve ends.
    async fn run_vus(
        &self,
        mut pool: VuPool,
        curve: &StageCurve,
        started: Instant,
    ) -> (PoolSummary, u64) {
        let name = &self.plan.settings.scenario;
        let total = curve.total_duration();
        let mut ticker = interval(self.plan.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stage = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.tokens.stop.cancelled() => break,
            }
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }
            log_stage_change(name, curve, elapsed, &mut stage);

            pool.reap().await;
            let target = vus_for_demand(curve.demand_at(elapsed));
            while pool.live_count() < target {
                pool.spawn(IterationSource::Continuous);
            }
            while pool.live_count() > target {
                if pool.retire_latest(self.plan.graceful_stop).is_none() {
                    break;
                }
            }
        }

        (self.shutdown(pool).await, 0)
    }

    /// Starts `vus` VUs with a fixed iteration count and waits for them.
    async fn run_per_vu(
        &self,
        mut pool: VuPool,
        vus: u32,
        iterations: u64,
        deadline: Instant,
    ) -> (PoolSummary, u64) {
        for _ in 0..vus {
            pool.spawn(IterationSource::Fixed(iterations));
        }

        let mut ticker = interval(self.plan.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            pool.reap().await;
            if pool.total_count() == 0 {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => {
                    warn!(
                        scenario = %self.plan.settings.scenario,
                        "Scenario reached max_duration before all iterations completed"
                    );
                    break;
                }
                _ = self.tokens.stop.cancelled() => break,
            }
        }

        (self.shutdown(pool).await, 0)
    }

    async fn shutdown(&self, pool: VuPool) -> PoolSummary {
        debug!(
            scenario = %self.plan.settings.scenario,
            vus = pool.total_count(),
            grace = ?self.plan.graceful_stop,
            "Stopping scenario VUs"
        );
        pool.shutdown(self.plan.graceful_stop, &self.tokens.kill).await
    }

    fn spawn_reweights(&self, started: Instant) -> JoinHandle<()> {
        let mut reweights = self.plan.reweights.clone();
        reweights.sort_by_key(|r| r.after);
        let registry = Arc::clone(&self.registry);
        let stop = self.tokens.stop.clone();
        let scenario = Arc::clone(&self.plan.settings.scenario);

        tokio::spawn(async move {
            for reweight in reweights {
                tokio::select! {
                    _ = sleep_until(started + reweight.after) => {}
                    _ = stop.cancelled() => return,
                }
                match registry.apply_weights(&reweight.weights) {
                    Ok(()) => info!(scenario = %scenario, after = ?reweight.after, "Applied new action weights"),
                    Err(err) => warn!(scenario = %scenario, error = %err, "Failed to apply action weights"),
                }
            }
        })
    }
}

fn log_stage_change(
    scenario: &str,
    curve: &StageCurve,
    elapsed: Duration,
    current: &mut Option<usize>,
) {
    let index = curve.stage_index_at(elapsed);
    if index != *current {
        if let Some(i) = index {
            let target = curve.stages()[i].target;
            info!(scenario, stage = i, target, "Entering stage");
        }
        *current = index;
    }
}
