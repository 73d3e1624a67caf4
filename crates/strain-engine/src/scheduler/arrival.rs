//! Arrival-rate scheduling
//!
//! Demand is read as iteration starts per `time_unit`. The number of starts
//! due by `t` is the integral of demand up to `t`, so ramps are followed
//! exactly regardless of the tick length. Due starts queue up and are handed
//! to idle VUs; the pool grows up to `max_vus` while starts are queued. Starts
//! that wait longer than `max_queue_wait` with the pool exhausted are dropped,
//! counted and reported as a capacity condition.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use strain_core::{DemandCurve, StageCurve};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::warn;

use super::pool::{PoolSummary, VuPool};
use super::{log_stage_change, ScenarioScheduler};
use crate::executor::IterationSource;

#[derive(Debug, Clone, Copy)]
pub(super) struct ArrivalLimits {
    pub(super) time_unit: Duration,
    pub(super) pre_allocated_vus: u32,
    pub(super) max_vus: u32,
    pub(super) max_queue_wait: Duration,
}

struct Dispatcher {
    /// Start channel of every VU in the pool.
    starts: HashMap<u64, mpsc::Sender<Instant>>,
    idle: Vec<u64>,
    idle_tx: mpsc::UnboundedSender<u64>,
    idle_rx: mpsc::UnboundedReceiver<u64>,
    pending: VecDeque<Instant>,
}

impl Dispatcher {
    fn new() -> Self {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        Self {
            starts: HashMap::new(),
            idle: Vec::new(),
            idle_tx,
            idle_rx,
            pending: VecDeque::new(),
        }
    }

    fn spawn_vu(&mut self, pool: &mut VuPool) {
        let (tx, rx) = mpsc::channel(1);
        let id = pool.spawn(IterationSource::Assigned {
            starts: rx,
            idle: self.idle_tx.clone(),
        });
        self.starts.insert(id, tx);
        self.idle.push(id);
    }

    /// Drops a VU that has returned from the pool.
    fn forget(&mut self, id: u64) {
        self.starts.remove(&id);
        self.idle.retain(|idle| *idle != id);
    }

    fn collect_idle(&mut self) {
        while let Ok(id) = self.idle_rx.try_recv() {
            self.idle.push(id);
        }
    }

    /// Hands queued starts to idle VUs, oldest start first.
    fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let Some(id) = self.idle.pop() else { break };
            let Some(tx) = self.starts.get(&id) else { continue };
            let Some(due) = self.pending.front().copied() else { break };
            match tx.try_send(due) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.starts.remove(&id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }
    }

    /// Drops starts that have waited longer than `max_wait`.
    fn drop_expired(&mut self, now: Instant, max_wait: Duration) -> u64 {
        let mut dropped = 0;
        while let Some(due) = self.pending.front() {
            if now.duration_since(*due) <= max_wait {
                break;
            }
            self.pending.pop_front();
            dropped += 1;
        }
        dropped
    }
}

pub(super) async fn run(
    scheduler: &ScenarioScheduler,
    mut pool: VuPool,
    curve: &StageCurve,
    limits: ArrivalLimits,
    started: Instant,
) -> (PoolSummary, u64) {
    let name = &scheduler.plan.settings.scenario;
    let total = curve.total_duration();
    let unit = limits.time_unit.as_secs_f64();
    let mut dispatcher = Dispatcher::new();
    for _ in 0..limits.pre_allocated_vus {
        dispatcher.spawn_vu(&mut pool);
    }

    let mut ticker = interval(scheduler.plan.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut issued: u64 = 0;
    let mut dropped_total: u64 = 0;
    let mut stage = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = scheduler.tokens.stop.cancelled() => break,
        }
        let now = Instant::now();
        let elapsed = started.elapsed().min(total);
        log_stage_change(name, curve, elapsed, &mut stage);

        let due = (curve.cumulative_demand(elapsed) / unit + 1e-9).floor() as u64;
        while issued < due {
            dispatcher.pending.push_back(now);
            issued += 1;
        }

        dispatcher.collect_idle();
        for id in pool.reap().await {
            dispatcher.forget(id);
        }
        dispatcher.dispatch();

        while !dispatcher.pending.is_empty() && pool.total_count() < limits.max_vus {
            dispatcher.spawn_vu(&mut pool);
            dispatcher.dispatch();
        }

        if !dispatcher.pending.is_empty() {
            let dropped = dispatcher.drop_expired(now, limits.max_queue_wait);
            if dropped > 0 {
                dropped_total += dropped;
                scheduler
                    .sink
                    .raise_capacity_exceeded(name, dropped, limits.max_vus);
                warn!(
                    scenario = %name,
                    dropped,
                    max_vus = limits.max_vus,
                    queued = dispatcher.pending.len(),
                    "Not enough VUs to keep up with the arrival rate, dropping iterations"
                );
            }
        }

        if started.elapsed() >= total {
            break;
        }
    }

    if !dispatcher.pending.is_empty() {
        tracing::debug!(
            scenario = %name,
            queued = dispatcher.pending.len(),
            "Discarding queued starts at scenario end"
        );
    }
    let summary = scheduler.shutdown(pool).await;
    (summary, dropped_total)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use async_trait::async_trait;
    use strain_core::{Datasets, MetricSink};

    use super::*;
    use crate::executor::VuSettings;
    use crate::probe::{Probe, ProbeContext, ProbeError, ProbeReport};
    use crate::registry::ActionRegistry;

    struct Noop;

    #[async_trait]
    impl Probe for Noop {
        async fn call(&self, _ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
            Ok(ProbeReport::new())
        }
    }

    fn pool() -> VuPool {
        let registry = Arc::new(ActionRegistry::new());
        registry.register("noop", 1.0, Arc::new(Noop)).unwrap();
        VuPool::new(
            Arc::new(VuSettings::new("arrival")),
            registry,
            Arc::new(MetricSink::new()),
            Datasets::default(),
            Some(1),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_returned_vus_free_pool_capacity() {
        let mut pool = pool();
        let mut dispatcher = Dispatcher::new();
        dispatcher.spawn_vu(&mut pool);
        dispatcher.spawn_vu(&mut pool);
        assert_eq!(pool.total_count(), 2);

        // Closing its start channel ends VU 1.
        dispatcher.starts.remove(&1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reaped = pool.reap().await;
        assert_eq!(reaped, vec![1]);
        for id in reaped {
            dispatcher.forget(id);
        }
        assert_eq!(pool.total_count(), 1);
        assert_eq!(dispatcher.idle, vec![2]);

        dispatcher.pending.push_back(Instant::now());
        dispatcher.dispatch();
        assert!(dispatcher.pending.is_empty());

        let summary = pool
            .shutdown(Duration::from_secs(1), &tokio_util::sync::CancellationToken::new())
            .await;
        assert_eq!(summary.vus.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_expired_keeps_fresh_starts() {
        let mut dispatcher = Dispatcher::new();
        let old = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = Instant::now();
        dispatcher.pending.extend([old, old, fresh]);

        let dropped = dispatcher.drop_expired(Instant::now(), Duration::from_secs(1));
        assert_eq!(dropped, 2);
        assert_eq!(dispatcher.pending.len(), 1);
    }
}
