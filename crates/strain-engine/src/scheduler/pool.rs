use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use strain_core::{Datasets, MetricSink};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::executor::{IterationSource, StopSignal, VuExecutor, VuSettings, VuSummary};
use crate::probe::ProbeContext;
use crate::registry::ActionRegistry;

struct VuHandle {
    id: u64,
    stop: watch::Sender<StopSignal>,
    join: JoinHandle<VuSummary>,
}

/// Live VUs of one scenario.
///
/// `live` is kept in start order so ramp-down can retire the most recently
/// started VU first.
pub(crate) struct VuPool {
    settings: Arc<VuSettings>,
    registry: Arc<ActionRegistry>,
    sink: Arc<MetricSink>,
    datasets: Datasets,
    seed: Option<u64>,
    ids: Arc<AtomicU64>,
    live: Vec<VuHandle>,
    retiring: Vec<VuHandle>,
    finished: Vec<VuSummary>,
    peak: u32,
}

impl VuPool {
    pub(crate) fn new(
        settings: Arc<VuSettings>,
        registry: Arc<ActionRegistry>,
        sink: Arc<MetricSink>,
        datasets: Datasets,
        seed: Option<u64>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            settings,
            registry,
            sink,
            datasets,
            seed,
            ids,
            live: Vec::new(),
            retiring: Vec::new(),
            finished: Vec::new(),
            peak: 0,
        }
    }

    /// Starts a VU and returns its id.
    pub(crate) fn spawn(&mut self, source: IterationSource) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        let ctx = ProbeContext::new(
            id,
            Arc::clone(&self.settings.scenario),
            self.datasets.clone(),
            rng,
            Arc::clone(&self.sink),
        );
        let (stop, stop_rx) = watch::channel(StopSignal::Run);
        let executor = VuExecutor::new(
            Arc::clone(&self.settings),
            self.registry.subscribe(),
            stop_rx,
            source,
            ctx,
        );

        self.live.push(VuHandle {
            id,
            stop,
            join: tokio::spawn(executor.run()),
        });
        self.peak = self.peak.max(self.live_count());
        id
    }

    /// Gracefully stops the most recently started live VU.
    pub(crate) fn retire_latest(&mut self, grace: Duration) -> Option<u64> {
        let handle = self.live.pop()?;
        handle.stop.send_replace(StopSignal::Graceful {
            deadline: Instant::now() + grace,
        });
        let id = handle.id;
        self.retiring.push(handle);
        Some(id)
    }

    /// Collects VUs that have already returned and gives back their ids.
    pub(crate) async fn reap(&mut self) -> Vec<u64> {
        let mut reaped = Vec::new();
        for list in [&mut self.live, &mut self.retiring] {
            let mut index = 0;
            while index < list.len() {
                if list[index].join.is_finished() {
                    let handle = list.swap_remove(index);
                    reaped.push(handle.id);
                    self.finished.push(join_summary(handle.id, handle.join).await);
                } else {
                    index += 1;
                }
            }
        }
        reaped
    }

    pub(crate) fn live_count(&self) -> u32 {
        u32::try_from(self.live.len()).unwrap_or(u32::MAX)
    }

    /// Live plus retiring VUs.
    pub(crate) fn total_count(&self) -> u32 {
        u32::try_from(self.live.len() + self.retiring.len()).unwrap_or(u32::MAX)
    }

    /// Stops every VU and waits for all of them.
    ///
    /// Live VUs get a graceful stop with `grace`; if `kill` fires while waiting
    /// every remaining VU is force-stopped.
    pub(crate) async fn shutdown(mut self, grace: Duration, kill: &CancellationToken) -> PoolSummary {
        let deadline = Instant::now() + grace;
        let handles: Vec<VuHandle> = self.live.drain(..).chain(self.retiring.drain(..)).collect();

        let mut stops = Vec::with_capacity(handles.len());
        let mut joins = FuturesUnordered::new();
        for handle in handles {
            handle.stop.send_if_modified(|signal| {
                if *signal == StopSignal::Run {
                    *signal = StopSignal::Graceful { deadline };
                    true
                } else {
                    false
                }
            });
            stops.push(handle.stop);
            let id = handle.id;
            joins.push(join_summary(id, handle.join));
        }

        let mut forced = false;
        loop {
            tokio::select! {
                next = joins.next() => match next {
                    Some(summary) => self.finished.push(summary),
                    None => break,
                },
                _ = kill.cancelled(), if !forced => {
                    forced = true;
                    for stop in &stops {
                        stop.send_replace(StopSignal::Forced);
                    }
                }
            }
        }

        self.finished.sort_by_key(|s| s.id);
        PoolSummary {
            peak: self.peak,
            vus: self.finished,
        }
    }
}

pub(crate) struct PoolSummary {
    pub(crate) peak: u32,
    pub(crate) vus: Vec<VuSummary>,
}

async fn join_summary(id: u64, join: JoinHandle<VuSummary>) -> VuSummary {
    match join.await {
        Ok(summary) => summary,
        Err(err) => {
            error!(vu = id, error = %err, "VU task failed");
            VuSummary {
                id,
                iterations: 0,
                actions: 0,
                forced: true,
            }
        }
    }
}
