use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::builtin;
use super::snapshot::{MetricsSnapshot, RunCondition, SeriesEntry, SeriesSnapshot};
use super::trend::TrendState;
use super::{Labels, MetricDecl, MetricKind, SeriesKey};
use crate::error::MetricError;
use crate::outcome::{Outcome, Termination};

/// Default number of samples retained per trend key for percentile estimation.
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 100_000;

#[derive(Debug)]
enum Series {
    Counter(AtomicU64),
    Rate { trues: AtomicU64, total: AtomicU64 },
    Trend(Mutex<TrendState>),
}

impl Series {
    fn new(kind: MetricKind, reservoir_capacity: usize) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(AtomicU64::new(0)),
            MetricKind::Rate => Self::Rate {
                trues: AtomicU64::new(0),
                total: AtomicU64::new(0),
            },
            MetricKind::Trend => Self::Trend(Mutex::new(TrendState::new(reservoir_capacity))),
        }
    }

    fn add(&self, value: f64) {
        match self {
            Self::Counter(count) => {
                count.fetch_add(value as u64, Ordering::SeqCst);
            }
            Self::Rate { trues, total } => {
                // total first: a reader loading trues before total never sees trues > total
                total.fetch_add(1, Ordering::SeqCst);
                if value != 0.0 {
                    trues.fetch_add(1, Ordering::SeqCst);
                }
            }
            Self::Trend(state) => state.lock().add(value),
        }
    }

    fn snapshot(&self) -> SeriesSnapshot {
        match self {
            Self::Counter(count) => SeriesSnapshot::Counter {
                count: count.load(Ordering::SeqCst),
            },
            Self::Rate { trues, total } => {
                let trues = trues.load(Ordering::SeqCst);
                let total = total.load(Ordering::SeqCst);
                SeriesSnapshot::Rate { trues, total }
            }
            Self::Trend(state) => SeriesSnapshot::Trend(state.lock().summary()),
        }
    }
}

/// Shared, append-only metric store for one run.
///
/// Lookups of existing keys take a read lock only; counters and rates are
/// atomics, trends lock their own key. Writers on different keys never contend
/// beyond the brief read lock on the key map.
#[derive(Debug)]
pub struct MetricSink {
    started: Instant,
    reservoir_capacity: usize,
    kinds: RwLock<HashMap<String, MetricKind>>,
    series: RwLock<HashMap<SeriesKey, Arc<Series>>>,
    rejected: AtomicU64,
    conditions: Mutex<Vec<RunCondition>>,
}

impl MetricSink {
    /// Creates a sink with the default reservoir capacity.
    pub fn new() -> Self {
        Self::with_reservoir_capacity(DEFAULT_RESERVOIR_CAPACITY)
    }

    /// Creates a sink retaining at most `capacity` samples per trend key.
    pub fn with_reservoir_capacity(capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            reservoir_capacity: capacity.max(1),
            kinds: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            rejected: AtomicU64::new(0),
            conditions: Mutex::new(Vec::new()),
        }
    }

    /// Registers a metric family ahead of its first sample.
    pub fn declare(&self, decl: &MetricDecl) -> Result<(), MetricError> {
        self.ensure_kind(&decl.name, decl.kind)
    }

    /// Kind of a declared or recorded metric.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.kinds.read().get(name).copied()
    }

    /// All known metric names with their kinds.
    pub fn declared(&self) -> Vec<MetricDecl> {
        let mut decls: Vec<MetricDecl> = self
            .kinds
            .read()
            .iter()
            .map(|(name, kind)| MetricDecl::new(name.clone(), *kind))
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Appends one sample.
    ///
    /// Counter values must be non-negative integers, trend values are
    /// non-negative durations in milliseconds, rate values are `0` (false) or
    /// anything else (true). Rejected samples are counted and reported.
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        labels: &Labels,
    ) -> Result<(), MetricError> {
        let result = Self::validate(name, kind, value).and_then(|()| self.ensure_kind(name, kind));
        if let Err(err) = result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        self.series_for(name, kind, labels).add(value);
        Ok(())
    }

    /// Adds `value` to a counter.
    pub fn add_counter(&self, name: &str, value: u64, labels: &Labels) -> Result<(), MetricError> {
        self.record(name, MetricKind::Counter, value as f64, labels)
    }

    /// Adds one boolean sample to a rate.
    pub fn add_rate(&self, name: &str, hit: bool, labels: &Labels) -> Result<(), MetricError> {
        self.record(name, MetricKind::Rate, if hit { 1.0 } else { 0.0 }, labels)
    }

    /// Adds one duration sample to a trend.
    pub fn add_duration(
        &self,
        name: &str,
        duration: Duration,
        labels: &Labels,
    ) -> Result<(), MetricError> {
        let millis = duration.as_nanos() as f64 / 1_000_000.0;
        self.record(name, MetricKind::Trend, millis, labels)
    }

    /// Fans a probe outcome out to the built-in metrics.
    ///
    /// Counters and the failure rate are keyed by `scenario` and `action`;
    /// the duration trend keeps every outcome label. Forced outcomes carry a
    /// duration sentinel and are kept out of the duration trend.
    pub fn record_outcome(&self, outcome: &Outcome) -> Result<(), MetricError> {
        let base: Labels = outcome
            .labels
            .iter()
            .filter(|(k, _)| {
                k.as_str() == builtin::LABEL_SCENARIO || k.as_str() == builtin::LABEL_ACTION
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.add_counter(builtin::PROBE_ATTEMPTS, 1, &base)?;
        self.add_rate(builtin::PROBE_FAILED, !outcome.success, &base)?;
        if outcome.success {
            self.add_counter(builtin::PROBE_SUCCESSES, 1, &base)?;
        }

        match outcome.termination {
            Termination::Completed => {
                self.record(
                    builtin::PROBE_DURATION,
                    MetricKind::Trend,
                    outcome.duration_ms,
                    &outcome.labels,
                )?;
            }
            Termination::Forced => {
                self.add_counter(builtin::FORCED_TERMINATIONS, 1, &base)?;
            }
        }
        Ok(())
    }

    /// Records dropped iteration starts and raises (or extends) the capacity condition.
    pub fn raise_capacity_exceeded(&self, scenario: &str, dropped: u64, max_vus: u32) {
        let labels: Labels = [(builtin::LABEL_SCENARIO.to_string(), scenario.to_string())]
            .into_iter()
            .collect();
        if let Err(err) = self.add_counter(builtin::DROPPED_ITERATIONS, dropped, &labels) {
            tracing::error!(error = %err, "Failed to record dropped iterations");
        }

        let now = self.elapsed();
        self.raise(RunCondition::CapacityExceeded {
            scenario: scenario.to_string(),
            dropped,
            max_vus,
            first_seen: now,
            last_seen: now,
        });
    }

    /// Stores a warning-level run condition.
    ///
    /// A condition for a scenario that already has one of the same kind is
    /// folded into the existing entry.
    pub fn raise(&self, condition: RunCondition) {
        let mut conditions = self.conditions.lock();
        let RunCondition::CapacityExceeded {
            scenario,
            dropped,
            last_seen,
            ..
        } = &condition;

        let existing = conditions.iter_mut().find_map(|c| match c {
            RunCondition::CapacityExceeded {
                scenario: s,
                dropped,
                last_seen,
                ..
            } if *s == *scenario => Some((dropped, last_seen)),
            _ => None,
        });

        match existing {
            Some((total, seen)) => {
                *total += *dropped;
                *seen = *last_seen;
            }
            None => conditions.push(condition),
        }
    }

    /// Time elapsed since the sink was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Number of samples rejected so far.
    pub fn rejected_samples(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Consistent point-in-time aggregate view of every key.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_where(|_| true)
    }

    /// Snapshot restricted to the named metrics.
    pub fn snapshot_of(&self, names: &[&str]) -> MetricsSnapshot {
        self.snapshot_where(|name| names.contains(&name))
    }

    fn snapshot_where(&self, include: impl Fn(&str) -> bool) -> MetricsSnapshot {
        let series: Vec<(SeriesKey, Arc<Series>)> = self
            .series
            .read()
            .iter()
            .filter(|(k, _)| include(&k.name))
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut entries: Vec<SeriesEntry> = series
            .into_iter()
            .map(|(key, series)| SeriesEntry {
                name: key.name,
                labels: key.labels,
                value: series.snapshot(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        MetricsSnapshot {
            elapsed: self.elapsed(),
            series: entries,
            conditions: self.conditions.lock().clone(),
            rejected_samples: self.rejected_samples(),
        }
    }

    fn validate(name: &str, kind: MetricKind, value: f64) -> Result<(), MetricError> {
        let reason = match kind {
            _ if value.is_nan() => Some("value is NaN"),
            MetricKind::Counter if value.is_infinite() => Some("counter increments must be finite"),
            MetricKind::Counter if value < 0.0 => Some("counters never decrease"),
            MetricKind::Counter if value.fract() != 0.0 => Some("counter increments must be integers"),
            MetricKind::Trend if value.is_infinite() => Some("durations must be finite"),
            MetricKind::Trend if value < 0.0 => Some("durations must not be negative"),
            _ => None,
        };

        match reason {
            Some(reason) => Err(MetricError::InvalidSample {
                name: name.to_string(),
                value,
                reason,
            }),
            None => Ok(()),
        }
    }

    fn ensure_kind(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        if let Some(existing) = self.kinds.read().get(name).copied() {
            return Self::same_kind(name, existing, kind);
        }

        let mut kinds = self.kinds.write();
        let existing = *kinds.entry(name.to_string()).or_insert(kind);
        Self::same_kind(name, existing, kind)
    }

    fn same_kind(name: &str, existing: MetricKind, requested: MetricKind) -> Result<(), MetricError> {
        if existing == requested {
            Ok(())
        } else {
            Err(MetricError::KindMismatch {
                name: name.to_string(),
                existing,
                requested,
            })
        }
    }

    fn series_for(&self, name: &str, kind: MetricKind, labels: &Labels) -> Arc<Series> {
        let key = SeriesKey::new(name, labels.clone());
        if let Some(series) = self.series.read().get(&key) {
            return Arc::clone(series);
        }

        let mut map = self.series.write();
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(Series::new(kind, self.reservoir_capacity))),
        )
    }
}

impl Default for MetricSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::labels;

    #[tokio::test]
    async fn test_counter_and_rate_recording() {
        let sink = MetricSink::new();
        let l = labels([("action", "browse_feed")]);

        sink.add_counter("probe_attempts", 1, &l).unwrap();
        sink.add_counter("probe_attempts", 2, &l).unwrap();
        sink.add_rate("probe_failed", true, &l).unwrap();
        sink.add_rate("probe_failed", false, &l).unwrap();
        sink.add_rate("probe_failed", false, &l).unwrap();

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.counter("probe_attempts", &Labels::new()), 3);
        let ratio = snapshot.rate("probe_failed", &l).unwrap();
        assert!((ratio - 1.0 / 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_new_label_combination_creates_key() {
        let sink = MetricSink::new();
        sink.add_counter("iterations", 1, &labels([("scenario", "a")])).unwrap();
        sink.add_counter("iterations", 1, &labels([("scenario", "b")])).unwrap();

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.series.len(), 2);
        assert_eq!(snapshot.counter("iterations", &labels([("scenario", "b")])), 1);
        assert_eq!(snapshot.counter("iterations", &Labels::new()), 2);
    }

    #[tokio::test]
    async fn test_invalid_samples_are_rejected_and_counted() {
        let sink = MetricSink::new();
        let l = Labels::new();

        let err = sink.record("probe_duration", MetricKind::Trend, f64::NAN, &l).unwrap_err();
        assert!(matches!(err, MetricError::InvalidSample { .. }));
        assert!(sink.record("probe_duration", MetricKind::Trend, -1.0, &l).is_err());
        assert!(sink.record("probe_attempts", MetricKind::Counter, -3.0, &l).is_err());
        assert!(sink.record("probe_attempts", MetricKind::Counter, 0.5, &l).is_err());

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.rejected_samples, 4);
        assert!(snapshot.series.is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected() {
        let sink = MetricSink::new();
        sink.declare(&MetricDecl::new("feed_duration", MetricKind::Trend)).unwrap();

        let err = sink
            .add_counter("feed_duration", 1, &Labels::new())
            .unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                name: "feed_duration".to_string(),
                existing: MetricKind::Trend,
                requested: MetricKind::Counter,
            }
        );
        assert_eq!(sink.kind_of("feed_duration"), Some(MetricKind::Trend));
    }

    #[tokio::test]
    async fn test_forced_outcome_skips_duration_trend() {
        let sink = MetricSink::new();
        let l = labels([("scenario", "feed"), ("action", "browse_feed")]);

        sink.record_outcome(&Outcome::completed(true, Duration::from_millis(40), l.clone()))
            .unwrap();
        sink.record_outcome(&Outcome::forced(l.clone())).unwrap();

        let snapshot = sink.snapshot();
        let none = Labels::new();
        assert_eq!(snapshot.counter(builtin::PROBE_ATTEMPTS, &none), 2);
        assert_eq!(snapshot.counter(builtin::PROBE_SUCCESSES, &none), 1);
        assert_eq!(snapshot.counter(builtin::FORCED_TERMINATIONS, &none), 1);
        assert_eq!(snapshot.rate(builtin::PROBE_FAILED, &none), Some(0.5));
        assert_eq!(snapshot.trend(builtin::PROBE_DURATION, &none).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_capacity_condition_accumulates_per_scenario() {
        let sink = MetricSink::new();
        sink.raise_capacity_exceeded("seed", 3, 10);
        sink.raise_capacity_exceeded("seed", 2, 10);

        let snapshot = sink.snapshot();
        assert!(snapshot.capacity_exceeded());
        assert_eq!(snapshot.conditions.len(), 1);
        match &snapshot.conditions[0] {
            RunCondition::CapacityExceeded { dropped, .. } => assert_eq!(*dropped, 5),
        }
        assert_eq!(
            snapshot.counter(builtin::DROPPED_ITERATIONS, &labels([("scenario", "seed")])),
            5
        );
    }

    #[test]
    fn test_counter_monotonic_under_concurrency() {
        let sink = Arc::new(MetricSink::new());
        let l = Labels::new();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let sink = Arc::clone(&sink);
                let l = l.clone();
                scope.spawn(move || {
                    for _ in 0..1_000 {
                        sink.add_counter("probe_attempts", 1, &l).unwrap();
                    }
                });
            }

            let mut last = 0;
            for _ in 0..100 {
                let current = sink.snapshot().counter("probe_attempts", &l);
                assert!(current >= last, "counter went from {last} to {current}");
                last = current;
            }
        });

        assert_eq!(sink.snapshot().counter("probe_attempts", &l), 8_000);
    }
}
