//! Point-in-time metric views

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Labels, MetricKind, SeriesKey, TrendSummary};

/// Aggregate of one series at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeriesSnapshot {
    Counter { count: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendSummary),
}

impl SeriesSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }
}

/// One `(name, labels)` series in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub name: String,
    pub labels: Labels,
    pub value: SeriesSnapshot,
}

impl SeriesEntry {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.name.clone(), self.labels.clone())
    }
}

/// Warning-level conditions raised while the run was in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum RunCondition {
    /// An arrival-rate scenario could not start iterations at the configured rate.
    CapacityExceeded {
        scenario: String,
        /// Iteration starts dropped so far.
        dropped: u64,
        /// VU pool ceiling that was exhausted.
        max_vus: u32,
        #[serde(with = "humantime_serde")]
        first_seen: Duration,
        #[serde(with = "humantime_serde")]
        last_seen: Duration,
    },
}

/// Several series of one metric merged under a label filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Counter { count: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendSummary),
}

impl Aggregate {
    /// True when the merged population holds no samples at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Counter { .. } => false,
            Self::Rate { total, .. } => *total == 0,
            Self::Trend(summary) => summary.count == 0,
        }
    }

    /// Ratio of `true` samples for rates.
    pub fn ratio(&self) -> Option<f64> {
        match self {
            Self::Rate { trues, total } if *total > 0 => Some(*trues as f64 / *total as f64),
            _ => None,
        }
    }
}

/// Consistent point-in-time view of the metric sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Time elapsed since the sink was created.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Series sorted by `(name, labels)`.
    pub series: Vec<SeriesEntry>,
    pub conditions: Vec<RunCondition>,
    /// Samples rejected by the recorder (NaN, negative durations, kind mismatches).
    pub rejected_samples: u64,
}

impl MetricsSnapshot {
    /// Series of `name` whose labels contain every pair of `filter`.
    pub fn select<'a>(
        &'a self,
        name: &'a str,
        filter: &'a Labels,
    ) -> impl Iterator<Item = &'a SeriesEntry> + 'a {
        self.series.iter().filter(move |entry| {
            entry.name == name
                && filter.iter().all(|(k, v)| {
                    entry.labels.get(k).map(String::as_str) == Some(v.as_str())
                })
        })
    }

    /// Merges the selected series. `None` when nothing matched.
    pub fn aggregate(&self, name: &str, filter: &Labels) -> Option<Aggregate> {
        let entries: Vec<&SeriesEntry> = self.select(name, filter).collect();
        let first = entries.first()?;

        let aggregate = match first.value.kind() {
            MetricKind::Counter => Aggregate::Counter {
                count: entries
                    .iter()
                    .map(|e| match e.value {
                        SeriesSnapshot::Counter { count } => count,
                        _ => 0,
                    })
                    .sum(),
            },
            MetricKind::Rate => {
                let (trues, total) = entries.iter().fold((0, 0), |(t, n), e| match e.value {
                    SeriesSnapshot::Rate { trues, total } => (t + trues, n + total),
                    _ => (t, n),
                });
                Aggregate::Rate { trues, total }
            }
            MetricKind::Trend => Aggregate::Trend(TrendSummary::merge(entries.iter().filter_map(
                |e| match &e.value {
                    SeriesSnapshot::Trend(summary) => Some(summary),
                    _ => None,
                },
            ))),
        };
        Some(aggregate)
    }

    /// Total of a counter across the selected series (zero when absent).
    pub fn counter(&self, name: &str, filter: &Labels) -> u64 {
        match self.aggregate(name, filter) {
            Some(Aggregate::Counter { count }) => count,
            _ => 0,
        }
    }

    /// Merged trend across the selected series.
    pub fn trend(&self, name: &str, filter: &Labels) -> Option<TrendSummary> {
        match self.aggregate(name, filter) {
            Some(Aggregate::Trend(summary)) => Some(summary),
            _ => None,
        }
    }

    /// Merged rate ratio across the selected series.
    pub fn rate(&self, name: &str, filter: &Labels) -> Option<f64> {
        self.aggregate(name, filter).and_then(|a| a.ratio())
    }

    /// True when an arrival-rate scenario reported dropped iterations.
    pub fn capacity_exceeded(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c, RunCondition::CapacityExceeded { .. }))
    }
}
