//! Trend accumulation with a bounded uniform reservoir
//!
//! Count, sum, min and max are exact. Percentiles are computed over a uniform
//! reservoir (Algorithm R) of at most `capacity` samples, so they are exact
//! until a key has seen more than `capacity` samples.
//!
//! Percentile semantics are nearest rank: `rank = ceil(p / 100 * N)` and the
//! result is the `rank`-th smallest sample. `p <= 0` yields the exact minimum
//! and `p >= 100` the exact maximum. Each retained sample carries the weight
//! `count / retained` of its key, which keeps merged (label-filtered) views
//! unbiased when some keys overflowed their reservoir.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Live, mutable accumulation for one trend key.
#[derive(Debug)]
pub(crate) struct TrendState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    reservoir: Vec<f64>,
    capacity: usize,
    rng: StdRng,
}

impl TrendState {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            reservoir: Vec::with_capacity(capacity.min(1024)),
            capacity,
            rng: StdRng::from_entropy(),
        }
    }

    pub(crate) fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if self.reservoir.len() < self.capacity {
            self.reservoir.push(value);
        } else {
            let slot = self.rng.gen_range(0..self.count);
            if let Ok(slot) = usize::try_from(slot) {
                if slot < self.capacity {
                    self.reservoir[slot] = value;
                }
            }
        }
    }

    pub(crate) fn summary(&self) -> TrendSummary {
        let weight = if self.reservoir.is_empty() {
            0.0
        } else {
            self.count as f64 / self.reservoir.len() as f64
        };
        let mut samples: Vec<(f64, f64)> = self.reservoir.iter().map(|v| (*v, weight)).collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));

        TrendSummary {
            count: self.count,
            sum: self.sum,
            min: if self.count == 0 { 0.0 } else { self.min },
            max: if self.count == 0 { 0.0 } else { self.max },
            samples,
        }
    }
}

/// Point-in-time view of a trend (or of several merged trend keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// Retained `(value, weight)` pairs sorted by value.
    #[serde(skip)]
    samples: Vec<(f64, f64)>,
}

impl TrendSummary {
    /// Arithmetic mean of every recorded sample.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Median (`p(50)`).
    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Nearest-rank percentile, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || p.is_nan() {
            return None;
        }
        if p <= 0.0 {
            return Some(self.min);
        }
        if p >= 100.0 {
            return Some(self.max);
        }

        let total: f64 = self.samples.iter().map(|(_, w)| w).sum();
        // `p / 100 * total` drifts above whole ranks (0.07 * 100 = 7.000000000000001).
        let target = (p / 100.0 * total - 1e-9 * total.max(1.0)).ceil().max(1.0);
        let mut cumulative = 0.0;
        for (value, weight) in &self.samples {
            cumulative += weight;
            // Weights are count/retained ratios; tolerate float drift on the rank edge.
            if cumulative + 1e-9 >= target {
                return Some(*value);
            }
        }
        self.samples.last().map(|(v, _)| *v)
    }

    /// Merges several trend views into one population.
    pub fn merge<'a>(parts: impl IntoIterator<Item = &'a TrendSummary>) -> TrendSummary {
        let mut merged = TrendSummary {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Default::default()
        };
        for part in parts {
            if part.count == 0 {
                continue;
            }
            merged.count += part.count;
            merged.sum += part.sum;
            merged.min = merged.min.min(part.min);
            merged.max = merged.max.max(part.max);
            merged.samples.extend_from_slice(&part.samples);
        }
        if merged.count == 0 {
            return TrendSummary::default();
        }
        merged.samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        merged
    }

    /// Number of samples retained for percentile estimation.
    pub fn retained(&self) -> usize {
        self.samples.len()
    }
}
