//! Result of a single probe invocation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::Labels;

/// How a probe invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The probe returned, successfully or with an error.
    Completed,
    /// The probe was abandoned by a stop signal.
    Forced,
}

/// Immutable record of one probe invocation, consumed by the metric sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Measured duration in milliseconds. Always `0` for forced outcomes.
    pub duration_ms: f64,
    pub labels: Labels,
    pub termination: Termination,
}

impl Outcome {
    /// Outcome of a probe that returned.
    pub fn completed(success: bool, duration: Duration, labels: Labels) -> Self {
        Self {
            success,
            duration_ms: duration.as_nanos() as f64 / 1_000_000.0,
            labels,
            termination: Termination::Completed,
        }
    }

    /// Outcome of a probe abandoned by a stop signal.
    pub fn forced(labels: Labels) -> Self {
        Self {
            success: false,
            duration_ms: 0.0,
            labels,
            termination: Termination::Forced,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.termination == Termination::Forced
    }
}
