use std::path::PathBuf;

use thiserror::Error;

use crate::metrics::MetricKind;

/// Canonical error type for run preparation and execution.
#[derive(Debug, Error)]
pub enum StrainError {
    /// The run configuration is malformed. Raised before any VU is spawned.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable description of the offending setting.
        message: String,
    },

    /// A dataset file could not be read.
    #[error("dataset `{name}` could not be loaded from {path}: {source}")]
    Dataset {
        /// Dataset name as declared in the profile.
        name: String,
        /// File the dataset was read from.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A sample was rejected by the metric sink.
    #[error(transparent)]
    Metric(#[from] MetricError),

    /// I/O error while writing reports or reading profiles.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure (a task panicked, a channel closed early).
    #[error("internal error: {message}")]
    Internal {
        /// Details for debugging purposes.
        message: String,
    },
}

impl StrainError {
    /// Creates a `Configuration` variant.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors that must halt startup before traffic is generated.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Dataset { .. })
    }
}

impl From<config::ConfigError> for StrainError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Recorder-level rejection of a metric sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    /// The value cannot be represented by the metric kind (NaN, negative duration, ...).
    #[error("metric `{name}` rejected sample {value}: {reason}")]
    InvalidSample {
        /// Metric name.
        name: String,
        /// Offending value.
        value: f64,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// The metric name is already registered with another kind.
    #[error("metric `{name}` is a {existing} and cannot record {requested} samples")]
    KindMismatch {
        /// Metric name.
        name: String,
        /// Kind the metric was first declared with.
        existing: MetricKind,
        /// Kind used by the rejected call.
        requested: MetricKind,
    },
}

/// Convenient result alias for strain operations.
pub type StrainResult<T> = Result<T, StrainError>;
