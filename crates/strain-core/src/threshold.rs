//! Threshold expressions and their evaluation against a metrics snapshot
//!
//! A threshold pairs a metric selector (`probe_duration` or
//! `probe_duration{action:browse_feed}`) with an expression such as
//! `p(95)<500`, `rate<0.01` or `count>=100`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StrainError, StrainResult};
use crate::metrics::{Aggregate, Labels, MetricKind, MetricsSnapshot};

/// Statistic a threshold compares against its bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregation {
    fn parse(input: &str) -> StrainResult<Self> {
        let aggregation = match input {
            "count" => Self::Count,
            "rate" => Self::Rate,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| {
                        StrainError::configuration(format!("unknown aggregation `{other}`"))
                    })?;
                let p: f64 = inner.trim().parse().map_err(|_| {
                    StrainError::configuration(format!("invalid percentile `{other}`"))
                })?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(StrainError::configuration(format!(
                        "percentile `{other}` is outside [0, 100]"
                    )));
                }
                Self::Percentile(p)
            }
        };
        Ok(aggregation)
    }

    /// True when the aggregation can be computed for metrics of `kind`.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Rate => matches!(self, Self::Rate),
            MetricKind::Trend => !matches!(self, Self::Rate),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    // two-character operators first so `<=` is not read as `<`
    const OPERATORS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(self, actual: f64, bound: f64) -> bool {
        match self {
            Self::Lt => actual < bound,
            Self::Le => actual <= bound,
            Self::Gt => actual > bound,
            Self::Ge => actual >= bound,
            Self::Eq => actual == bound,
            Self::Ne => actual != bound,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// Metric name plus an optional label filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSelector {
    pub name: String,
    pub filter: Labels,
}

impl MetricSelector {
    /// Parses `name` or `name{key:value,...}`.
    pub fn parse(input: &str) -> StrainResult<Self> {
        let input = input.trim();
        let (name, filter) = match input.find('{') {
            None => (input, Labels::new()),
            Some(open) => {
                let body = input[open + 1..].strip_suffix('}').ok_or_else(|| {
                    StrainError::configuration(format!("unterminated label filter in `{input}`"))
                })?;
                let mut filter = Labels::new();
                for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let (key, value) = pair.split_once(':').ok_or_else(|| {
                        StrainError::configuration(format!(
                            "label filter `{pair}` in `{input}` is not `key:value`"
                        ))
                    })?;
                    filter.insert(key.trim().to_string(), value.trim().to_string());
                }
                (input[..open].trim(), filter)
            }
        };

        if name.is_empty() {
            return Err(StrainError::configuration(format!(
                "threshold selector `{input}` has no metric name"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            filter,
        })
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.filter.is_empty() {
            let pairs: Vec<String> = self.filter.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            write!(f, "{{{}}}", pairs.join(","))?;
        }
        Ok(())
    }
}

/// A parsed pass/fail criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub selector: MetricSelector,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    /// Expression text as written, e.g. `p(95)<500`.
    pub source: String,
    /// Stop the run as soon as this threshold fails.
    pub abort_on_fail: bool,
    /// Treat a selector without data as passing.
    pub absent_as_pass: bool,
}

impl Threshold {
    /// Parses one expression for the metric selected by `selector`.
    pub fn parse(selector: &str, expr: &str) -> StrainResult<Self> {
        let selector = MetricSelector::parse(selector)?;
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();

        let (position, symbol, comparison) = Comparison::OPERATORS
            .iter()
            .filter_map(|(symbol, cmp)| compact.find(symbol).map(|pos| (pos, *symbol, *cmp)))
            .min_by_key(|(pos, symbol, _)| (*pos, std::cmp::Reverse(symbol.len())))
            .ok_or_else(|| {
                StrainError::configuration(format!("threshold `{expr}` has no comparison operator"))
            })?;

        let aggregation = Aggregation::parse(&compact[..position])?;
        let bound_text = &compact[position + symbol.len()..];
        let bound: f64 = bound_text.parse().map_err(|_| {
            StrainError::configuration(format!("threshold `{expr}` has an invalid bound `{bound_text}`"))
        })?;
        if !bound.is_finite() {
            return Err(StrainError::configuration(format!(
                "threshold `{expr}` bound must be finite"
            )));
        }

        Ok(Self {
            selector,
            aggregation,
            comparison,
            bound,
            source: compact,
            abort_on_fail: false,
            absent_as_pass: false,
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    pub fn with_absent_as_pass(mut self, absent_as_pass: bool) -> Self {
        self.absent_as_pass = absent_as_pass;
        self
    }

    /// Rejects aggregations that make no sense for the metric kind.
    pub fn check_kind(&self, kind: MetricKind) -> StrainResult<()> {
        if self.aggregation.applies_to(kind) {
            Ok(())
        } else {
            Err(StrainError::configuration(format!(
                "threshold `{}` on `{}`: `{}` cannot be computed for a {kind}",
                self.source, self.selector, self.aggregation
            )))
        }
    }

    /// Evaluates against one snapshot.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdStatus {
        match self.actual(snapshot) {
            Some(actual) if self.comparison.holds(actual, self.bound) => {
                ThresholdStatus::Passed { actual }
            }
            Some(actual) => ThresholdStatus::Failed { actual },
            None => ThresholdStatus::NoData,
        }
    }

    fn actual(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        let aggregate = snapshot.aggregate(&self.selector.name, &self.selector.filter)?;
        if aggregate.is_empty() {
            return None;
        }

        match (&aggregate, self.aggregation) {
            (Aggregate::Counter { count }, Aggregation::Count) => Some(*count as f64),
            (Aggregate::Counter { count }, Aggregation::Rate) => {
                let secs = snapshot.elapsed.as_secs_f64();
                (secs > 0.0).then(|| *count as f64 / secs)
            }
            (Aggregate::Rate { .. }, Aggregation::Rate) => aggregate.ratio(),
            (Aggregate::Trend(trend), aggregation) => match aggregation {
                Aggregation::Count => Some(trend.count as f64),
                Aggregation::Avg => trend.mean(),
                Aggregation::Min => Some(trend.min),
                Aggregation::Max => Some(trend.max),
                Aggregation::Med => trend.median(),
                Aggregation::Percentile(p) => trend.percentile(p),
                Aggregation::Rate => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}{}{}",
            self.selector,
            self.aggregation,
            self.comparison.symbol(),
            self.bound
        )
    }
}

/// Outcome of evaluating one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThresholdStatus {
    Passed { actual: f64 },
    Failed { actual: f64 },
    /// No sample matched the selector.
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    /// Selector as written, e.g. `probe_duration{action:browse_feed}`.
    pub metric: String,
    pub expression: String,
    #[serde(flatten)]
    pub status: ThresholdStatus,
    pub absent_as_pass: bool,
}

impl ThresholdResult {
    /// True when this result counts as a pass in the verdict.
    pub fn is_pass(&self) -> bool {
        match self.status {
            ThresholdStatus::Passed { .. } => true,
            ThresholdStatus::Failed { .. } => false,
            ThresholdStatus::NoData => self.absent_as_pass,
        }
    }
}

/// A failed threshold and the value that failed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub metric: String,
    pub expression: String,
    pub actual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every threshold passed (or none were configured).
    Passed,
    /// At least one threshold failed.
    Failed,
    /// Nothing failed, but some threshold had no data.
    NoData,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::NoData => "NO DATA",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub verdict: Verdict,
    pub pass: bool,
    pub violations: Vec<Violation>,
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    pub fn empty() -> Self {
        Self {
            verdict: Verdict::Passed,
            pass: true,
            violations: Vec::new(),
            results: Vec::new(),
        }
    }
}

/// Evaluates every threshold against `snapshot`.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> ThresholdReport {
    let results: Vec<ThresholdResult> = thresholds
        .iter()
        .map(|t| ThresholdResult {
            metric: t.selector.to_string(),
            expression: t.source.clone(),
            status: t.evaluate(snapshot),
            absent_as_pass: t.absent_as_pass,
        })
        .collect();

    let violations: Vec<Violation> = results
        .iter()
        .filter_map(|r| match r.status {
            ThresholdStatus::Failed { actual } => Some(Violation {
                metric: r.metric.clone(),
                expression: r.expression.clone(),
                actual,
            }),
            _ => None,
        })
        .collect();

    let verdict = if !violations.is_empty() {
        Verdict::Failed
    } else if results.iter().all(ThresholdResult::is_pass) {
        Verdict::Passed
    } else {
        Verdict::NoData
    };

    ThresholdReport {
        pass: verdict == Verdict::Passed,
        verdict,
        violations,
        results,
    }
}
