//! Report generation for finished runs

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use strain_core::metrics::{SeriesEntry, SeriesSnapshot};
use strain_core::{RunCondition, StrainError, StrainResult, ThresholdStatus, TrendSummary};

use crate::runner::RunReport;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Plain text, meant for a terminal.
    #[default]
    Summary,
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = StrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "summary" | "text" => Ok(Self::Summary),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(StrainError::configuration(format!(
                "unknown report format `{other}` (expected summary, markdown or json)"
            ))),
        }
    }
}

/// Percentiles shown for every trend key.
const PERCENTILES: [(&str, f64); 3] = [("p90", 90.0), ("p95", 95.0), ("p99", 99.0)];

/// Renders a [`RunReport`].
pub struct ReportWriter<'a> {
    report: &'a RunReport,
}

impl<'a> ReportWriter<'a> {
    pub fn new(report: &'a RunReport) -> Self {
        Self { report }
    }

    pub fn render(&self, format: ReportFormat) -> StrainResult<String> {
        match format {
            ReportFormat::Summary => Ok(self.generate_summary()),
            ReportFormat::Markdown => Ok(self.generate_markdown()),
            ReportFormat::Json => self.generate_json(),
        }
    }

    /// Write report to file
    pub fn write(&self, path: impl AsRef<Path>, format: ReportFormat) -> StrainResult<()> {
        let content = self.render(format)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    fn generate_summary(&self) -> String {
        let report = self.report;
        let mut out = String::new();
        let _ = writeln!(out, "run {} ({})", report.name, report.run_id);
        let _ = writeln!(
            out,
            "duration: {:.1}s  verdict: {}{}",
            report.duration().as_secs_f64(),
            report.verdict(),
            stop_note(report)
        );

        out.push_str("\nscenarios\n");
        for s in &report.scenarios {
            let _ = writeln!(
                out,
                "  {:<24} {:<22} peak_vus={:<5} iterations={:<8} dropped={:<6} forced={}",
                s.name, s.executor, s.peak_vus, s.iterations, s.dropped_iterations, s.forced_vus
            );
        }

        out.push_str("\nmetrics\n");
        let elapsed = report.duration().as_secs_f64();
        for entry in &report.snapshot.series {
            let _ = writeln!(out, "  {:<60} {}", series_label(entry), series_line(entry, elapsed));
        }

        if !report.thresholds.results.is_empty() {
            out.push_str("\nthresholds\n");
            for result in &report.thresholds.results {
                let (mark, actual) = match result.status {
                    ThresholdStatus::Passed { actual } => ("✓", format!("{actual:.2}")),
                    ThresholdStatus::Failed { actual } => ("✗", format!("{actual:.2}")),
                    ThresholdStatus::NoData if result.absent_as_pass => ("✓", "no data".to_string()),
                    ThresholdStatus::NoData => ("?", "no data".to_string()),
                };
                let _ = writeln!(
                    out,
                    "  {mark} {} {} (actual {actual})",
                    result.metric, result.expression
                );
            }
        }

        if !report.snapshot.conditions.is_empty() {
            out.push_str("\nconditions\n");
            for condition in &report.snapshot.conditions {
                let _ = writeln!(out, "  {}", condition_line(condition));
            }
        }
        if report.snapshot.rejected_samples > 0 {
            let _ = writeln!(
                out,
                "\n{} metric samples were rejected",
                report.snapshot.rejected_samples
            );
        }
        out
    }

    fn generate_markdown(&self) -> String {
        let report = self.report;
        let pass_emoji = if report.thresholds.pass { "✅" } else { "❌" };
        let elapsed = report.duration().as_secs_f64();

        let mut scenarios = String::from(
            "| Scenario | Executor | Peak VUs | Iterations | Dropped | Forced VUs |\n\
             |----------|----------|----------|------------|---------|------------|\n",
        );
        for s in &report.scenarios {
            let _ = writeln!(
                scenarios,
                "| {} | {} | {} | {} | {} | {} |",
                s.name, s.executor, s.peak_vus, s.iterations, s.dropped_iterations, s.forced_vus
            );
        }

        let mut trends = String::from(
            "| Metric | Count | Avg | Min | Med | P90 | P95 | P99 | Max |\n\
             |--------|-------|-----|-----|-----|-----|-----|-----|-----|\n",
        );
        let mut others = String::from("| Metric | Value |\n|--------|-------|\n");
        for entry in &report.snapshot.series {
            match &entry.value {
                SeriesSnapshot::Trend(summary) => {
                    let stats = TrendStats::of(summary);
                    let _ = writeln!(
                        trends,
                        "| `{}` | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} |",
                        series_label(entry),
                        summary.count,
                        stats.avg,
                        stats.min,
                        stats.med,
                        stats.percentiles[0],
                        stats.percentiles[1],
                        stats.percentiles[2],
                        stats.max
                    );
                }
                _ => {
                    let _ = writeln!(
                        others,
                        "| `{}` | {} |",
                        series_label(entry),
                        series_line(entry, elapsed)
                    );
                }
            }
        }

        let thresholds = if report.thresholds.results.is_empty() {
            "No thresholds configured".to_string()
        } else {
            let mut table = String::from(
                "| Metric | Expression | Actual | Status |\n|--------|------------|--------|--------|\n",
            );
            for result in &report.thresholds.results {
                let (actual, status) = match result.status {
                    ThresholdStatus::Passed { actual } => (format!("{actual:.2}"), "✅"),
                    ThresholdStatus::Failed { actual } => (format!("{actual:.2}"), "❌"),
                    ThresholdStatus::NoData if result.absent_as_pass => ("-".to_string(), "✅"),
                    ThresholdStatus::NoData => ("-".to_string(), "⚠️"),
                };
                let _ = writeln!(
                    table,
                    "| `{}` | `{}` | {} | {} |",
                    result.metric, result.expression, actual, status
                );
            }
            table
        };

        let conditions = if report.snapshot.conditions.is_empty() {
            "No conditions raised".to_string()
        } else {
            report
                .snapshot
                .conditions
                .iter()
                .map(|c| format!("- {}", condition_line(c)))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"# Load Test Report: {}

**Status**: {} {}{}

---

## Summary

- **Run ID**: {}
- **Started**: {}
- **Finished**: {}
- **Duration**: {:.1} seconds
- **Rejected samples**: {}

---

## Scenarios

{}
---

## Trends (ms)

{}
---

## Counters and Rates

{}
---

## Thresholds

{}

---

## Conditions

{}

---

**Report Generated**: {}
"#,
            report.name,
            pass_emoji,
            report.verdict(),
            stop_note(report),
            report.run_id,
            report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            elapsed,
            report.snapshot.rejected_samples,
            scenarios,
            trends,
            others,
            thresholds,
            conditions,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    fn generate_json(&self) -> StrainResult<String> {
        let report = self.report;
        let elapsed = report.duration().as_secs_f64();
        let metrics: Vec<serde_json::Value> = report
            .snapshot
            .series
            .iter()
            .map(|entry| {
                let value = match &entry.value {
                    SeriesSnapshot::Counter { count } => serde_json::json!({
                        "kind": "counter",
                        "count": count,
                        "per_second": per_second(*count, elapsed),
                    }),
                    SeriesSnapshot::Rate { trues, total } => serde_json::json!({
                        "kind": "rate",
                        "trues": trues,
                        "total": total,
                        "rate": ratio(*trues, *total),
                    }),
                    SeriesSnapshot::Trend(summary) => {
                        let stats = TrendStats::of(summary);
                        serde_json::json!({
                            "kind": "trend",
                            "count": summary.count,
                            "avg": stats.avg,
                            "min": stats.min,
                            "med": stats.med,
                            "p90": stats.percentiles[0],
                            "p95": stats.percentiles[1],
                            "p99": stats.percentiles[2],
                            "max": stats.max,
                        })
                    }
                };
                serde_json::json!({
                    "name": entry.name,
                    "labels": entry.labels,
                    "value": value,
                })
            })
            .collect();

        let document = serde_json::json!({
            "run_id": report.run_id,
            "name": report.name,
            "started_at": report.started_at,
            "finished_at": report.finished_at,
            "duration_seconds": elapsed,
            "verdict": report.verdict(),
            "exit_code": report.exit_code(),
            "aborted_by_threshold": report.aborted_by_threshold,
            "interrupted": report.interrupted,
            "scenarios": report.scenarios,
            "metrics": metrics,
            "thresholds": report.thresholds,
            "conditions": report.snapshot.conditions,
            "rejected_samples": report.snapshot.rejected_samples,
        });
        serde_json::to_string_pretty(&document)
            .map_err(|e| StrainError::internal(format!("failed to serialize report: {e}")))
    }
}

struct TrendStats {
    avg: f64,
    min: f64,
    med: f64,
    max: f64,
    percentiles: [f64; 3],
}

impl TrendStats {
    fn of(summary: &TrendSummary) -> Self {
        let pick = |p: f64| summary.percentile(p).unwrap_or(0.0);
        Self {
            avg: summary.mean().unwrap_or(0.0),
            min: if summary.count > 0 { summary.min } else { 0.0 },
            med: pick(50.0),
            max: if summary.count > 0 { summary.max } else { 0.0 },
            percentiles: PERCENTILES.map(|(_, p)| pick(p)),
        }
    }
}

fn series_label(entry: &SeriesEntry) -> String {
    entry.key().to_string()
}

fn series_line(entry: &SeriesEntry, elapsed: f64) -> String {
    match &entry.value {
        SeriesSnapshot::Counter { count } => {
            format!("{count} ({:.2}/s)", per_second(*count, elapsed))
        }
        SeriesSnapshot::Rate { trues, total } => {
            format!("{:.2}% ({trues} of {total})", ratio(*trues, *total) * 100.0)
        }
        SeriesSnapshot::Trend(summary) => {
            let stats = TrendStats::of(summary);
            let mut line = format!(
                "count={} avg={:.2} min={:.2} med={:.2}",
                summary.count, stats.avg, stats.min, stats.med
            );
            for ((label, _), value) in PERCENTILES.iter().zip(stats.percentiles) {
                let _ = write!(line, " {label}={value:.2}");
            }
            let _ = write!(line, " max={:.2}", stats.max);
            line
        }
    }
}

fn condition_line(condition: &RunCondition) -> String {
    match condition {
        RunCondition::CapacityExceeded {
            scenario,
            dropped,
            max_vus,
            first_seen,
            last_seen,
        } => format!(
            "capacity exceeded in `{scenario}`: {dropped} iterations dropped with max_vus={max_vus} \
             (between {:.1}s and {:.1}s)",
            first_seen.as_secs_f64(),
            last_seen.as_secs_f64()
        ),
    }
}

fn stop_note(report: &RunReport) -> &'static str {
    if report.aborted_by_threshold {
        " (aborted by threshold)"
    } else if report.interrupted {
        " (interrupted)"
    } else {
        ""
    }
}

fn per_second(count: u64, elapsed: f64) -> f64 {
    if elapsed > 0.0 {
        count as f64 / elapsed
    } else {
        0.0
    }
}

fn ratio(trues: u64, total: u64) -> f64 {
    if total > 0 {
        trues as f64 / total as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use strain_core::metrics::{builtin, labels};
    use strain_core::threshold::evaluate;
    use strain_core::{MetricKind, MetricSink, Threshold};
    use uuid::Uuid;

    use super::*;

    fn report() -> RunReport {
        let sink = MetricSink::new();
        for decl in builtin::declarations() {
            sink.declare(&decl).unwrap();
        }
        let l = labels([("scenario", "feed"), ("action", "browse_feed")]);
        for ms in [10.0, 20.0, 30.0, 40.0] {
            sink.record(builtin::PROBE_DURATION, MetricKind::Trend, ms, &l)
                .unwrap();
        }
        sink.add_counter(builtin::PROBE_ATTEMPTS, 4, &l).unwrap();
        sink.add_rate(builtin::PROBE_FAILED, false, &l).unwrap();
        sink.raise_capacity_exceeded("feed", 3, 10);

        let snapshot = sink.snapshot();
        let thresholds = vec![
            Threshold::parse("probe_duration", "p(95)<500").unwrap(),
            Threshold::parse("probe_duration{action:missing}", "avg<1").unwrap(),
        ];
        RunReport {
            run_id: Uuid::new_v4(),
            name: "feed-load".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            thresholds: evaluate(&snapshot, &thresholds),
            snapshot,
            scenarios: Vec::new(),
            aborted_by_threshold: false,
            interrupted: false,
        }
    }

    #[test]
    fn test_summary_lists_trend_percentiles() {
        let report = report();
        let text = ReportWriter::new(&report).render(ReportFormat::Summary).unwrap();

        assert!(text.contains("verdict: NO DATA"));
        assert!(text.contains("probe_duration{action:browse_feed,scenario:feed}"));
        assert!(text.contains("p95=40.00"));
        assert!(text.contains("✓ probe_duration p(95)<500"));
        assert!(text.contains("capacity exceeded in `feed`"));
    }

    #[test]
    fn test_markdown_report() {
        let report = report();
        let md = ReportWriter::new(&report).render(ReportFormat::Markdown).unwrap();

        assert!(md.starts_with("# Load Test Report: feed-load"));
        assert!(md.contains("**Status**: ❌ NO DATA"));
        assert!(md.contains("| `probe_duration` | `p(95)<500` | 40.00 | ✅ |"));
    }

    #[test]
    fn test_json_report_is_parseable() {
        let report = report();
        let json = ReportWriter::new(&report).render(ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["verdict"], "no_data");
        assert_eq!(value["exit_code"], 98);
        let trend = value["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["name"] == "probe_duration")
            .unwrap();
        assert_eq!(trend["value"]["count"], 4);
        assert_eq!(trend["value"]["max"], 40.0);
    }

    #[test]
    fn test_write_report_to_file() {
        let report = report();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");

        ReportWriter::new(&report)
            .write(&path, ReportFormat::Markdown)
            .unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("## Thresholds"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
