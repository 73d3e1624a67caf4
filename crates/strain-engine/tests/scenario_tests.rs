//! End-to-end scenario runs on a paused clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strain_core::metrics::{builtin, labels};
use strain_core::{
    ExecutorConfig, Labels, Reweight, RunConfig, ScenarioConfig, Stage, ThinkTime,
    ThresholdConfig, Verdict,
};
use strain_engine::{
    Probe, ProbeContext, ProbeError, ProbeReport, Runner, EXIT_NO_DATA, EXIT_PASSED,
    EXIT_THRESHOLDS_FAILED,
};

struct Sleeper(Duration);

#[async_trait]
impl Probe for Sleeper {
    async fn call(&self, _ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
        tokio::time::sleep(self.0).await;
        Ok(ProbeReport::new())
    }
}

struct Failing;

#[async_trait]
impl Probe for Failing {
    async fn call(&self, _ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(ProbeError::new("503 Service Unavailable").with_label("status", "503"))
    }
}

struct Counting(Arc<AtomicU64>);

#[async_trait]
impl Probe for Counting {
    async fn call(&self, _ctx: &mut ProbeContext) -> Result<ProbeReport, ProbeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(ProbeReport::new())
    }
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn single_scenario(scenario: ScenarioConfig) -> RunConfig {
    let mut config = RunConfig {
        name: "scenario-test".to_string(),
        think_time: ThinkTime::none(),
        seed: Some(7),
        ..RunConfig::default()
    };
    config.scenarios.insert("main".to_string(), scenario);
    config
}

fn threshold(metric: &str, expr: &str) -> ThresholdConfig {
    ThresholdConfig {
        metric: metric.to_string(),
        expr: vec![expr.to_string()],
        abort_on_fail: false,
        absent_as_pass: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_ramp_to_five_vus_with_fast_probe() {
    let executor = ExecutorConfig::RampingVus {
        start_vus: 0,
        stages: vec![Stage::new(Duration::from_secs(10), 5)],
        preset: None,
    };
    let mut config = single_scenario(ScenarioConfig::new(executor, weights(&[("fast", 1.0)])));
    config.thresholds.push(threshold("probe_duration", "p(95)<500"));

    let report = Runner::new(config)
        .with_probe("fast", Arc::new(Sleeper(Duration::from_millis(50))))
        .run()
        .await
        .unwrap();

    assert_eq!(report.scenarios[0].peak_vus, 5);
    let all = Labels::new();
    let attempts = report.snapshot.counter(builtin::PROBE_ATTEMPTS, &all);
    assert!(attempts > 0);
    assert_eq!(report.snapshot.counter(builtin::PROBE_SUCCESSES, &all), attempts);

    let p50 = report
        .snapshot
        .trend(builtin::PROBE_DURATION, &all)
        .and_then(|t| t.median())
        .unwrap();
    assert!((49.0..=51.0).contains(&p50), "p50 = {p50}");

    assert_eq!(report.verdict(), Verdict::Passed);
    assert_eq!(report.exit_code(), EXIT_PASSED);
    assert!(!report.interrupted);
}

#[tokio::test(start_paused = true)]
async fn test_global_stop_forces_probe_after_grace() {
    let executor = ExecutorConfig::ConstantVus {
        vus: 1,
        duration: Duration::from_secs(60),
    };
    let mut scenario = ScenarioConfig::new(executor, weights(&[("slow", 1.0)]));
    scenario.graceful_stop = Some(Duration::from_secs(5));
    let runner = Runner::new(single_scenario(scenario))
        .with_probe("slow", Arc::new(Sleeper(Duration::from_secs(10))));

    let control = runner.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        control.stop();
    });
    let report = runner.run().await.unwrap();

    let all = Labels::new();
    assert_eq!(report.snapshot.counter(builtin::FORCED_TERMINATIONS, &all), 1);
    assert_eq!(report.snapshot.counter(builtin::PROBE_SUCCESSES, &all), 0);
    assert!(report.snapshot.trend(builtin::PROBE_DURATION, &all).is_none());
    assert_eq!(report.scenarios[0].forced_vus, 1);
    assert!(report.interrupted);

    // stop at 2s plus 5s of grace
    let elapsed = report.duration();
    assert!(
        elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7_500),
        "elapsed {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_weight_fails_before_any_probe_call() {
    let calls = Arc::new(AtomicU64::new(0));
    let executor = ExecutorConfig::ConstantVus {
        vus: 3,
        duration: Duration::from_secs(5),
    };
    let config = single_scenario(ScenarioConfig::new(executor, weights(&[("only", 0.0)])));

    let err = Runner::new(config)
        .with_probe("only", Arc::new(Counting(Arc::clone(&calls))))
        .run()
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_constant_arrival_rate_keeps_rate() {
    let executor = ExecutorConfig::ConstantArrivalRate {
        rate: 10,
        time_unit: Duration::from_secs(1),
        duration: Duration::from_secs(5),
        pre_allocated_vus: 2,
        max_vus: 10,
        max_queue_wait: Duration::from_secs(1),
    };
    let config = single_scenario(ScenarioConfig::new(executor, weights(&[("fast", 1.0)])));

    let report = Runner::new(config)
        .with_probe("fast", Arc::new(Sleeper(Duration::from_millis(50))))
        .run()
        .await
        .unwrap();

    let summary = &report.scenarios[0];
    assert!(
        (45..=50).contains(&summary.iterations),
        "iterations = {}",
        summary.iterations
    );
    assert_eq!(summary.dropped_iterations, 0);
    assert_eq!(summary.peak_vus, 2);
    assert!(!report.snapshot.capacity_exceeded());
    assert_eq!(
        report.snapshot.counter(builtin::ITERATIONS, &Labels::new()),
        summary.iterations
    );
}

#[tokio::test(start_paused = true)]
async fn test_arrival_rate_reports_capacity_exceeded() {
    let executor = ExecutorConfig::ConstantArrivalRate {
        rate: 20,
        time_unit: Duration::from_secs(1),
        duration: Duration::from_secs(3),
        pre_allocated_vus: 1,
        max_vus: 2,
        max_queue_wait: Duration::from_millis(200),
    };
    let config = single_scenario(ScenarioConfig::new(executor, weights(&[("slow", 1.0)])));

    let report = Runner::new(config)
        .with_probe("slow", Arc::new(Sleeper(Duration::from_secs(1))))
        .run()
        .await
        .unwrap();

    let summary = &report.scenarios[0];
    assert!(summary.dropped_iterations > 0);
    assert_eq!(summary.peak_vus, 2);
    assert!(report.snapshot.capacity_exceeded());
    assert_eq!(
        report.snapshot.counter(
            builtin::DROPPED_ITERATIONS,
            &labels([("scenario", "main")])
        ),
        summary.dropped_iterations
    );
}

#[tokio::test(start_paused = true)]
async fn test_per_vu_iterations() {
    let executor = ExecutorConfig::PerVuIterations {
        vus: 2,
        iterations: 3,
        max_duration: Duration::from_secs(60),
    };
    let calls = Arc::new(AtomicU64::new(0));
    let config = single_scenario(ScenarioConfig::new(executor, weights(&[("seed", 1.0)])));

    let report = Runner::new(config)
        .with_probe("seed", Arc::new(Counting(Arc::clone(&calls))))
        .run()
        .await
        .unwrap();

    assert_eq!(report.scenarios[0].iterations, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.snapshot.counter(builtin::ITERATIONS, &Labels::new()), 6);
}

#[tokio::test(start_paused = true)]
async fn test_threshold_without_data_exits_no_data() {
    let executor = ExecutorConfig::ConstantVus {
        vus: 1,
        duration: Duration::from_secs(2),
    };
    let mut config = single_scenario(ScenarioConfig::new(executor, weights(&[("fast", 1.0)])));
    config
        .thresholds
        .push(threshold("probe_failed{action:never_called}", "rate<0.1"));

    let report = Runner::new(config)
        .with_probe("fast", Arc::new(Sleeper(Duration::from_millis(50))))
        .run()
        .await
        .unwrap();

    assert_eq!(report.verdict(), Verdict::NoData);
    assert_eq!(report.exit_code(), EXIT_NO_DATA);
}

#[tokio::test(start_paused = true)]
async fn test_abort_on_fail_stops_run_early() {
    let executor = ExecutorConfig::ConstantVus {
        vus: 2,
        duration: Duration::from_secs(60),
    };
    let mut scenario = ScenarioConfig::new(executor, weights(&[("broken", 1.0)]));
    scenario.think_time = Some(ThinkTime::fixed(Duration::from_millis(100)));
    let mut config = single_scenario(scenario);
    config.thresholds.push(ThresholdConfig {
        abort_on_fail: true,
        ..threshold("probe_failed", "rate<0.1")
    });

    let report = Runner::new(config)
        .with_probe("broken", Arc::new(Failing))
        .run()
        .await
        .unwrap();

    assert!(report.aborted_by_threshold);
    assert!(!report.interrupted);
    assert_eq!(report.exit_code(), EXIT_THRESHOLDS_FAILED);
    assert_eq!(report.thresholds.violations.len(), 1);
    assert!(report.duration() < Duration::from_secs(5));

    let failed = labels([("status", "503")]);
    assert!(report
        .snapshot
        .trend(builtin::PROBE_DURATION, &failed)
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reweight_shifts_action_mix() {
    let executor = ExecutorConfig::ConstantVus {
        vus: 1,
        duration: Duration::from_secs(10),
    };
    let mut scenario = ScenarioConfig::new(executor, weights(&[("early", 1.0), ("late", 1e-6)]));
    scenario.think_time = Some(ThinkTime::fixed(Duration::from_millis(100)));
    scenario.reweights.push(Reweight {
        after: Duration::from_secs(2),
        weights: weights(&[("early", 1e-6), ("late", 1.0)]),
    });

    let report = Runner::new(single_scenario(scenario))
        .with_probe("early", Arc::new(Sleeper(Duration::from_millis(10))))
        .with_probe("late", Arc::new(Sleeper(Duration::from_millis(10))))
        .run()
        .await
        .unwrap();

    let early = report
        .snapshot
        .counter(builtin::PROBE_ATTEMPTS, &labels([("action", "early")]));
    let late = report
        .snapshot
        .counter(builtin::PROBE_ATTEMPTS, &labels([("action", "late")]));
    assert!(early > 0);
    assert!(late > early * 2, "early = {early}, late = {late}");
}

#[tokio::test(start_paused = true)]
async fn test_scenarios_share_one_sink() {
    let mut config = single_scenario(ScenarioConfig::new(
        ExecutorConfig::PerVuIterations {
            vus: 1,
            iterations: 2,
            max_duration: Duration::from_secs(30),
        },
        weights(&[("a", 1.0)]),
    ));
    let mut delayed = ScenarioConfig::new(
        ExecutorConfig::PerVuIterations {
            vus: 1,
            iterations: 4,
            max_duration: Duration::from_secs(30),
        },
        weights(&[("a", 1.0)]),
    );
    delayed.start_time = Duration::from_secs(3);
    config.scenarios.insert("delayed".to_string(), delayed);

    let report = Runner::new(config)
        .with_probe("a", Arc::new(Sleeper(Duration::from_millis(10))))
        .run()
        .await
        .unwrap();

    let snapshot = &report.snapshot;
    assert_eq!(snapshot.counter(builtin::ITERATIONS, &labels([("scenario", "main")])), 2);
    assert_eq!(snapshot.counter(builtin::ITERATIONS, &labels([("scenario", "delayed")])), 4);
    assert_eq!(snapshot.counter(builtin::ITERATIONS, &Labels::new()), 6);
    assert!(report.duration() >= Duration::from_secs(3));
}
