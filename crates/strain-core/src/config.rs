//! Run profile configuration
//!
//! Profiles are layered with the `config` crate, lowest precedence first:
//! - built-in defaults
//! - the profile file (YAML, TOML or JSON, chosen by extension)
//! - `STRAIN_` environment variables, `__` separating nested keys
//!   (`STRAIN_GRACEFUL_STOP=10s`, `STRAIN_HTTP__BASE_URL=http://host/api`)
//!
//! Everything is validated before a single VU is spawned.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetConfig;
use crate::error::{StrainError, StrainResult};
use crate::metrics::{MetricDecl, MetricKind};
use crate::stage::{Preset, Stage, StageCurve};
use crate::threshold::Threshold;

/// Root of a run profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_run_name")]
    pub name: String,

    /// Stage list for ramping scenarios that declare none of their own.
    #[serde(default)]
    pub preset: Option<Preset>,

    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,

    /// HTTP actions, keyed by action name.
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,

    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,

    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,

    /// Custom metrics recorded by probes.
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricKind>,

    /// Grace period for ramp-down and end-of-test stops.
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    pub graceful_stop: Duration,

    /// Sleep after every action, unless the scenario overrides it.
    #[serde(default)]
    pub think_time: ThinkTime,

    /// Seed for every VU random generator. Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: default_run_name(),
            preset: None,
            scenarios: BTreeMap::new(),
            actions: BTreeMap::new(),
            thresholds: Vec::new(),
            datasets: BTreeMap::new(),
            metrics: BTreeMap::new(),
            graceful_stop: default_graceful_stop(),
            think_time: ThinkTime::default(),
            seed: None,
            engine: EngineConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl RunConfig {
    /// Loads a profile with defaults and environment overrides, then validates it.
    ///
    /// Precedence, highest first:
    /// 1. `STRAIN_*` environment variables
    /// 2. the profile file at `path`
    /// 3. built-in defaults
    pub fn load<P: AsRef<Path>>(path: P) -> StrainResult<Self> {
        let config = Self::load_layered(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same layering as [`RunConfig::load`], without validation, for callers
    /// that apply overrides first.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> StrainResult<Self> {
        let path = path.as_ref();
        let mut builder = Config::builder();
        builder = Self::set_defaults(builder)?;

        builder = builder.add_source(File::from(path));

        // Example: STRAIN_ENGINE__TICK_INTERVAL=50ms
        builder = builder.add_source(
            Environment::with_prefix("STRAIN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RunConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reads a profile file on its own, without defaults layering or validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StrainResult<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        builder
            .set_default("name", default_run_name())?
            .set_default("graceful_stop", "30s")?
            // Engine
            .set_default("engine.reservoir_capacity", 100_000_u64)?
            .set_default("engine.tick_interval", "100ms")?
            .set_default("engine.threshold_check_interval", "1s")?
            // HTTP
            .set_default("http.base_url", default_base_url())?
            .set_default("http.timeout", "30s")
    }

    /// Checks every invariant that can be checked without knowing the probes.
    pub fn validate(&self) -> StrainResult<()> {
        if self.scenarios.is_empty() {
            return Err(StrainError::configuration("at least one scenario is required"));
        }
        if self.engine.reservoir_capacity == 0 {
            return Err(StrainError::configuration(
                "engine.reservoir_capacity must be > 0",
            ));
        }
        if self.engine.tick_interval.is_zero() {
            return Err(StrainError::configuration("engine.tick_interval must be > 0"));
        }
        if self.engine.threshold_check_interval.is_zero() {
            return Err(StrainError::configuration(
                "engine.threshold_check_interval must be > 0",
            ));
        }
        self.think_time.validate("think_time")?;

        for (name, scenario) in &self.scenarios {
            scenario.validate(self).map_err(|e| {
                StrainError::configuration(format!("scenario `{name}`: {}", message_of(e)))
            })?;
        }

        for (name, action) in &self.actions {
            action.validate().map_err(|e| {
                StrainError::configuration(format!("action `{name}`: {}", message_of(e)))
            })?;
        }

        self.thresholds()?;
        Ok(())
    }

    /// Parses every configured threshold expression.
    pub fn thresholds(&self) -> StrainResult<Vec<Threshold>> {
        let mut parsed = Vec::new();
        for config in &self.thresholds {
            if config.expr.is_empty() {
                return Err(StrainError::configuration(format!(
                    "threshold on `{}` has no expressions",
                    config.metric
                )));
            }
            for expr in &config.expr {
                parsed.push(
                    Threshold::parse(&config.metric, expr)?
                        .with_abort_on_fail(config.abort_on_fail)
                        .with_absent_as_pass(config.absent_as_pass),
                );
            }
        }
        Ok(parsed)
    }

    /// Custom metric declarations from the profile.
    pub fn metric_declarations(&self) -> Vec<MetricDecl> {
        self.metrics
            .iter()
            .map(|(name, kind)| MetricDecl::new(name.clone(), *kind))
            .collect()
    }

    /// Replaces the stage list of every ramping scenario with `preset`.
    pub fn override_preset(&mut self, preset: Preset) {
        self.preset = Some(preset);
        for scenario in self.scenarios.values_mut() {
            match &mut scenario.executor {
                ExecutorConfig::RampingVus {
                    stages,
                    preset: own,
                    ..
                }
                | ExecutorConfig::RampingArrivalRate {
                    stages,
                    preset: own,
                    ..
                } => {
                    stages.clear();
                    *own = Some(preset);
                }
                _ => {}
            }
        }
    }

    /// Think-time in effect for a scenario.
    pub fn think_time_for(&self, scenario: &ScenarioConfig) -> ThinkTime {
        scenario.think_time.unwrap_or(self.think_time)
    }

    /// Grace period in effect for a scenario.
    pub fn graceful_stop_for(&self, scenario: &ScenarioConfig) -> Duration {
        scenario.graceful_stop.unwrap_or(self.graceful_stop)
    }
}

fn message_of(err: StrainError) -> String {
    match err {
        StrainError::Configuration { message } => message,
        other => other.to_string(),
    }
}

fn default_run_name() -> String {
    "strain".to_string()
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

/// One workload: an executor plus an action mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub executor: ExecutorConfig,

    /// Delay before the scenario starts.
    #[serde(default, with = "humantime_serde")]
    pub start_time: Duration,

    /// Action name to relative weight.
    pub weights: BTreeMap<String, f64>,

    #[serde(default)]
    pub think_time: Option<ThinkTime>,

    /// Pause at the end of every iteration (session break).
    #[serde(default)]
    pub iteration_pause: Option<ThinkTime>,

    #[serde(default)]
    pub actions_per_iteration: IntRange,

    #[serde(default, with = "humantime_serde")]
    pub graceful_stop: Option<Duration>,

    /// Dataset an iteration identity is drawn from.
    #[serde(default)]
    pub identity: Option<String>,

    /// Weight tables applied at fixed offsets into the scenario.
    #[serde(default)]
    pub reweights: Vec<Reweight>,

    /// Probes slower than this are counted in `slow_probes`.
    #[serde(default)]
    pub slow_probe_ms: Option<f64>,

    /// Probes slower than this are counted in `very_slow_probes`.
    #[serde(default)]
    pub very_slow_probe_ms: Option<f64>,
}

impl ScenarioConfig {
    /// A scenario running `executor` over `weights` with defaults elsewhere.
    pub fn new(executor: ExecutorConfig, weights: BTreeMap<String, f64>) -> Self {
        Self {
            executor,
            start_time: Duration::ZERO,
            weights,
            think_time: None,
            iteration_pause: None,
            actions_per_iteration: IntRange::default(),
            graceful_stop: None,
            identity: None,
            reweights: Vec::new(),
            slow_probe_ms: None,
            very_slow_probe_ms: None,
        }
    }

    fn validate(&self, run: &RunConfig) -> StrainResult<()> {
        self.executor.validate()?;
        self.executor.demand_curve(run.preset)?;

        if self.weights.is_empty() {
            return Err(StrainError::configuration("weights must name at least one action"));
        }
        validate_weights(&self.weights)?;
        for reweight in &self.reweights {
            validate_weights(&reweight.weights)?;
            if let Some(unknown) = reweight.weights.keys().find(|k| !self.weights.contains_key(*k)) {
                return Err(StrainError::configuration(format!(
                    "reweight after {:?} names unknown action `{unknown}`",
                    reweight.after
                )));
            }
        }

        if let Some(think_time) = &self.think_time {
            think_time.validate("think_time")?;
        }
        if let Some(pause) = &self.iteration_pause {
            pause.validate("iteration_pause")?;
        }
        if self.actions_per_iteration.min == 0
            || self.actions_per_iteration.min > self.actions_per_iteration.max
        {
            return Err(StrainError::configuration(
                "actions_per_iteration needs 1 <= min <= max",
            ));
        }

        if let Some(identity) = &self.identity {
            if !run.datasets.contains_key(identity) {
                return Err(StrainError::configuration(format!(
                    "identity dataset `{identity}` is not declared"
                )));
            }
        }

        for (field, value) in [
            ("slow_probe_ms", self.slow_probe_ms),
            ("very_slow_probe_ms", self.very_slow_probe_ms),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(StrainError::configuration(format!("{field} must be > 0")));
                }
            }
        }
        Ok(())
    }
}

/// Weights must be positive and finite.
pub fn validate_weights(weights: &BTreeMap<String, f64>) -> StrainResult<()> {
    for (action, weight) in weights {
        if !weight.is_finite() || *weight <= 0.0 {
            return Err(StrainError::configuration(format!(
                "action `{action}` has invalid weight {weight} (must be > 0 and finite)"
            )));
        }
    }
    Ok(())
}

/// How a scenario schedules work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutorConfig {
    /// Live VU count follows the stage list.
    RampingVus {
        #[serde(default)]
        start_vus: u32,
        #[serde(default)]
        stages: Vec<Stage>,
        #[serde(default)]
        preset: Option<Preset>,
    },

    /// Fixed VU count for a fixed duration.
    ConstantVus {
        vus: u32,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },

    /// Iteration start rate follows the stage list.
    RampingArrivalRate {
        #[serde(default)]
        start_rate: u32,
        #[serde(default = "default_time_unit", with = "humantime_serde")]
        time_unit: Duration,
        #[serde(default)]
        stages: Vec<Stage>,
        #[serde(default)]
        preset: Option<Preset>,
        pre_allocated_vus: u32,
        max_vus: u32,
        #[serde(default = "default_max_queue_wait", with = "humantime_serde")]
        max_queue_wait: Duration,
    },

    /// Fixed iteration start rate for a fixed duration.
    ConstantArrivalRate {
        rate: u32,
        #[serde(default = "default_time_unit", with = "humantime_serde")]
        time_unit: Duration,
        #[serde(with = "humantime_serde")]
        duration: Duration,
        pre_allocated_vus: u32,
        max_vus: u32,
        #[serde(default = "default_max_queue_wait", with = "humantime_serde")]
        max_queue_wait: Duration,
    },

    /// Every VU runs a fixed number of iterations.
    PerVuIterations {
        vus: u32,
        iterations: u64,
        #[serde(default = "default_max_duration", with = "humantime_serde")]
        max_duration: Duration,
    },
}

fn default_time_unit() -> Duration {
    Duration::from_secs(1)
}

fn default_max_queue_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_max_duration() -> Duration {
    Duration::from_secs(600)
}

impl ExecutorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RampingVus { .. } => "ramping-vus",
            Self::ConstantVus { .. } => "constant-vus",
            Self::RampingArrivalRate { .. } => "ramping-arrival-rate",
            Self::ConstantArrivalRate { .. } => "constant-arrival-rate",
            Self::PerVuIterations { .. } => "per-vu-iterations",
        }
    }

    pub fn is_arrival_rate(&self) -> bool {
        matches!(
            self,
            Self::RampingArrivalRate { .. } | Self::ConstantArrivalRate { .. }
        )
    }

    /// Demand curve of the executor. `None` for `per-vu-iterations`.
    ///
    /// Ramping executors without explicit stages fall back to their own
    /// preset, then to `run_preset`.
    pub fn demand_curve(&self, run_preset: Option<Preset>) -> StrainResult<Option<StageCurve>> {
        let resolve = |start: u32, stages: &[Stage], preset: Option<Preset>| {
            let stages = if !stages.is_empty() {
                stages.to_vec()
            } else if let Some(preset) = preset.or(run_preset) {
                preset.stages()
            } else {
                return Err(StrainError::configuration(
                    "ramping executor needs `stages` or a `preset`",
                ));
            };
            StageCurve::new(start, stages)
        };

        let curve = match self {
            Self::RampingVus {
                start_vus,
                stages,
                preset,
            } => resolve(*start_vus, stages, *preset)?,
            Self::RampingArrivalRate {
                start_rate,
                stages,
                preset,
                ..
            } => resolve(*start_rate, stages, *preset)?,
            Self::ConstantVus { vus, duration } => StageCurve::constant(*vus, *duration)?,
            Self::ConstantArrivalRate { rate, duration, .. } => {
                StageCurve::constant(*rate, *duration)?
            }
            Self::PerVuIterations { .. } => return Ok(None),
        };
        Ok(Some(curve))
    }

    fn validate(&self) -> StrainResult<()> {
        match self {
            Self::RampingVus { .. } => Ok(()),
            Self::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return Err(StrainError::configuration("constant-vus needs vus > 0"));
                }
                if duration.is_zero() {
                    return Err(StrainError::configuration("constant-vus needs duration > 0"));
                }
                Ok(())
            }
            Self::RampingArrivalRate {
                time_unit,
                pre_allocated_vus,
                max_vus,
                ..
            } => validate_pool(*time_unit, *pre_allocated_vus, *max_vus),
            Self::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                if *rate == 0 {
                    return Err(StrainError::configuration("constant-arrival-rate needs rate > 0"));
                }
                if duration.is_zero() {
                    return Err(StrainError::configuration(
                        "constant-arrival-rate needs duration > 0",
                    ));
                }
                validate_pool(*time_unit, *pre_allocated_vus, *max_vus)
            }
            Self::PerVuIterations {
                vus,
                iterations,
                max_duration,
            } => {
                if *vus == 0 || *iterations == 0 {
                    return Err(StrainError::configuration(
                        "per-vu-iterations needs vus > 0 and iterations > 0",
                    ));
                }
                if max_duration.is_zero() {
                    return Err(StrainError::configuration(
                        "per-vu-iterations needs max_duration > 0",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_pool(time_unit: Duration, pre_allocated_vus: u32, max_vus: u32) -> StrainResult<()> {
    if time_unit.is_zero() {
        return Err(StrainError::configuration("time_unit must be > 0"));
    }
    if max_vus == 0 {
        return Err(StrainError::configuration("max_vus must be > 0"));
    }
    if pre_allocated_vus > max_vus {
        return Err(StrainError::configuration(
            "pre_allocated_vus must be <= max_vus",
        ));
    }
    Ok(())
}

/// Uniformly random sleep between `min` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl ThinkTime {
    pub fn fixed(duration: Duration) -> Self {
        Self {
            min: duration,
            max: duration,
        }
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }

    fn validate(&self, field: &str) -> StrainResult<()> {
        if self.min > self.max {
            return Err(StrainError::configuration(format!(
                "{field}.min must be <= {field}.max"
            )));
        }
        Ok(())
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

/// Inclusive integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntRange {
    pub min: u32,
    pub max: u32,
}

impl IntRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max <= self.min {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

impl Default for IntRange {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reweight {
    /// Offset from the scenario start.
    #[serde(with = "humantime_serde")]
    pub after: Duration,
    pub weights: BTreeMap<String, f64>,
}

/// A threshold block: one metric selector, one or more expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// `name` or `name{key:value,...}`.
    pub metric: String,
    pub expr: Vec<String>,
    #[serde(default)]
    pub abort_on_fail: bool,
    #[serde(default)]
    pub absent_as_pass: bool,
}

/// An HTTP action declared in the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub request: RequestConfig,
    /// Requests issued after `request` succeeds, each with its own chance.
    #[serde(default)]
    pub then: Vec<FollowUp>,
}

impl ActionConfig {
    fn validate(&self) -> StrainResult<()> {
        self.request.validate()?;
        for follow_up in &self.then {
            follow_up.request.validate()?;
            if !(0.0..=1.0).contains(&follow_up.chance) {
                return Err(StrainError::configuration(
                    "follow-up chance must be within [0, 1]",
                ));
            }
            if let Some(pointer) = &follow_up.when {
                validate_pointer("follow-up `when`", pointer)?;
            }
            if follow_up.repeat.min > follow_up.repeat.max {
                return Err(StrainError::configuration(
                    "follow-up repeat needs min <= max",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_method")]
    pub method: String,
    /// Joined to `http.base_url`, query string included. May contain placeholders.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body template, sent as `application/json`.
    #[serde(default)]
    pub body: Option<String>,
    /// Accepted status codes.
    #[serde(default = "default_expect")]
    pub expect: Vec<u16>,
    /// `endpoint` label of the outcome; the path template when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Custom counters bumped by matching responses.
    #[serde(default)]
    pub count: Vec<CountRule>,
}

impl RequestConfig {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
            expect: default_expect(),
            endpoint: None,
            count: Vec::new(),
        }
    }

    pub fn endpoint_label(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.path)
    }

    fn validate(&self) -> StrainResult<()> {
        const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
        if !METHODS.contains(&self.method.to_ascii_uppercase().as_str()) {
            return Err(StrainError::configuration(format!(
                "unsupported HTTP method `{}`",
                self.method
            )));
        }
        if self.expect.is_empty() {
            return Err(StrainError::configuration("expect must list at least one status"));
        }
        for rule in &self.count {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Counts a response into `counter` when every given condition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRule {
    pub counter: String,
    /// Matching statuses; any status when empty.
    #[serde(default)]
    pub status: Vec<u16>,
    /// JSON pointer that must hold a non-empty value.
    #[serde(default)]
    pub when: Option<String>,
    /// JSON pointer that must be missing or empty.
    #[serde(default)]
    pub unless: Option<String>,
}

impl CountRule {
    /// True when the rule inspects the response body.
    pub fn reads_body(&self) -> bool {
        self.when.is_some() || self.unless.is_some()
    }

    fn validate(&self) -> StrainResult<()> {
        if self.counter.trim().is_empty() {
            return Err(StrainError::configuration("count rule needs a counter name"));
        }
        for pointer in self.when.iter().chain(self.unless.iter()) {
            validate_pointer(&format!("count rule `{}`", self.counter), pointer)?;
        }
        Ok(())
    }
}

fn validate_pointer(context: &str, pointer: &str) -> StrainResult<()> {
    if pointer.starts_with('/') {
        Ok(())
    } else {
        Err(StrainError::configuration(format!(
            "{context}: JSON pointer `{pointer}` must start with `/`"
        )))
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expect() -> Vec<u16> {
    vec![200]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub request: RequestConfig,
    #[serde(default = "default_chance")]
    pub chance: f64,
    /// JSON pointer into the first response; the follow-up is skipped unless
    /// it holds a non-empty value.
    #[serde(default)]
    pub when: Option<String>,
    /// How many times the request is sent once the chance hits.
    #[serde(default)]
    pub repeat: IntRange,
}

impl FollowUp {
    pub fn new(request: RequestConfig) -> Self {
        Self {
            request,
            chance: default_chance(),
            when: None,
            repeat: IntRange::default(),
        }
    }
}

fn default_chance() -> f64 {
    1.0
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Samples retained per trend key for percentiles.
    #[serde(default = "default_reservoir_capacity")]
    pub reservoir_capacity: usize,
    /// Scheduler tick.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// How often `abort_on_fail` thresholds are checked during the run.
    #[serde(default = "default_threshold_check_interval", with = "humantime_serde")]
    pub threshold_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity: default_reservoir_capacity(),
            tick_interval: default_tick_interval(),
            threshold_check_interval: default_threshold_check_interval(),
        }
    }
}

fn default_reservoir_capacity() -> usize {
    crate::metrics::DEFAULT_RESERVOIR_CAPACITY
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_threshold_check_interval() -> Duration {
    Duration::from_secs(1)
}

/// Settings for HTTP probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_http_timeout(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}
