//! Stage lists and the demand curve derived from them
//!
//! A stage list starting at `start_target` defines a piecewise-linear demand
//! function: inside a stage, demand moves linearly from the previous target to
//! the stage target. Demand is continuous, hits every stage target exactly at
//! the end of that stage, and stays at the last target afterwards.
//!
//! VU executors read the curve as a number of live virtual users, arrival-rate
//! executors as iteration starts per time unit.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StrainError, StrainResult};

/// One stage of a ramp: reach `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }

    fn secs(duration_secs: u64, target: u32) -> Self {
        Self::new(Duration::from_secs(duration_secs), target)
    }
}

/// Time-varying demand shared by VU and arrival-rate executors.
pub trait DemandCurve: Send + Sync {
    /// Demand at `elapsed` since the scenario started.
    fn demand_at(&self, elapsed: Duration) -> f64;

    /// Integral of demand over `[0, elapsed]`, in demand-seconds.
    fn cumulative_demand(&self, elapsed: Duration) -> f64;

    /// Length of the curve. Demand is constant afterwards.
    fn total_duration(&self) -> Duration;

    /// Highest demand reached anywhere on the curve.
    fn peak(&self) -> f64;
}

/// Piecewise-linear demand curve built from a stage list.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCurve {
    start_target: u32,
    stages: Vec<Stage>,
    total: Duration,
}

impl StageCurve {
    /// Validates the stage list and builds the curve.
    pub fn new(start_target: u32, stages: Vec<Stage>) -> StrainResult<Self> {
        if stages.is_empty() {
            return Err(StrainError::configuration("stage list must not be empty"));
        }
        if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
            return Err(StrainError::configuration(format!(
                "stage {index} has a zero duration"
            )));
        }

        let total = stages.iter().map(|s| s.duration).sum();
        Ok(Self {
            start_target,
            stages,
            total,
        })
    }

    /// A flat curve at `target` for `duration`.
    pub fn constant(target: u32, duration: Duration) -> StrainResult<Self> {
        Self::new(target, vec![Stage::new(duration, target)])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_target(&self) -> u32 {
        self.start_target
    }

    /// Index of the stage active at `elapsed`, `None` once the curve has ended.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(index);
            }
        }
        None
    }

    fn last_target(&self) -> f64 {
        self.stages
            .last()
            .map_or(f64::from(self.start_target), |s| f64::from(s.target))
    }
}

impl DemandCurve for StageCurve {
    fn demand_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let mut from = f64::from(self.start_target);
        let mut stage_start = 0.0;

        for stage in &self.stages {
            let d = stage.duration.as_secs_f64();
            let to = f64::from(stage.target);
            if t < stage_start + d {
                let progress = (t - stage_start) / d;
                return from + (to - from) * progress;
            }
            from = to;
            stage_start += d;
        }
        self.last_target()
    }

    fn cumulative_demand(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let mut from = f64::from(self.start_target);
        let mut stage_start = 0.0;
        let mut area = 0.0;

        for stage in &self.stages {
            let d = stage.duration.as_secs_f64();
            let to = f64::from(stage.target);
            if t < stage_start + d {
                let e = t - stage_start;
                return area + from * e + (to - from) * e * e / (2.0 * d);
            }
            area += (from + to) / 2.0 * d;
            from = to;
            stage_start += d;
        }
        area + self.last_target() * (t - stage_start)
    }

    fn total_duration(&self) -> Duration {
        self.total
    }

    fn peak(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| f64::from(s.target))
            .fold(f64::from(self.start_target), f64::max)
    }
}

/// Number of live VUs needed to cover `demand`.
///
/// Any fractional demand above a whole number asks for one more VU, so a
/// ramp to `N` has `N` VUs running before its last instant.
pub fn vus_for_demand(demand: f64) -> u32 {
    if !demand.is_finite() || demand <= 0.0 {
        return 0;
    }
    (demand - 1e-9).ceil().max(0.0) as u32
}

/// Built-in stage lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// Minimal sanity check: 5 VUs for a minute.
    Smoke,
    /// Normal expected load, up to 100 VUs.
    Load,
    /// Beyond normal load in 100-VU steps up to 300.
    Stress,
    /// Sudden surge to 500 VUs.
    Spike,
    /// Long, steady population run.
    Seed,
    HeavySeed,
}

impl Preset {
    pub const ALL: [Preset; 6] = [
        Preset::Smoke,
        Preset::Load,
        Preset::Stress,
        Preset::Spike,
        Preset::Seed,
        Preset::HeavySeed,
    ];

    pub fn stages(self) -> Vec<Stage> {
        match self {
            Self::Smoke => vec![Stage::secs(30, 5), Stage::secs(60, 5), Stage::secs(30, 0)],
            Self::Load => vec![
                Stage::secs(60, 50),
                Stage::secs(180, 50),
                Stage::secs(60, 100),
                Stage::secs(180, 100),
                Stage::secs(120, 0),
            ],
            Self::Stress => vec![
                Stage::secs(120, 100),
                Stage::secs(300, 100),
                Stage::secs(120, 200),
                Stage::secs(300, 200),
                Stage::secs(120, 300),
                Stage::secs(300, 300),
                Stage::secs(120, 0),
            ],
            Self::Spike => vec![
                Stage::secs(60, 10),
                Stage::secs(10, 500),
                Stage::secs(180, 500),
                Stage::secs(10, 10),
                Stage::secs(60, 0),
            ],
            Self::Seed => vec![Stage::secs(30, 10), Stage::secs(600, 10), Stage::secs(30, 0)],
            Self::HeavySeed => vec![
                Stage::secs(60, 20),
                Stage::secs(1800, 20),
                Stage::secs(60, 0),
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Smoke => "smoke",
            Self::Load => "load",
            Self::Stress => "stress",
            Self::Spike => "spike",
            Self::Seed => "seed",
            Self::HeavySeed => "heavy-seed",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = StrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                StrainError::configuration(format!(
                    "unknown preset `{s}` (expected one of smoke, load, stress, spike, seed, heavy-seed)"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_linear_ramp_from_zero() {
        let curve = StageCurve::new(0, vec![Stage::secs(10, 5)]).unwrap();

        assert_eq!(curve.demand_at(Duration::ZERO), 0.0);
        assert!((curve.demand_at(secs(5.0)) - 2.5).abs() < 1e-9);
        assert_eq!(curve.demand_at(secs(10.0)), 5.0);
        assert_eq!(curve.demand_at(secs(60.0)), 5.0);
        assert_eq!(curve.total_duration(), secs(10.0));
    }

    #[test]
    fn test_plateau_and_ramp_down() {
        let curve = StageCurve::new(0, Preset::Smoke.stages()).unwrap();

        assert_eq!(curve.demand_at(secs(30.0)), 5.0);
        assert_eq!(curve.demand_at(secs(60.0)), 5.0);
        assert_eq!(curve.demand_at(secs(90.0)), 5.0);
        assert!((curve.demand_at(secs(105.0)) - 2.5).abs() < 1e-9);
        assert_eq!(curve.demand_at(secs(120.0)), 0.0);
        assert_eq!(curve.peak(), 5.0);
    }

    #[test]
    fn test_cumulative_demand_is_area_under_curve() {
        let curve = StageCurve::new(0, vec![Stage::secs(10, 10), Stage::secs(10, 10)]).unwrap();

        // triangle 0..10 then rectangle 10
        assert!((curve.cumulative_demand(secs(10.0)) - 50.0).abs() < 1e-9);
        assert!((curve.cumulative_demand(secs(20.0)) - 150.0).abs() < 1e-9);
        assert!((curve.cumulative_demand(secs(5.0)) - 12.5).abs() < 1e-9);
        // constant afterwards
        assert!((curve.cumulative_demand(secs(30.0)) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_curve() {
        let curve = StageCurve::constant(50, secs(60.0)).unwrap();
        assert_eq!(curve.demand_at(Duration::ZERO), 50.0);
        assert_eq!(curve.demand_at(secs(30.0)), 50.0);
        assert!((curve.cumulative_demand(secs(2.0)) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_stage_lists() {
        assert!(StageCurve::new(0, vec![]).unwrap_err().is_configuration());
        assert!(StageCurve::new(0, vec![Stage::secs(0, 5)])
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_vus_for_demand() {
        assert_eq!(vus_for_demand(0.0), 0);
        assert_eq!(vus_for_demand(0.2), 1);
        assert_eq!(vus_for_demand(2.5), 3);
        assert_eq!(vus_for_demand(4.5), 5);
        assert_eq!(vus_for_demand(4.000_000_000_1), 4);
        assert_eq!(vus_for_demand(5.0), 5);
        assert_eq!(vus_for_demand(-1.0), 0);
        assert_eq!(vus_for_demand(f64::NAN), 0);
    }

    #[test]
    fn test_stage_index_lookup() {
        let curve = StageCurve::new(0, Preset::Load.stages()).unwrap();
        assert_eq!(curve.stage_index_at(Duration::ZERO), Some(0));
        assert_eq!(curve.stage_index_at(secs(60.0)), Some(1));
        assert_eq!(curve.stage_index_at(secs(599.0)), Some(4));
        assert_eq!(curve.stage_index_at(secs(600.0)), None);
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("heavy-seed".parse::<Preset>().unwrap(), Preset::HeavySeed);
        assert_eq!("LOAD".parse::<Preset>().unwrap(), Preset::Load);
        assert!("soak".parse::<Preset>().is_err());

        for preset in Preset::ALL {
            assert!(StageCurve::new(0, preset.stages()).is_ok(), "{preset}");
        }
        assert_eq!(
            StageCurve::new(0, Preset::Stress.stages()).unwrap().total_duration(),
            secs(1380.0)
        );
    }

    #[test]
    fn test_stage_deserializes_human_durations() {
        let stage: Stage = serde_json::from_str(r#"{"duration": "1m30s", "target": 20}"#).unwrap();
        assert_eq!(stage, Stage::secs(90, 20));
    }
}
