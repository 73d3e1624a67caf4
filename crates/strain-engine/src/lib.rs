//! Load-test orchestration engine
//!
//! Scenario schedulers drive virtual users; each VU picks weighted actions
//! from an [`ActionRegistry`], calls their [`Probe`] and records the outcome
//! in the shared metric sink. A [`Runner`] wires it all together from a
//! `RunConfig` and evaluates thresholds into a [`RunReport`].

pub mod executor;
pub mod probe;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;

pub use executor::{IterationSource, StopSignal, VuExecutor, VuPhase, VuSettings, VuSummary};
pub use probe::{Probe, ProbeContext, ProbeError, ProbeFactory, ProbeReport};
pub use registry::{Action, ActionRegistry, SelectionTable};
pub use report::{ReportFormat, ReportWriter};
pub use runner::{
    PreparedRun, RunControl, RunReport, Runner, EXIT_CONFIGURATION, EXIT_NO_DATA, EXIT_PASSED,
    EXIT_RUNTIME_ERROR, EXIT_THRESHOLDS_FAILED,
};
pub use scheduler::{ScenarioPlan, ScenarioScheduler, ScenarioSummary, StopTokens};
