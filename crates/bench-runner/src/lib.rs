//! Energy and wall-clock benchmarking of external planner pipelines.
//!
//! An instance sweep runs each problem through an ordered list of phases. Every
//! phase waits for an idle system, runs one external command under a hard
//! timeout, and is measured by an [`EnergySampler`]. Each instance ends with a
//! table holding exactly one row per defined phase.

pub mod config;
pub mod energy;
pub mod executor;
pub mod idle;
pub mod pipeline;
pub mod planners;
pub mod recorder;
pub mod sweep;

pub use config::{ConfigError, HarnessConfig};
pub use energy::{EnergySampler, RaplSampler, RawReading, Sampled, WallClockSampler};
pub use executor::{
    CommandRunner, CommandSpec, ExecutionOutcome, ExecutionStatus, ProcessGroupExecutor, Redirect,
};
pub use idle::{
    IdleGate, IdleOutcome, IdleSettings, LoadProbe, LoadSample, PollingIdleGate, SystemLoadProbe,
};
pub use pipeline::{
    PhaseDefinition, Pipeline, PipelineReport, PipelineRunState, PipelineRunner, RunnerState,
};
pub use planners::{InstanceFiles, Planner};
pub use recorder::{measure, MeasuredPhase};
pub use sweep::{run_sweep, InstanceResult, SweepLayout, SweepSummary};
