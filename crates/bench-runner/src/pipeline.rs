use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bench_core::{write_table, PhaseRecord};
use tracing::{debug, info, warn};

use crate::energy::EnergySampler;
use crate::executor::{CommandRunner, CommandSpec};
use crate::idle::{IdleGate, IdleOutcome};
use crate::recorder;

/// One step of a pipeline. `position` is its index in the owning pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDefinition {
    pub name: String,
    pub command: CommandSpec,
    pub position: usize,
}

/// Ordered, immutable phase list. Later phases read files written by earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    phases: Vec<PhaseDefinition>,
}

impl Pipeline {
    pub fn new<I, S>(phases: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, CommandSpec)>,
        S: Into<String>,
    {
        let phases: Vec<PhaseDefinition> = phases
            .into_iter()
            .enumerate()
            .map(|(position, (name, command))| PhaseDefinition {
                name: name.into(),
                command,
                position,
            })
            .collect();
        if phases.is_empty() {
            return Err(anyhow!("a pipeline needs at least one phase"));
        }
        for (i, phase) in phases.iter().enumerate() {
            if phases[..i].iter().any(|p| p.name == phase.name) {
                return Err(anyhow!("duplicate phase label: {}", phase.name));
            }
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    /// One zero-filled row per defined phase.
    pub fn fallback_records(&self) -> Vec<PhaseRecord> {
        self.phases
            .iter()
            .map(|p| PhaseRecord::zeroed(&p.name))
            .collect()
    }
}

/// Per-instance state. Built fresh for every instance and never shared across them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineRunState {
    pub timeout_occurred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Gating,
    ExecutingPhase(usize),
    ShortCircuited,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Rows exactly as persisted.
    pub records: Vec<PhaseRecord>,
    /// Phases actually started.
    pub attempted: usize,
    /// Label of the phase whose timeout short-circuited the run.
    pub timed_out_phase: Option<String>,
}

impl PipelineReport {
    pub fn timed_out(&self) -> bool {
        self.timed_out_phase.is_some()
    }
}

/// Drives one instance's phases through the idle gate and the phase recorder.
pub struct PipelineRunner<'h, G: ?Sized, E: ?Sized, S: ?Sized> {
    gate: &'h mut G,
    executor: &'h mut E,
    sampler: &'h mut S,
    timeout: Duration,
    state: RunnerState,
    trace: Vec<RunnerState>,
}

impl<'h, G, E, S> PipelineRunner<'h, G, E, S>
where
    G: IdleGate + ?Sized,
    E: CommandRunner + ?Sized,
    S: EnergySampler + ?Sized,
{
    pub fn new(
        gate: &'h mut G,
        executor: &'h mut E,
        sampler: &'h mut S,
        timeout: Duration,
    ) -> Self {
        Self {
            gate,
            executor,
            sampler,
            timeout,
            state: RunnerState::Idle,
            trace: vec![RunnerState::Idle],
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Every state of the latest run, starting with `Idle`.
    pub fn transitions(&self) -> &[RunnerState] {
        &self.trace
    }

    fn transition(&mut self, next: RunnerState) {
        debug!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
        self.trace.push(next);
    }

    fn gate(&mut self) {
        self.transition(RunnerState::Gating);
        if let IdleOutcome::WaitExpired { samples } = self.gate.await_idle() {
            warn!(samples, "proceeding without an idle system");
        }
    }

    /// Runs every phase in order and writes the instance table to `table_path`,
    /// replacing any earlier table. A timeout skips the remaining phases and
    /// persists the zero-filled fallback table instead.
    pub fn run(&mut self, pipeline: &Pipeline, table_path: &Path) -> Result<PipelineReport> {
        self.state = RunnerState::Idle;
        self.trace = vec![RunnerState::Idle];
        let mut run_state = PipelineRunState::default();
        let mut measured = Vec::with_capacity(pipeline.len());
        let mut timed_out_phase = None;

        for phase in pipeline.phases() {
            self.gate();
            self.transition(RunnerState::ExecutingPhase(phase.position));
            let result = recorder::measure(
                phase,
                self.timeout,
                &mut *self.executor,
                &mut *self.sampler,
            );
            measured.push(result.record);
            if result.outcome.is_timed_out() {
                run_state.timeout_occurred = true;
                timed_out_phase = Some(phase.name.clone());
                self.transition(RunnerState::ShortCircuited);
                break;
            }
        }

        let attempted = measured.len();
        let records = if run_state.timeout_occurred {
            info!(
                skipped = pipeline.len() - attempted,
                table = %table_path.display(),
                "writing fallback table after timeout"
            );
            pipeline.fallback_records()
        } else {
            measured
        };
        write_table(table_path, &records)?;
        self.transition(RunnerState::Completed);

        Ok(PipelineReport {
            records,
            attempted,
            timed_out_phase,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_follow_definition_order() {
        let pipeline = Pipeline::new(vec![
            ("Parsing", CommandSpec::new("a")),
            ("Grounding", CommandSpec::new("b")),
            ("Solving", CommandSpec::new("c")),
        ])
        .expect("pipeline");
        let positions: Vec<usize> = pipeline.phases().iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(pipeline.labels(), vec!["Parsing", "Grounding", "Solving"]);
    }

    #[test]
    fn rejects_empty_and_duplicate_pipelines() {
        assert!(Pipeline::new(Vec::<(&str, CommandSpec)>::new()).is_err());
        let err = Pipeline::new(vec![
            ("Parsing", CommandSpec::new("a")),
            ("Parsing", CommandSpec::new("b")),
        ])
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate phase label"));
    }

    #[test]
    fn fallback_has_one_zero_row_per_phase() {
        let pipeline = Pipeline::new(vec![
            ("Parsing", CommandSpec::new("a")),
            ("Grounding", CommandSpec::new("b")),
        ])
        .expect("pipeline");
        let rows = pipeline.fallback_records();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.is_zeroed()));
        assert_eq!(rows[1].label, "Grounding");
    }
}
