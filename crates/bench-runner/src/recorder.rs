use std::time::Duration;

use bench_core::PhaseRecord;
use tracing::{info, warn};

use crate::energy::{EnergySampler, RawReading};
use crate::executor::{CommandRunner, ExecutionOutcome, ExecutionStatus};
use crate::pipeline::PhaseDefinition;

/// Sampler readings arrive in micro-units; tables hold seconds and joules.
pub const MICRO_UNITS_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredPhase {
    pub record: PhaseRecord,
    pub outcome: ExecutionOutcome,
}

pub fn record_from_reading(label: &str, reading: &RawReading) -> PhaseRecord {
    PhaseRecord {
        label: label.to_string(),
        timestamp: reading.timestamp,
        duration: reading.duration_us / MICRO_UNITS_PER_UNIT,
        pkg: reading.pkg_uj / MICRO_UNITS_PER_UNIT,
        dram: reading.dram_uj / MICRO_UNITS_PER_UNIT,
        socket: reading.socket,
    }
}

/// Runs one phase inside the sampler's measurement boundary. Always yields a record:
/// a timed-out phase or an incomplete reading becomes a zero-filled row.
pub fn measure<E, S>(
    phase: &PhaseDefinition,
    timeout: Duration,
    executor: &mut E,
    sampler: &mut S,
) -> MeasuredPhase
where
    E: CommandRunner + ?Sized,
    S: EnergySampler + ?Sized,
{
    info!(phase = %phase.name, command = %phase.command.display(), "running phase");
    let sampled = sampler.measure(&mut || executor.run(&phase.command, timeout));

    match sampled.outcome.status {
        ExecutionStatus::Completed(_) => {}
        ExecutionStatus::Failed(code) => warn!(
            phase = %phase.name,
            exit_code = ?code,
            "phase command failed; continuing with the next phase"
        ),
        ExecutionStatus::TimedOut => warn!(
            phase = %phase.name,
            timeout_secs = timeout.as_secs_f64(),
            "phase timed out"
        ),
    }

    let record = match (&sampled.reading, sampled.outcome.is_timed_out()) {
        (Some(reading), false) => record_from_reading(&phase.name, reading),
        _ => PhaseRecord::zeroed(&phase.name),
    };
    MeasuredPhase {
        record,
        outcome: sampled.outcome,
    }
}
