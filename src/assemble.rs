//! Mapping of execution outcomes onto the response contract.

use std::time::Duration;

use crate::config::Floors;
use crate::error::EngineError;
use crate::metrics::MetricsAggregate;
use crate::profile::Measurement;
use crate::request::{ExecutionResponse, ExecutionStatus};
use crate::sandbox::ExecutionOutcome;

/// Measured values before any profile adjustment.
///
/// Runs without an exit of their own fall back to the coordinator's
/// wall-clock time.
pub fn measure(
    outcome: &ExecutionOutcome,
    aggregate: &MetricsAggregate,
    wall_elapsed: Duration,
) -> Measurement {
    let elapsed = match outcome {
        ExecutionOutcome::Exited { elapsed, .. } => *elapsed,
        ExecutionOutcome::TimedOut | ExecutionOutcome::Failed { .. } => wall_elapsed,
    };
    Measurement {
        execution_time_ms: duration_ms(elapsed),
        memory_mb: aggregate.peak_memory_mb,
        cpu_percent: aggregate.mean_cpu_percent,
    }
}

/// Build the response for a run that produced an outcome.
///
/// A timed-out run reports the requested timeout as its duration, since the
/// true elapsed time is unknown once the sandbox was cut off.
pub fn assemble(
    outcome: ExecutionOutcome,
    reported: Measurement,
    timeout: Duration,
) -> ExecutionResponse {
    let (status, output, error_message, execution_time_ms) = match outcome {
        ExecutionOutcome::Exited {
            exit_code: 0,
            output,
            ..
        } => (ExecutionStatus::Success, output, String::new(), reported.execution_time_ms),
        ExecutionOutcome::Exited {
            exit_code, output, ..
        } => {
            let message = if output.trim().is_empty() {
                EngineError::ExecutionFailure { exit_code }.to_string()
            } else {
                output
            };
            (ExecutionStatus::Error, String::new(), message, reported.execution_time_ms)
        }
        ExecutionOutcome::TimedOut => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            (
                ExecutionStatus::Timeout,
                String::new(),
                EngineError::ExecutionTimeout { timeout_ms }.to_string(),
                duration_ms(timeout),
            )
        }
        ExecutionOutcome::Failed { reason } => (
            ExecutionStatus::Error,
            String::new(),
            reason,
            reported.execution_time_ms,
        ),
    };

    ExecutionResponse {
        status,
        output,
        error_message,
        execution_time_ms,
        memory_usage_mb: reported.memory_mb,
        cpu_usage_percent: reported.cpu_percent,
    }
}

/// Build the response for a failure that prevented an outcome.
pub fn failure(error: &EngineError, elapsed: Duration, floors: &Floors) -> ExecutionResponse {
    let floor = MetricsAggregate::floor(floors);
    ExecutionResponse {
        status: ExecutionStatus::Error,
        output: String::new(),
        error_message: error.to_string(),
        execution_time_ms: duration_ms(elapsed),
        memory_usage_mb: floor.peak_memory_mb,
        cpu_usage_percent: floor.mean_cpu_percent,
    }
}

/// Milliseconds, exact for whole-millisecond durations.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs() as f64 * 1000.0 + f64::from(d.subsec_nanos()) / 1_000_000.0
}
