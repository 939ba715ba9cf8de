//! Structured lifecycle events for a run.
//!
//! Every event carries an `event` field (`run.started`, `step.finished`, ...)
//! so JSON logs can be filtered without parsing messages. Context values are
//! never logged, only variable counts.

use tracing::{info, warn};

use crate::run::{RunResult, StepRecord, StepStatus};

/// Run-scoped span. Attach it to the run future with `Instrument` so every
/// step event carries the `run_id`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("berth.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, total_steps: usize, notify_enabled: bool) {
    info!(
        event = "run.started",
        run_id = %run_id,
        total_steps = total_steps,
        notify_enabled = notify_enabled,
    );
}

pub fn emit_step_started(index: usize, name: &str, kind: &str) {
    tracing::debug!(event = "step.started", index = index, step = %name, kind = %kind);
}

/// Skipped and Applied steps log at info, failures at warn.
pub fn emit_step_finished(record: &StepRecord) {
    let detail = record.detail.as_deref().unwrap_or("");
    match record.status {
        StepStatus::Failed => warn!(
            event = "step.finished",
            step = %record.name,
            kind = %record.kind,
            status = %record.status,
            duration_ms = record.duration_ms,
            detail = %detail,
        ),
        _ => info!(
            event = "step.finished",
            step = %record.name,
            kind = %record.kind,
            status = %record.status,
            changed = record.changed,
            duration_ms = record.duration_ms,
            detail = %detail,
        ),
    }
}

pub fn emit_run_finished(result: &RunResult) {
    info!(
        event = "run.finished",
        run_id = %result.run_id(),
        duration_ms = result.duration_ms(),
        applied = result.count(StepStatus::Applied),
        skipped = result.count(StepStatus::Skipped),
        changed = result.changed_count(),
        success = result.success(),
    );
}
