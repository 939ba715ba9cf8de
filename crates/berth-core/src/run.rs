//! Per-step outcomes and the run result they accumulate into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::ContentDigest;

/// Terminal status of a step. `Pending` and `Running` are never recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    Skipped,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,

    /// Step kind label (`render_template`, ...).
    pub kind: String,

    pub status: StepStatus,

    /// False when an Applied step found the target already converged.
    pub changed: bool,

    /// Skip reason or failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Digest of the bytes now at the destination, for file-writing steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<ContentDigest>,

    pub duration_ms: u64,
}

impl StepRecord {
    pub fn applied(name: impl Into<String>, kind: &str, changed: bool) -> Self {
        Self::new(name, kind, StepStatus::Applied, changed, None)
    }

    pub fn skipped(name: impl Into<String>, kind: &str, reason: impl Into<String>) -> Self {
        Self::new(name, kind, StepStatus::Skipped, false, Some(reason.into()))
    }

    pub fn failed(name: impl Into<String>, kind: &str, detail: impl Into<String>) -> Self {
        Self::new(name, kind, StepStatus::Failed, false, Some(detail.into()))
    }

    fn new(
        name: impl Into<String>,
        kind: &str,
        status: StepStatus,
        changed: bool,
        detail: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.to_string(),
            status,
            changed,
            detail,
            content_digest: None,
            duration_ms: 0,
        }
    }

    pub fn with_digest(mut self, digest: ContentDigest) -> Self {
        self.content_digest = Some(digest);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Finalized, immutable result of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
}

impl RunResult {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// True iff no recorded step failed.
    pub fn success(&self) -> bool {
        self.failed_step().is_none()
    }

    /// The failing step, which is always the last record when present.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps
            .last()
            .filter(|s| s.status == StepStatus::Failed)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn changed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.changed).count()
    }

    pub fn statuses(&self) -> Vec<(&str, StepStatus)> {
        self.steps
            .iter()
            .map(|s| (s.name.as_str(), s.status))
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Accumulates step records; finalized into a [`RunResult`].
///
/// Once a Failed record is pushed the recorder is halted and rejects further
/// records, so the failing step is always last.
#[derive(Debug)]
pub struct RunRecorder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
    halted: bool,
}

impl Default for RunRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRecorder {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            steps: Vec::new(),
            halted: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Append a record. Returns `false` (and drops the record) if halted.
    pub fn push(&mut self, record: StepRecord) -> bool {
        if self.halted {
            tracing::warn!(step = %record.name, "record after failure ignored");
            return false;
        }
        if record.status == StepStatus::Failed {
            self.halted = true;
        }
        self.steps.push(record);
        true
    }

    pub fn finish(self) -> RunResult {
        RunResult {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            steps: self.steps,
        }
    }
}
