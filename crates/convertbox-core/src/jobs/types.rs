//! Job state as seen by the shell.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::timing::{estimate_remaining, format_duration};
use crate::engine::EngineKind;
use crate::error::{ErrorReport, JobError};
use crate::file::OutputBlob;

/// Identity of one job run.
pub type JobId = Uuid;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// No job has run yet
    Idle,
    /// Waiting for the engine to be ready
    Preparing,
    /// Engine is working
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, JobPhase::Preparing | JobPhase::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Cancelled
        )
    }
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(OutputBlob),
    Cancelled,
    Failed(JobError),
}

impl JobOutcome {
    pub fn phase(&self) -> JobPhase {
        match self {
            JobOutcome::Succeeded(_) => JobPhase::Succeeded,
            JobOutcome::Cancelled => JobPhase::Cancelled,
            JobOutcome::Failed(_) => JobPhase::Failed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }

    pub fn output(&self) -> Option<&OutputBlob> {
        match self {
            JobOutcome::Succeeded(blob) => Some(blob),
            _ => None,
        }
    }
}

/// Everything the progress display needs about the current job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Option<JobId>,
    pub engine: EngineKind,
    pub phase: JobPhase,
    /// Fraction complete in [0, 1], never decreasing within one job
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Option<Duration>,
    #[serde(rename = "remaining_ms", serialize_with = "duration_ms")]
    pub remaining: Option<Duration>,
    /// Sticky "this is taking a while" flag
    pub slow: bool,
    pub error: Option<ErrorReport>,
    pub output_name: Option<String>,
}

impl JobSnapshot {
    pub fn idle(engine: EngineKind) -> Self {
        Self {
            job_id: None,
            engine,
            phase: JobPhase::Idle,
            progress: 0.0,
            started_at: None,
            elapsed: None,
            remaining: None,
            slow: false,
            error: None,
            output_name: None,
        }
    }

    pub(crate) fn preparing(engine: EngineKind, job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            phase: JobPhase::Preparing,
            started_at: Some(Utc::now()),
            elapsed: Some(Duration::ZERO),
            ..Self::idle(engine)
        }
    }

    /// Apply an engine progress report.
    pub(crate) fn record_progress(&mut self, fraction: f64, elapsed: Duration) {
        if fraction.is_finite() {
            self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
        }
        self.update_clock(elapsed);
    }

    /// Periodic refresh of elapsed/remaining time and the slow flag.
    pub(crate) fn tick(&mut self, elapsed: Duration, slow_after: Duration) {
        self.update_clock(elapsed);
        if elapsed >= slow_after && !self.slow {
            self.slow = true;
            tracing::info!(job = ?self.job_id, engine = %self.engine, "Job is taking a while");
        }
    }

    fn update_clock(&mut self, elapsed: Duration) {
        self.elapsed = Some(elapsed);
        self.remaining = if self.phase == JobPhase::Running {
            estimate_remaining(elapsed, self.progress)
        } else {
            None
        };
    }

    /// Record the terminal state. Clears the estimate and the slow flag.
    pub(crate) fn finish(&mut self, outcome: &JobOutcome, elapsed: Option<Duration>) {
        self.phase = outcome.phase();
        self.remaining = None;
        self.slow = false;
        if elapsed.is_some() {
            self.elapsed = elapsed;
        }
        match outcome {
            JobOutcome::Succeeded(blob) => {
                self.progress = 1.0;
                self.output_name = Some(blob.file_name.clone());
            }
            JobOutcome::Failed(err) => self.error = Some(err.into()),
            JobOutcome::Cancelled => {}
        }
    }

    pub fn elapsed_display(&self) -> Option<String> {
        self.elapsed.map(format_duration)
    }

    pub fn remaining_display(&self) -> Option<String> {
        self.remaining.map(format_duration)
    }
}

fn duration_ms<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
