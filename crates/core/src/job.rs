//! Job records, submission DTOs, and the transition rules that keep a record
//! moving strictly forward.
//!
//! A [`Job`] is only ever changed through [`Job::apply`]. Every accepted
//! [`Transition`] bumps the per-job `sequence`, so a store that applies it
//! under one lock publishes the new state and the new sequence together.
//! Once a job is `completed` or `failed` it is a tombstone: every further
//! transition is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::pipeline::{Cursor, PipelineDefinition, DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_LIMIT};
use crate::types::{JobId, Sequence, Timestamp};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Structural authoring of a blueprint from a specification.
    Blueprint,
    /// Automated review of an existing blueprint.
    Review,
    /// Code/script generation from a blueprint.
    Scripts,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::Review => "review",
            Self::Scripts => "scripts",
        }
    }

    /// Whether the refinement loop is on when the request does not say.
    pub fn default_autonomous(self) -> bool {
        matches!(self, Self::Blueprint)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// DTO for creating a job via `POST /api/v1/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub job_type: JobType,
    pub input_payload: Value,
    /// Bound on author/review cycles. `<= 0` means a single pass.
    pub max_iterations: Option<i64>,
    /// Opt in or out of the refinement loop. Defaults per job type.
    pub autonomous: Option<bool>,
}

impl SubmitJob {
    /// Reject malformed requests before any record exists.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.input_payload.is_null() {
            return Err(CoreError::Validation(
                "input_payload must not be null".to_string(),
            ));
        }
        if let Some(max) = self.max_iterations {
            if max > MAX_ITERATIONS_LIMIT {
                return Err(CoreError::Validation(format!(
                    "max_iterations must not exceed {MAX_ITERATIONS_LIMIT}"
                )));
            }
        }
        Ok(())
    }
}

/// Latest progress note attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_stage: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Canonical job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub cursor: Option<Cursor>,
    /// Author passes started in the refinement loop.
    pub iteration: u32,
    /// Effective loop bound (`0` for linear pipelines).
    pub max_iterations: u32,
    pub autonomous: bool,
    pub input_payload: Value,
    pub result_payload: Option<Value>,
    pub error: Option<String>,
    pub progress: Option<Progress>,
    /// Latest output of every stage run so far, keyed by stage name.
    pub stage_outputs: Map<String, Value>,
    pub sequence: Sequence,
    /// Caller identifier from the access gate. Attribution only.
    pub submitted_by: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Build a queued job from a validated request.
    pub fn new(id: JobId, input: SubmitJob, submitted_by: impl Into<String>, default_max_iterations: i64) -> Self {
        let autonomous = input
            .autonomous
            .unwrap_or_else(|| input.job_type.default_autonomous());
        let configured = input.max_iterations.unwrap_or(default_max_iterations);
        let pipeline = PipelineDefinition::for_job_type(input.job_type, autonomous, configured);
        let now = chrono::Utc::now();

        Self {
            id,
            job_type: input.job_type,
            status: JobStatus::Queued,
            current_stage: None,
            cursor: None,
            iteration: 0,
            max_iterations: pipeline.max_iterations(),
            autonomous,
            input_payload: input.input_payload,
            result_payload: None,
            error: None,
            progress: None,
            stage_outputs: Map::new(),
            sequence: 0,
            submitted_by: submitted_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The pipeline this job runs. Derived from the record so a resumed run
    /// walks the same stages.
    pub fn pipeline(&self) -> PipelineDefinition {
        let bound = if self.autonomous {
            i64::from(self.max_iterations)
        } else {
            DEFAULT_MAX_ITERATIONS
        };
        PipelineDefinition::for_job_type(self.job_type, self.autonomous, bound)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a transition in place.
    ///
    /// On success the sequence is incremented and `updated_at` refreshed.
    /// On error the record is left untouched.
    pub fn apply(&mut self, transition: Transition) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Tombstoned {
                status: self.status,
            });
        }

        let pipeline = self.pipeline();

        match transition {
            Transition::Start { message } => {
                self.expect_status(JobStatus::Queued, "start")?;
                let cursor = pipeline.first();
                self.status = JobStatus::Processing;
                self.move_to(&pipeline, cursor, message);
            }

            Transition::Advance {
                from,
                to,
                iteration,
                output,
                message,
            } => {
                self.expect_status(JobStatus::Processing, "advance")?;
                self.expect_cursor(from)?;
                if to == Cursor::Complete || !pipeline.contains(to) {
                    return Err(TransitionError::UnknownStage { cursor: to });
                }
                if iteration < self.iteration {
                    return Err(TransitionError::IterationRegression {
                        current: self.iteration,
                        requested: iteration,
                    });
                }
                self.record_output(&pipeline, from, output);
                self.iteration = iteration;
                self.move_to(&pipeline, to, message);
            }

            Transition::Complete {
                from,
                output,
                message,
            } => {
                self.expect_status(JobStatus::Processing, "complete")?;
                self.expect_cursor(from)?;
                self.record_output(&pipeline, from, output);
                self.status = JobStatus::Completed;
                self.result_payload = Some(Value::Object(self.stage_outputs.clone()));
                self.move_to(&pipeline, Cursor::Complete, message);
            }

            Transition::Fail { error } => {
                let error = if error.trim().is_empty() {
                    "Job failed without an error message".to_string()
                } else {
                    error
                };
                self.status = JobStatus::Failed;
                let (stage, autonomous_stage) = self
                    .cursor
                    .map(|c| pipeline.progress_labels(c))
                    .map(|(s, a)| (s.to_string(), a.map(str::to_string)))
                    .unwrap_or_else(|| (JobStatus::Queued.as_str().to_string(), None));
                self.progress = Some(Progress {
                    stage,
                    autonomous_stage,
                    message: error.clone(),
                });
                self.error = Some(error);
            }
        }

        self.sequence += 1;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Client-facing snapshot for the status query endpoint.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            job_type: self.job_type,
            status: self.status,
            current_stage: self.current_stage.clone(),
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            progress: self.progress.clone(),
            sequence: self.sequence,
            result_payload: self.result_payload.clone(),
            error: self.error.clone(),
            submitted_by: self.submitted_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn expect_status(&self, expected: JobStatus, transition: &'static str) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError::InvalidState {
                status: self.status,
                transition,
            });
        }
        Ok(())
    }

    fn expect_cursor(&self, from: Cursor) -> Result<(), TransitionError> {
        if self.cursor != Some(from) {
            return Err(TransitionError::StaleCursor {
                expected: self.cursor,
                actual: from,
            });
        }
        Ok(())
    }

    fn record_output(&mut self, pipeline: &PipelineDefinition, from: Cursor, output: Value) {
        self.stage_outputs
            .insert(pipeline.stage_name(from).to_string(), output);
    }

    fn move_to(&mut self, pipeline: &PipelineDefinition, cursor: Cursor, message: String) {
        let (stage, autonomous_stage) = pipeline.progress_labels(cursor);
        self.cursor = Some(cursor);
        self.current_stage = Some(pipeline.stage_name(cursor).to_string());
        self.progress = Some(Progress {
            stage: stage.to_string(),
            autonomous_stage: autonomous_stage.map(str::to_string),
            message,
        });
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A single forward step of a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `queued -> processing`, entering the pipeline's first stage.
    Start { message: String },
    /// The stage at `from` succeeded with `output`; move to `to`.
    Advance {
        from: Cursor,
        to: Cursor,
        iteration: u32,
        output: Value,
        message: String,
    },
    /// The stage at `from` was the last one; the job is done.
    Complete {
        from: Cursor,
        output: Value,
        message: String,
    },
    /// The job failed. Allowed from `queued` or `processing`.
    Fail { error: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Advance { .. } => "advance",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

/// A transition the record refused. Any of these reaching the scheduler
/// means two writers raced on the same job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("Job is already {status} and can no longer change")]
    Tombstoned { status: JobStatus },

    #[error("Cannot {transition} a job in status {status}")]
    InvalidState {
        status: JobStatus,
        transition: &'static str,
    },

    #[error("Stale cursor: record is at {expected:?}, transition came from {actual:?}")]
    StaleCursor {
        expected: Option<Cursor>,
        actual: Cursor,
    },

    #[error("Cursor {cursor:?} is not part of this job's pipeline")]
    UnknownStage { cursor: Cursor },

    #[error("Iteration cannot go backwards (current {current}, requested {requested})")]
    IterationRegression { current: u32, requested: u32 },
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

/// Point-in-time snapshot served to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub progress: Option<Progress>,
    pub sequence: Sequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_by: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
