//! Stage executor interface.
//!
//! Defines [`StageExecutor`], the capability the scheduler calls to do the
//! (possibly AI-backed, possibly slow) work of one stage, along with
//! [`StageContext`], [`StageOutput`], and [`StageError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::JobType;
use crate::types::JobId;

/// Everything an executor sees for one stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// Name of the stage to run (`current_stage` of the job).
    pub stage: String,
    /// Set when the stage is part of the refinement loop.
    pub autonomous_stage: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    /// The job's immutable input payload.
    pub input: Value,
    /// Latest output of every stage that ran before this one.
    pub outputs: Map<String, Value>,
}

/// Successful result of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: Value,
    /// Optional human-readable note used as the progress message.
    #[serde(default)]
    pub message: Option<String>,
}

impl StageOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Errors a stage can end with. All of them fail the job.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The executor ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The stage exceeded its time budget.
    #[error("Stage '{stage}' timed out after {elapsed_ms}ms")]
    Timeout { stage: String, elapsed_ms: u64 },

    /// The executor task panicked or was aborted.
    #[error("Stage executor crashed: {0}")]
    Crashed(String),

    /// The executor returned something that is not a structured payload.
    #[error("Invalid stage output: {0}")]
    InvalidOutput(String),
}

/// Performs the work of a single stage.
///
/// Implementations may take seconds to minutes and may fail. Retry policy,
/// if any, belongs to the implementation; the scheduler never retries.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, context: StageContext) -> Result<StageOutput, StageError>;
}
