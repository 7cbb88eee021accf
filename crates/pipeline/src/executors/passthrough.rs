//! Executor that does no real work.
//!
//! Used when no stage command is configured. Every stage echoes its
//! coordinates and the job input back as its output, and every review
//! accepts, so jobs run end to end without an external backend.

use async_trait::async_trait;
use forge_core::executor::{StageContext, StageError, StageExecutor, StageOutput};
use forge_core::pipeline::STAGE_REVIEW;
use serde_json::json;

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughExecutor;

#[async_trait]
impl StageExecutor for PassthroughExecutor {
    async fn execute(&self, context: StageContext) -> Result<StageOutput, StageError> {
        if context.stage == STAGE_REVIEW {
            return Ok(StageOutput::new(json!({
                "verdict": "accept",
                "iteration": context.iteration,
            }))
            .with_message(format!("Review accepted on iteration {}", context.iteration)));
        }

        Ok(StageOutput::new(json!({
            "stage": context.stage,
            "iteration": context.iteration,
            "input": context.input,
        })))
    }
}
