//! Stage pipeline definitions.
//!
//! A [`PipelineDefinition`] is pure data: an ordered list of linear stage
//! names plus an optional autonomous refinement loop
//! (`analyze -> author -> review`). The scheduler walks it with a
//! [`Cursor`] and asks [`PipelineDefinition::advance`] where to go next.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::JobType;
use crate::review::ReviewVerdict;

// ---------------------------------------------------------------------------
// Stage names
// ---------------------------------------------------------------------------

/// Reported as the top-level stage while the refinement loop runs.
pub const STAGE_AUTONOMOUS: &str = "autonomous";

/// Terminal stage forced once the pipeline is exhausted.
pub const STAGE_COMPLETE: &str = "complete";

pub const STAGE_ANALYZE: &str = "analyze";
pub const STAGE_AUTHOR: &str = "author";
pub const STAGE_REVIEW: &str = "review";

pub const STAGE_PARSE_SPEC: &str = "parse_spec";
pub const STAGE_AUTHOR_BLUEPRINT: &str = "author_blueprint";
pub const STAGE_PARSE_BLUEPRINT: &str = "parse_blueprint";
pub const STAGE_REVIEW_BLUEPRINT: &str = "review_blueprint";
pub const STAGE_GENERATE_SCRIPTS: &str = "generate_scripts";

/// Default bound on author/review cycles when the request does not set one.
pub const DEFAULT_MAX_ITERATIONS: i64 = 3;

/// Hard ceiling accepted from clients.
pub const MAX_ITERATIONS_LIMIT: i64 = 50;

const RESERVED_NAMES: [&str; 5] = [
    STAGE_AUTONOMOUS,
    STAGE_COMPLETE,
    STAGE_ANALYZE,
    STAGE_AUTHOR,
    STAGE_REVIEW,
];

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Sub-stages of the autonomous refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStage {
    Analyze,
    Author,
    Review,
}

impl LoopStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Analyze => STAGE_ANALYZE,
            Self::Author => STAGE_AUTHOR,
            Self::Review => STAGE_REVIEW,
        }
    }
}

/// Position of a job inside its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Cursor {
    /// Index into the linear stage list.
    Linear(usize),
    /// Inside the refinement loop.
    Loop(LoopStage),
    /// Pipeline exhausted; nothing left to execute.
    Complete,
}

/// Result of [`PipelineDefinition::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub cursor: Cursor,
    pub iteration: u32,
}

// ---------------------------------------------------------------------------
// Refinement loop
// ---------------------------------------------------------------------------

/// Bounded `analyze -> author -> review` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementLoop {
    max_iterations: u32,
}

impl RefinementLoop {
    /// Build a loop from a configured bound.
    ///
    /// Zero or negative bounds collapse to a single pass with no refinement.
    pub fn new(configured: i64) -> Self {
        let max_iterations = if configured <= 0 {
            1
        } else {
            u32::try_from(configured).unwrap_or(u32::MAX)
        };
        Self { max_iterations }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

// ---------------------------------------------------------------------------
// PipelineDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    stages: Vec<String>,
    refinement: Option<RefinementLoop>,
}

impl PipelineDefinition {
    /// Create a pipeline from explicit parts.
    ///
    /// Rules:
    /// - At least one stage must run (a linear stage or the loop).
    /// - Linear stage names must be non-empty, unique, and must not shadow
    ///   the loop or terminal stage names.
    pub fn new(stages: Vec<String>, refinement: Option<RefinementLoop>) -> Result<Self, CoreError> {
        if stages.is_empty() && refinement.is_none() {
            return Err(CoreError::Validation(
                "Pipeline must contain at least one stage".to_string(),
            ));
        }
        for (i, name) in stages.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "Stage name at index {i} must not be empty"
                )));
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Stage name '{name}' is reserved"
                )));
            }
            if stages[..i].contains(name) {
                return Err(CoreError::Validation(format!(
                    "Duplicate stage name '{name}'"
                )));
            }
        }
        Ok(Self { stages, refinement })
    }

    /// Built-in pipeline for a job type.
    pub fn for_job_type(job_type: JobType, autonomous: bool, max_iterations: i64) -> Self {
        let mut stages: Vec<String> = match job_type {
            JobType::Blueprint => vec![STAGE_PARSE_SPEC.into()],
            JobType::Review => vec![STAGE_PARSE_BLUEPRINT.into(), STAGE_REVIEW_BLUEPRINT.into()],
            JobType::Scripts => vec![STAGE_PARSE_BLUEPRINT.into(), STAGE_GENERATE_SCRIPTS.into()],
        };
        if job_type == JobType::Blueprint && !autonomous {
            stages.push(STAGE_AUTHOR_BLUEPRINT.into());
        }
        let refinement = autonomous.then(|| RefinementLoop::new(max_iterations));
        Self { stages, refinement }
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn is_autonomous(&self) -> bool {
        self.refinement.is_some()
    }

    /// Effective loop bound, `0` for linear pipelines.
    pub fn max_iterations(&self) -> u32 {
        self.refinement.map_or(0, |r| r.max_iterations())
    }

    /// Where a fresh job starts.
    pub fn first(&self) -> Cursor {
        if self.stages.is_empty() {
            Cursor::Loop(LoopStage::Analyze)
        } else {
            Cursor::Linear(0)
        }
    }

    /// Stage name recorded as the job's `current_stage`.
    pub fn stage_name(&self, cursor: Cursor) -> &str {
        match cursor {
            Cursor::Linear(i) => self.stages.get(i).map_or(STAGE_COMPLETE, String::as_str),
            Cursor::Loop(stage) => stage.name(),
            Cursor::Complete => STAGE_COMPLETE,
        }
    }

    /// `(stage, autonomous_stage)` pair reported in progress.
    pub fn progress_labels(&self, cursor: Cursor) -> (&str, Option<&'static str>) {
        match cursor {
            Cursor::Loop(stage) => (STAGE_AUTONOMOUS, Some(stage.name())),
            other => (self.stage_name(other), None),
        }
    }

    /// Whether `cursor` is a position this pipeline can execute.
    pub fn contains(&self, cursor: Cursor) -> bool {
        match cursor {
            Cursor::Linear(i) => i < self.stages.len(),
            Cursor::Loop(_) => self.refinement.is_some(),
            Cursor::Complete => true,
        }
    }

    /// Pick the next position after the stage at `cursor` succeeded.
    ///
    /// `iteration` counts author passes started so far. Entering `author`
    /// increments it. After `review` the loop goes back to `author` only
    /// when the verdict is not an accept and `iteration < max_iterations`;
    /// otherwise the pipeline is forced to [`Cursor::Complete`]. Ambiguous
    /// verdicts count as rejections, so the loop is always bounded.
    pub fn advance(&self, cursor: Cursor, iteration: u32, verdict: ReviewVerdict) -> Step {
        let step = |cursor, iteration| Step { cursor, iteration };
        match cursor {
            Cursor::Linear(i) if i + 1 < self.stages.len() => step(Cursor::Linear(i + 1), iteration),
            Cursor::Linear(_) => match self.refinement {
                Some(_) => step(Cursor::Loop(LoopStage::Analyze), iteration),
                None => step(Cursor::Complete, iteration),
            },
            Cursor::Loop(LoopStage::Analyze) => {
                step(Cursor::Loop(LoopStage::Author), iteration.saturating_add(1))
            }
            Cursor::Loop(LoopStage::Author) => step(Cursor::Loop(LoopStage::Review), iteration),
            Cursor::Loop(LoopStage::Review) => {
                let refine = verdict != ReviewVerdict::Accept && iteration < self.max_iterations();
                if refine {
                    step(Cursor::Loop(LoopStage::Author), iteration.saturating_add(1))
                } else {
                    step(Cursor::Complete, iteration)
                }
            }
            Cursor::Complete => step(Cursor::Complete, iteration),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
