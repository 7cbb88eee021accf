//! Client-side generation wizard as a finite-state navigator.
//!
//! The wizard walks `input -> mode -> review -> output`. It moves forward
//! only when a job it is waiting on reaches a terminal event; the scheduler
//! never looks at it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::progress::{EventKind, ProgressEvent};
use crate::types::JobId;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    Input,
    Mode,
    Review,
    Output,
}

impl WizardStep {
    pub fn label(self) -> &'static str {
        match self {
            Self::Input => "Specification",
            Self::Mode => "Generation Mode",
            Self::Review => "Blueprint Review",
            Self::Output => "Scripts",
        }
    }
}

/// How the blueprint is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardMode {
    /// Single authoring pass.
    Manual,
    /// Bounded analyze/author/review loop.
    Autonomous,
}

impl WizardMode {
    pub fn is_autonomous(self) -> bool {
        matches!(self, Self::Autonomous)
    }
}

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WizardNavigator {
    step: Option<WizardStep>,
    mode: Option<WizardMode>,
    blueprint_job: Option<JobId>,
    scripts_job: Option<JobId>,
    blueprint: Option<Value>,
    scripts: Option<Value>,
    last_error: Option<String>,
}

impl WizardNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self) -> WizardStep {
        self.step.unwrap_or(WizardStep::Input)
    }

    pub fn mode(&self) -> Option<WizardMode> {
        self.mode
    }

    pub fn blueprint(&self) -> Option<&Value> {
        self.blueprint.as_ref()
    }

    pub fn scripts(&self) -> Option<&Value> {
        self.scripts.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether a job is in flight for the current step.
    pub fn is_waiting(&self) -> bool {
        match self.step() {
            WizardStep::Mode => self.blueprint_job.is_some(),
            WizardStep::Review => self.scripts_job.is_some(),
            WizardStep::Input | WizardStep::Output => false,
        }
    }

    /// `input -> mode` once a specification has been provided.
    pub fn submit_input(&mut self) -> Result<WizardStep, CoreError> {
        self.expect(WizardStep::Input, "submit a specification")?;
        self.step = Some(WizardStep::Mode);
        Ok(self.step())
    }

    /// Record the chosen mode and the blueprint job started for it.
    pub fn start_blueprint(&mut self, mode: WizardMode, job_id: JobId) -> Result<(), CoreError> {
        self.expect(WizardStep::Mode, "start blueprint generation")?;
        self.mode = Some(mode);
        self.blueprint_job = Some(job_id);
        self.last_error = None;
        Ok(())
    }

    /// Record the scripts job started from the reviewed blueprint.
    pub fn start_scripts(&mut self, job_id: JobId) -> Result<(), CoreError> {
        self.expect(WizardStep::Review, "start script generation")?;
        self.scripts_job = Some(job_id);
        self.last_error = None;
        Ok(())
    }

    /// Feed a push or polled event. Only terminal events of the job the
    /// current step waits on have an effect.
    pub fn on_event(&mut self, event: &ProgressEvent) -> WizardStep {
        if !event.is_terminal() {
            return self.step();
        }

        let waiting_on = match self.step() {
            WizardStep::Mode => self.blueprint_job,
            WizardStep::Review => self.scripts_job,
            WizardStep::Input | WizardStep::Output => None,
        };
        if waiting_on != Some(event.job_id) {
            return self.step();
        }

        match (self.step(), event.kind) {
            (WizardStep::Mode, EventKind::Completed) => {
                self.blueprint = event.result_payload.clone();
                self.blueprint_job = None;
                self.step = Some(WizardStep::Review);
            }
            (WizardStep::Review, EventKind::Completed) => {
                self.scripts = event.result_payload.clone();
                self.scripts_job = None;
                self.step = Some(WizardStep::Output);
            }
            (WizardStep::Mode, EventKind::Failed) => {
                self.blueprint_job = None;
                self.last_error = event.error.clone();
            }
            (WizardStep::Review, EventKind::Failed) => {
                self.scripts_job = None;
                self.last_error = event.error.clone();
            }
            _ => {}
        }
        self.step()
    }

    /// Step back one screen. Pending jobs are forgotten.
    pub fn back(&mut self) -> WizardStep {
        self.step = Some(match self.step() {
            WizardStep::Input | WizardStep::Mode => WizardStep::Input,
            WizardStep::Review => WizardStep::Mode,
            WizardStep::Output => WizardStep::Review,
        });
        self.blueprint_job = None;
        self.scripts_job = None;
        self.step()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn expect(&self, step: WizardStep, action: &str) -> Result<(), CoreError> {
        if self.step() != step {
            return Err(CoreError::Validation(format!(
                "Cannot {action} from the '{}' step",
                self.step().label()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
