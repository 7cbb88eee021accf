//! Progress events pushed to subscribers after every job transition.
//!
//! Serialized with a `type` tag of `progress`, `completed`, or `failed`,
//! which is the message format of the push endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobStatus};
use crate::types::{JobId, Sequence, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: JobId,
    /// Per-job, non-decreasing. Matches the record's `sequence` at the
    /// moment the transition was committed.
    pub sequence: Sequence,
    pub status: JobStatus,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_stage: Option<String>,
    pub message: String,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    /// Build the event describing a committed job snapshot.
    pub fn from_job(job: &Job) -> Self {
        let kind = match job.status {
            JobStatus::Completed => EventKind::Completed,
            JobStatus::Failed => EventKind::Failed,
            JobStatus::Queued | JobStatus::Processing => EventKind::Progress,
        };
        let (stage, autonomous_stage, message) = match &job.progress {
            Some(p) => (p.stage.clone(), p.autonomous_stage.clone(), p.message.clone()),
            None => (job.status.as_str().to_string(), None, String::new()),
        };

        Self {
            kind,
            job_id: job.id,
            sequence: job.sequence,
            status: job.status,
            stage,
            autonomous_stage,
            message,
            iteration: job.iteration,
            result_payload: job.result_payload.clone(),
            error: job.error.clone(),
            timestamp: job.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::job::{JobType, SubmitJob, Transition};
    use crate::types::new_job_id;

    fn job() -> Job {
        Job::new(
            new_job_id(),
            SubmitJob {
                job_type: JobType::Scripts,
                input_payload: json!({}),
                max_iterations: None,
                autonomous: None,
            },
            "tester",
            3,
        )
    }

    #[test]
    fn progress_event_serializes_with_type_tag() {
        let mut job = job();
        job.apply(Transition::Start { message: "starting".into() }).unwrap();
        let event = ProgressEvent::from_job(&job);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["stage"], "parse_blueprint");
        assert!(json.get("autonomous_stage").is_none());
        assert!(json.get("result_payload").is_none());
    }

    #[test]
    fn failed_job_yields_terminal_event() {
        let mut job = job();
        job.apply(Transition::Fail { error: "executor down".into() }).unwrap();
        let event = ProgressEvent::from_job(&job);
        assert_eq!(event.kind, EventKind::Failed);
        assert!(event.is_terminal());
        assert_eq!(event.error.as_deref(), Some("executor down"));
    }

    #[test]
    fn event_round_trips_through_json() {
        let mut job = job();
        job.apply(Transition::Start { message: String::new() }).unwrap();
        let event = ProgressEvent::from_job(&job);
        let text = serde_json::to_string(&event).unwrap();
        let back: ProgressEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }
}
