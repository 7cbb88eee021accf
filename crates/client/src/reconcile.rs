//! Client-side view of one job, reconciled from pushed events and polled
//! snapshots.
//!
//! Both sources carry the per-job sequence number. The view only ever moves
//! forward: anything at or below the sequence it already holds is stale, and
//! nothing is applied after a terminal state. A jump of more than one means
//! events were missed, which the caller repairs by fetching a snapshot.

use forge_core::job::{JobStatus, JobStatusView};
use forge_core::progress::ProgressEvent;
use forge_core::types::{JobId, Sequence};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub autonomous_stage: Option<String>,
    pub message: Option<String>,
    pub iteration: u32,
    pub sequence: Sequence,
    pub result_payload: Option<Value>,
    pub error: Option<String>,
}

/// What [`JobView::apply_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event was the next one in sequence.
    Updated,
    /// Already seen, older than the view, or arrived after a terminal state.
    Stale,
    /// Applied, but events between `expected` and `received` were missed.
    Gap { expected: Sequence, received: Sequence },
    /// The event belongs to a different job.
    ForeignJob,
}

impl JobView {
    pub fn from_snapshot(view: &JobStatusView) -> Self {
        let (stage, autonomous_stage, message) = match &view.progress {
            Some(p) => (
                Some(p.stage.clone()),
                p.autonomous_stage.clone(),
                Some(p.message.clone()),
            ),
            None => (None, None, None),
        };
        Self {
            job_id: view.job_id,
            status: view.status,
            stage,
            autonomous_stage,
            message,
            iteration: view.iteration,
            sequence: view.sequence,
            result_payload: view.result_payload.clone(),
            error: view.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn apply_event(&mut self, event: &ProgressEvent) -> Applied {
        if event.job_id != self.job_id {
            return Applied::ForeignJob;
        }
        if event.sequence <= self.sequence || self.is_terminal() {
            return Applied::Stale;
        }

        let expected = self.sequence + 1;
        self.status = event.status;
        self.stage = Some(event.stage.clone());
        self.autonomous_stage = event.autonomous_stage.clone();
        self.message = Some(event.message.clone());
        self.iteration = event.iteration;
        self.sequence = event.sequence;
        self.result_payload = event.result_payload.clone();
        self.error = event.error.clone();

        if event.sequence == expected {
            Applied::Updated
        } else {
            Applied::Gap {
                expected,
                received: event.sequence,
            }
        }
    }

    /// Replace the view with `snapshot` unless it is older. Returns whether
    /// the view moved forward.
    pub fn apply_snapshot(&mut self, snapshot: &JobStatusView) -> bool {
        if snapshot.job_id != self.job_id || snapshot.sequence < self.sequence {
            return false;
        }
        let advanced = snapshot.sequence > self.sequence;
        *self = Self::from_snapshot(snapshot);
        advanced
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use forge_core::job::{JobType, Progress};
    use forge_core::progress::EventKind;
    use forge_core::types::new_job_id;

    use super::*;

    fn snapshot(job_id: JobId, status: JobStatus, sequence: Sequence) -> JobStatusView {
        let now = chrono::Utc::now();
        JobStatusView {
            job_id,
            job_type: JobType::Scripts,
            status,
            current_stage: None,
            iteration: 0,
            max_iterations: 0,
            progress: (sequence > 0).then(|| Progress {
                stage: "parse_blueprint".into(),
                autonomous_stage: None,
                message: format!("at {sequence}"),
            }),
            sequence,
            result_payload: None,
            error: None,
            submitted_by: "tester".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn event(job_id: JobId, sequence: Sequence, status: JobStatus) -> ProgressEvent {
        let kind = match status {
            JobStatus::Completed => EventKind::Completed,
            JobStatus::Failed => EventKind::Failed,
            _ => EventKind::Progress,
        };
        ProgressEvent {
            kind,
            job_id,
            sequence,
            status,
            stage: "generate_scripts".into(),
            autonomous_stage: None,
            message: format!("event {sequence}"),
            iteration: 0,
            result_payload: None,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn next_event_updates_view() {
        let id = new_job_id();
        let mut view = JobView::from_snapshot(&snapshot(id, JobStatus::Queued, 0));
        assert_eq!(view.stage, None);

        assert_eq!(view.apply_event(&event(id, 1, JobStatus::Processing)), Applied::Updated);
        assert_eq!(view.sequence, 1);
        assert_eq!(view.status, JobStatus::Processing);
        assert_eq!(view.message.as_deref(), Some("event 1"));
    }

    #[test]
    fn duplicate_and_older_events_are_stale() {
        let id = new_job_id();
        let mut view = JobView::from_snapshot(&snapshot(id, JobStatus::Processing, 3));

        assert_eq!(view.apply_event(&event(id, 3, JobStatus::Processing)), Applied::Stale);
        assert_eq!(view.apply_event(&event(id, 2, JobStatus::Processing)), Applied::Stale);
        assert_eq!(view.sequence, 3);
        assert_eq!(view.message.as_deref(), Some("at 3"));
    }

    #[test]
    fn skipped_sequence_reports_gap() {
        let id = new_job_id();
        let mut view = JobView::from_snapshot(&snapshot(id, JobStatus::Processing, 1));

        assert_matches!(
            view.apply_event(&event(id, 4, JobStatus::Processing)),
            Applied::Gap { expected: 2, received: 4 }
        );
        assert_eq!(view.sequence, 4);
    }

    #[test]
    fn nothing_applies_after_terminal() {
        let id = new_job_id();
        let mut view = JobView::from_snapshot(&snapshot(id, JobStatus::Processing, 1));
        assert_eq!(view.apply_event(&event(id, 2, JobStatus::Completed)), Applied::Updated);
        assert!(view.is_terminal());

        assert_eq!(view.apply_event(&event(id, 3, JobStatus::Processing)), Applied::Stale);
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[test]
    fn events_for_other_jobs_are_ignored() {
        let mut view = JobView::from_snapshot(&snapshot(new_job_id(), JobStatus::Queued, 0));
        assert_eq!(
            view.apply_event(&event(new_job_id(), 1, JobStatus::Processing)),
            Applied::ForeignJob
        );
        assert_eq!(view.sequence, 0);
    }

    #[test]
    fn older_snapshot_does_not_regress_view() {
        let id = new_job_id();
        let mut view = JobView::from_snapshot(&snapshot(id, JobStatus::Queued, 0));
        view.apply_event(&event(id, 1, JobStatus::Processing));
        view.apply_event(&event(id, 2, JobStatus::Processing));

        assert!(!view.apply_snapshot(&snapshot(id, JobStatus::Processing, 1)));
        assert_eq!(view.sequence, 2);

        assert!(view.apply_snapshot(&snapshot(id, JobStatus::Completed, 3)));
        assert_eq!(view.sequence, 3);
        assert!(view.is_terminal());
    }
}
