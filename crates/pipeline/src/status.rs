//! Read-only status queries over the job store.

use std::sync::Arc;

use forge_core::error::CoreError;
use forge_core::job::JobStatusView;
use forge_core::types::JobId;

use crate::store::{JobFilter, JobStore};

/// Serves point-in-time job snapshots to polling clients.
///
/// Never writes. Because the scheduler commits before it publishes, a
/// snapshot taken here is at least as new as any event a subscriber has
/// already received.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, job_id: JobId) -> Result<JobStatusView, CoreError> {
        self.store
            .get(job_id)
            .await?
            .map(|job| job.status_view())
            .ok_or_else(|| CoreError::NotFound {
                entity: "Job",
                id: job_id.to_string(),
            })
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobStatusView>, CoreError> {
        let jobs = self.store.list(filter).await?;
        Ok(jobs.iter().map(|job| job.status_view()).collect())
    }
}
