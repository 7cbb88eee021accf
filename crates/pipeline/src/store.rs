//! Job record storage.
//!
//! [`JobStore`] is the seam between the scheduler and wherever records
//! live. [`InMemoryJobStore`] is the process-lifetime implementation: one
//! `RwLock` around the job map, transitions applied to a copy and swapped in
//! under the write lock, so readers only ever see whole snapshots.

use std::collections::HashMap;

use async_trait::async_trait;
use forge_core::error::CoreError;
use forge_core::job::{Job, JobStatus, JobType, Transition, TransitionError};
use forge_core::types::JobId;
use parking_lot::RwLock;
use serde::Deserialize;

/// Default page size for [`JobStore::list`].
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Largest page size a caller may request.
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} already exists")]
    Duplicate(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::NotFound {
                entity: "Job",
                id: id.to_string(),
            },
            StoreError::Duplicate(id) => CoreError::Conflict(format!("Job {id} already exists")),
            StoreError::Transition(e) => CoreError::Conflict(e.to_string()),
            StoreError::Backend(msg) => CoreError::Internal(msg),
        }
    }
}

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.map_or(true, |t| job.job_type == t)
    }

    fn page(&self) -> (usize, usize) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit as usize, offset as usize)
    }
}

/// Canonical storage for job records.
///
/// The scheduler is the only caller of [`insert`](Self::insert) and
/// [`apply`](Self::apply); everything else only reads.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a freshly created job.
    async fn insert(&self, job: Job) -> Result<Job, StoreError>;

    /// Snapshot of one job.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a transition atomically and return the committed snapshot.
    ///
    /// The state change and its sequence increment become visible together
    /// or not at all.
    async fn apply(&self, job_id: JobId, transition: Transition) -> Result<Job, StoreError>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

// ---------------------------------------------------------------------------
// InMemoryJobStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn apply(&self, job_id: JobId, transition: Transition) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        let current = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let mut next = current.clone();
        next.apply(transition)?;
        *current = next.clone();
        Ok(next)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let (limit, offset) = filter.page();
        let jobs = self.jobs.read();
        let mut matching: Vec<&Job> = jobs.values().filter(|job| filter.matches(job)).collect();
        // UUID v7 ids sort by creation time.
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
