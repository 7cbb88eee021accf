/// Opaque job identity. Generated as UUID v7 so ids sort by creation time.
pub type JobId = uuid::Uuid;

/// Per-job progress sequence number.
pub type Sequence = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh job id.
pub fn new_job_id() -> JobId {
    uuid::Uuid::now_v7()
}
