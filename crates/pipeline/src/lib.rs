//! Job execution for the stage-pipeline service.
//!
//! - [`store`] holds job records ([`JobStore`], [`InMemoryJobStore`]).
//! - [`scheduler`] drives a job through its pipeline and publishes every
//!   committed transition.
//! - [`worker_pool`] runs submitted jobs concurrently.
//! - [`status`] answers polling queries.
//! - [`executors`] bundles the command and passthrough stage executors.

pub mod executors;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod worker_pool;

pub use scheduler::{JobQueue, RunOutcome, Scheduler, SchedulerConfig, SchedulerError};
pub use status::StatusService;
pub use store::{InMemoryJobStore, JobFilter, JobStore, StoreError};
pub use worker_pool::WorkerPool;
