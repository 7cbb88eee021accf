//! Domain types for the stage-pipeline job service.
//!
//! Pure data and rules, no I/O:
//!
//! - [`job`] -- job records, submission DTOs, forward-only transitions.
//! - [`pipeline`] -- stage pipeline definitions and the refinement loop.
//! - [`progress`] -- progress events pushed to subscribers.
//! - [`executor`] -- the [`StageExecutor`](executor::StageExecutor) seam.
//! - [`review`] -- review verdict classification.
//! - [`wizard`] -- client wizard navigator driven by terminal events.

pub mod error;
pub mod executor;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod review;
pub mod types;
pub mod wizard;
