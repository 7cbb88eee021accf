//! Job scheduler.
//!
//! Owns the run loop for a single job: read the record, run the stage the
//! cursor points at, classify review output, pick the next stage, commit.
//! Every commit goes to the store first and is published second, so a
//! sequence that reached a subscriber is always already visible to polling.
//!
//! Runs are mutually exclusive per job. A second `run` for a job that is
//! already running returns [`RunOutcome::AlreadyRunning`] without touching
//! the record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use forge_core::error::CoreError;
use forge_core::executor::{StageContext, StageError, StageExecutor, StageOutput};
use forge_core::job::{Job, JobStatus, SubmitJob, Transition};
use forge_core::pipeline::{Cursor, LoopStage, PipelineDefinition, Step, DEFAULT_MAX_ITERATIONS};
use forge_core::progress::ProgressEvent;
use forge_core::review::{self, ReviewVerdict};
use forge_core::types::{new_job_id, JobId};
use forge_events::ProgressPublisher;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::store::{JobStore, StoreError};

/// Default per-stage executor timeout (5 minutes).
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Loop bound applied when a request does not set `max_iterations`.
    pub default_max_iterations: i64,
    /// Upper bound on a single executor call.
    pub stage_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// Another run holds this job.
    AlreadyRunning,
    /// The job was already completed or failed.
    AlreadyTerminal,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store refused a transition the scheduler believed valid.
    #[error("Invariant violated for job {job_id}: {reason}")]
    Invariant { job_id: JobId, reason: String },

    #[error("Job queue is closed")]
    QueueClosed,
}

impl From<SchedulerError> for CoreError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Core(e) => e,
            SchedulerError::Store(e) => e.into(),
            SchedulerError::Invariant { job_id, reason } => {
                CoreError::Internal(format!("Job {job_id}: {reason}"))
            }
            SchedulerError::QueueClosed => {
                CoreError::Internal("Scheduler is shutting down".to_string())
            }
        }
    }
}

/// Receiving half of the scheduler's run queue, consumed by the
/// [`WorkerPool`](crate::worker_pool::WorkerPool).
pub struct JobQueue {
    receiver: mpsc::UnboundedReceiver<JobId>,
}

impl JobQueue {
    pub async fn recv(&mut self) -> Option<JobId> {
        self.receiver.recv().await
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    publisher: ProgressPublisher,
    executor: Arc<dyn StageExecutor>,
    config: SchedulerConfig,
    running: Mutex<HashSet<JobId>>,
    queue: mpsc::UnboundedSender<JobId>,
}

impl Scheduler {
    /// Create a scheduler and the queue its submitted jobs are pushed to.
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: ProgressPublisher,
        executor: Arc<dyn StageExecutor>,
        config: SchedulerConfig,
    ) -> (Self, JobQueue) {
        let (queue, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            store,
            publisher,
            executor,
            config,
            running: Mutex::new(HashSet::new()),
            queue,
        };
        (scheduler, JobQueue { receiver })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.publisher
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running.lock().contains(&job_id)
    }

    /// Validate a request, create the queued record, and schedule one run.
    ///
    /// Invalid input returns before anything is stored.
    pub async fn submit(&self, input: SubmitJob, caller: &str) -> Result<Job, SchedulerError> {
        input.validate()?;
        if self.queue.is_closed() {
            return Err(SchedulerError::QueueClosed);
        }

        let job = Job::new(new_job_id(), input, caller, self.config.default_max_iterations);
        let job = self.store.insert(job).await?;

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            caller,
            autonomous = job.autonomous,
            max_iterations = job.max_iterations,
            "Job submitted",
        );

        if self.queue.send(job.id).is_err() {
            tracing::warn!(job_id = %job.id, "Job queue closed after insert, failing job");
            self.commit(
                job.id,
                Transition::Fail {
                    error: "Scheduler is shutting down".to_string(),
                },
            )
            .await?;
            return Err(SchedulerError::QueueClosed);
        }

        Ok(job)
    }

    /// Drive a job until it completes or fails.
    pub async fn run(&self, job_id: JobId) -> Result<RunOutcome, SchedulerError> {
        let Some(_guard) = RunGuard::acquire(&self.running, job_id) else {
            tracing::debug!(%job_id, "Run skipped, job is already running");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        if job.is_terminal() {
            tracing::debug!(%job_id, status = %job.status, "Run skipped, job is terminal");
            return Ok(RunOutcome::AlreadyTerminal);
        }

        if job.cursor.is_none() {
            let message = format!("Starting {} job", job.job_type);
            job = self.commit(job_id, Transition::Start { message }).await?;
        }
        let pipeline = job.pipeline();

        loop {
            let cursor = match job.cursor {
                Some(cursor) if cursor != Cursor::Complete => cursor,
                other => {
                    return Err(self.invariant(
                        job_id,
                        format!("processing job has no runnable cursor ({other:?})"),
                    ));
                }
            };
            let stage = pipeline.stage_name(cursor).to_string();

            tracing::info!(
                %job_id,
                stage = %stage,
                iteration = job.iteration,
                max_iterations = job.max_iterations,
                "Running stage",
            );

            let output = match self.execute_stage(stage_context(&job, &pipeline, cursor)).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(%job_id, stage = %stage, error = %e, "Stage failed");
                    self.commit(job_id, Transition::Fail { error: e.to_string() })
                        .await?;
                    return Ok(RunOutcome::Failed);
                }
            };

            let verdict = match cursor {
                Cursor::Loop(LoopStage::Review) => {
                    let verdict = review::classify(&output.payload);
                    tracing::debug!(%job_id, iteration = job.iteration, ?verdict, "Review classified");
                    verdict
                }
                _ => ReviewVerdict::Accept,
            };
            let step = pipeline.advance(cursor, job.iteration, verdict);
            let transition = next_transition(&pipeline, &job, cursor, step, verdict, output);

            job = self.commit(job_id, transition).await?;
            if job.status == JobStatus::Completed {
                tracing::info!(%job_id, iteration = job.iteration, sequence = job.sequence, "Job completed");
                return Ok(RunOutcome::Completed);
            }
        }
    }

    /// Run one executor call in its own task, bounded by the stage timeout.
    ///
    /// A panicking executor becomes [`StageError::Crashed`]. On timeout the
    /// task is aborted and the scheduler stops waiting for it.
    async fn execute_stage(&self, context: StageContext) -> Result<StageOutput, StageError> {
        let stage = context.stage.clone();
        let executor = Arc::clone(&self.executor);
        let start = Instant::now();

        let mut task = tokio::spawn(async move { executor.execute(context).await });

        match tokio::time::timeout(self.config.stage_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(StageError::Crashed(panic_message(e.into_panic()))),
            Ok(Err(e)) => Err(StageError::Crashed(e.to_string())),
            Err(_) => {
                task.abort();
                Err(StageError::Timeout {
                    stage,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Commit a transition, then publish the committed snapshot.
    async fn commit(&self, job_id: JobId, transition: Transition) -> Result<Job, SchedulerError> {
        let name = transition.name();
        let job = match self.store.apply(job_id, transition).await {
            Ok(job) => job,
            Err(StoreError::Transition(source)) => {
                return Err(self.invariant(job_id, format!("{name} rejected: {source}")));
            }
            Err(e) => return Err(e.into()),
        };

        let delivered = self.publisher.publish(ProgressEvent::from_job(&job));
        tracing::debug!(
            %job_id,
            transition = name,
            sequence = job.sequence,
            status = %job.status,
            stage = job.current_stage.as_deref().unwrap_or_default(),
            delivered,
            "Transition committed",
        );
        Ok(job)
    }

    fn invariant(&self, job_id: JobId, reason: String) -> SchedulerError {
        tracing::error!(%job_id, reason = %reason, "Scheduler invariant violated");
        debug_assert!(false, "scheduler invariant violated for job {job_id}: {reason}");
        SchedulerError::Invariant { job_id, reason }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stage_context(job: &Job, pipeline: &PipelineDefinition, cursor: Cursor) -> StageContext {
    let (_, autonomous_stage) = pipeline.progress_labels(cursor);
    StageContext {
        job_id: job.id,
        job_type: job.job_type,
        stage: pipeline.stage_name(cursor).to_string(),
        autonomous_stage: autonomous_stage.map(str::to_string),
        iteration: job.iteration,
        max_iterations: job.max_iterations,
        input: job.input_payload.clone(),
        outputs: job.stage_outputs.clone(),
    }
}

fn next_transition(
    pipeline: &PipelineDefinition,
    job: &Job,
    from: Cursor,
    step: Step,
    verdict: ReviewVerdict,
    output: StageOutput,
) -> Transition {
    let finished = pipeline.stage_name(from);
    let is_review = from == Cursor::Loop(LoopStage::Review);

    if step.cursor == Cursor::Complete {
        let message = output.message.unwrap_or_else(|| match (is_review, verdict) {
            (true, ReviewVerdict::Accept) => {
                format!("Review accepted on iteration {}", step.iteration)
            }
            (true, _) => format!(
                "Iteration limit reached ({} of {}), completing",
                step.iteration, job.max_iterations
            ),
            (false, _) => format!("Finished '{finished}'"),
        });
        return Transition::Complete {
            from,
            output: output.payload,
            message,
        };
    }

    let next = pipeline.stage_name(step.cursor);
    let message = output.message.unwrap_or_else(|| {
        if is_review {
            format!(
                "Review requested changes, starting iteration {} of {}",
                step.iteration, job.max_iterations
            )
        } else {
            format!("Finished '{finished}', starting '{next}'")
        }
    });
    Transition::Advance {
        from,
        to: step.cursor,
        iteration: step.iteration,
        output: output.payload,
        message,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("executor panicked: {s}")
    } else {
        "executor panicked".to_string()
    }
}

/// Marks a job as running for as long as it is held.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<JobId>>,
    job_id: JobId,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<JobId>>, job_id: JobId) -> Option<Self> {
        if !running.lock().insert(job_id) {
            return None;
        }
        Some(Self { running, job_id })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
