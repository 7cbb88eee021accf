//! Fixed-size pool of tasks that pull job ids off the scheduler queue and
//! run them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::{JobQueue, RunOutcome, Scheduler};

/// Default number of concurrent job runs.
pub const DEFAULT_POOL_SIZE: usize = 4;

pub struct WorkerPool {
    size: usize,
    cancellation_token: CancellationToken,
    active_runs: Arc<AtomicUsize>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) sharing `queue`.
    ///
    /// Cancelling `cancellation_token` stops workers from taking new jobs;
    /// runs already in progress continue until [`stop`](Self::stop) gives up
    /// on them.
    pub fn start(
        scheduler: Arc<Scheduler>,
        queue: JobQueue,
        size: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        let active_runs = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();

        for worker in 0..size {
            let scheduler = Arc::clone(&scheduler);
            let queue = Arc::clone(&queue);
            let cancel = cancellation_token.clone();
            let active_runs = Arc::clone(&active_runs);

            join_set.spawn(async move {
                debug!(worker, "Worker started");
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        job_id = async { queue.lock().await.recv().await } => job_id,
                    };
                    let Some(job_id) = next else {
                        break;
                    };

                    active_runs.fetch_add(1, Ordering::SeqCst);
                    match scheduler.run(job_id).await {
                        Ok(RunOutcome::AlreadyRunning | RunOutcome::AlreadyTerminal) => {
                            debug!(worker, %job_id, "Nothing to run");
                        }
                        Ok(outcome) => debug!(worker, %job_id, ?outcome, "Run finished"),
                        Err(e) => error!(worker, %job_id, error = %e, "Run aborted"),
                    }
                    active_runs.fetch_sub(1, Ordering::SeqCst);
                }
                debug!(worker, "Worker stopped");
            });
        }

        info!(size, "Worker pool started");

        Self {
            size,
            cancellation_token,
            active_runs,
            tasks: parking_lot::Mutex::new(Some(join_set)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently being driven by a worker.
    pub fn active_count(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Stop taking jobs and wait up to `timeout` for in-flight runs.
    ///
    /// Runs still going after the timeout are aborted; their jobs stay in
    /// `processing`.
    pub async fn stop(&self, timeout: Duration) {
        info!(active = self.active_count(), "Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return;
        };

        let drain = async {
            while join_set.join_next().await.is_some() {}
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                active = self.active_count(),
                timeout_secs = timeout.as_secs(),
                "Worker pool did not drain in time, aborting runs",
            );
            join_set.abort_all();
        }

        info!("Worker pool stopped");
    }
}
