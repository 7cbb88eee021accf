use std::sync::Arc;

use forge_core::executor::StageExecutor;
use forge_events::ProgressPublisher;
use forge_pipeline::{InMemoryJobStore, JobQueue, JobStore, Scheduler, StatusService};

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (access gate secret, limits).
    pub config: Arc<ServerConfig>,
    /// Creates jobs and drives them through their pipelines.
    pub scheduler: Arc<Scheduler>,
    /// Read-only job snapshots for polling clients.
    pub status: StatusService,
    /// Per-job progress feeds for push clients.
    pub publisher: ProgressPublisher,
    /// WebSocket connection manager (push clients).
    pub ws_manager: Arc<WsManager>,
}

impl AppState {
    /// Wire the store, publisher, and scheduler for one process lifetime.
    ///
    /// Returns the scheduler's run queue for the worker pool to consume.
    pub fn new(config: ServerConfig, executor: Arc<dyn StageExecutor>) -> (Self, JobQueue) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let publisher = ProgressPublisher::new(config.event_history_capacity);
        let (scheduler, queue) = Scheduler::new(
            Arc::clone(&store),
            publisher.clone(),
            executor,
            config.scheduler_config(),
        );

        let state = Self {
            config: Arc::new(config),
            scheduler: Arc::new(scheduler),
            status: StatusService::new(store),
            publisher,
            ws_manager: Arc::new(WsManager::new()),
        };
        (state, queue)
    }
}
