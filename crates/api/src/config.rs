use std::sync::Arc;
use std::time::Duration;

use forge_core::executor::StageExecutor;
use forge_core::pipeline::DEFAULT_MAX_ITERATIONS;
use forge_events::DEFAULT_HISTORY_CAPACITY;
use forge_pipeline::executors::{CommandExecutor, PassthroughExecutor};
use forge_pipeline::worker_pool::DEFAULT_POOL_SIZE;
use forge_pipeline::SchedulerConfig;

use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
///
/// All fields except the JWT secret have defaults suitable for local
/// development. In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight job runs (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// JWT token configuration.
    pub jwt: JwtConfig,
    /// Default refinement-loop bound (default: `3`).
    pub max_iterations: i64,
    /// Per-stage executor timeout in seconds (default: `300`).
    pub stage_timeout_secs: u64,
    /// Concurrent job runs (default: `4`).
    pub worker_pool_size: usize,
    /// Progress events retained per job for resume (default: `256`).
    pub event_history_capacity: usize,
    /// Command line run for every stage. Unset means the passthrough executor.
    pub stage_command: Option<String>,
    /// Working directory for the stage command. Unset inherits the server's.
    pub stage_workdir: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                    |
    /// |--------------------------|----------------------------|
    /// | `HOST`                   | `0.0.0.0`                  |
    /// | `PORT`                   | `3000`                     |
    /// | `CORS_ORIGINS`           | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`   | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `30`                       |
    /// | `MAX_ITERATIONS`         | `3`                        |
    /// | `STAGE_TIMEOUT_SECS`     | `300`                      |
    /// | `WORKER_POOL_SIZE`       | `4`                        |
    /// | `EVENT_HISTORY_CAPACITY` | `256`                      |
    /// | `STAGE_COMMAND`          | unset                      |
    /// | `STAGE_WORKDIR`          | unset                      |
    ///
    /// See [`JwtConfig::from_env`] for the access gate settings.
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let max_iterations: i64 = std::env::var("MAX_ITERATIONS")
            .unwrap_or_else(|_| DEFAULT_MAX_ITERATIONS.to_string())
            .parse()
            .expect("MAX_ITERATIONS must be a valid i64");

        let stage_timeout_secs: u64 = std::env::var("STAGE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()
            .expect("STAGE_TIMEOUT_SECS must be a valid u64");

        let worker_pool_size: usize = std::env::var("WORKER_POOL_SIZE")
            .unwrap_or_else(|_| DEFAULT_POOL_SIZE.to_string())
            .parse()
            .expect("WORKER_POOL_SIZE must be a valid usize");

        let event_history_capacity: usize = std::env::var("EVENT_HISTORY_CAPACITY")
            .unwrap_or_else(|_| DEFAULT_HISTORY_CAPACITY.to_string())
            .parse()
            .expect("EVENT_HISTORY_CAPACITY must be a valid usize");

        let stage_command = std::env::var("STAGE_COMMAND")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let stage_workdir = std::env::var("STAGE_WORKDIR")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let jwt = JwtConfig::from_env();

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            jwt,
            max_iterations,
            stage_timeout_secs,
            worker_pool_size,
            event_history_capacity,
            stage_command,
            stage_workdir,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_max_iterations: self.max_iterations,
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
        }
    }

    /// Executor selected by `STAGE_COMMAND`.
    pub fn stage_executor(&self) -> Arc<dyn StageExecutor> {
        match self
            .stage_command
            .as_deref()
            .and_then(CommandExecutor::from_command_line)
        {
            Some(executor) => {
                let executor = match &self.stage_workdir {
                    Some(dir) => executor.with_working_directory(dir),
                    None => executor,
                };
                tracing::info!(
                    program = executor.program(),
                    workdir = self.stage_workdir.as_deref(),
                    "Stages run via external command",
                );
                Arc::new(executor)
            }
            None => {
                tracing::info!("No STAGE_COMMAND set, using passthrough executor");
                Arc::new(PassthroughExecutor)
            }
        }
    }
}
