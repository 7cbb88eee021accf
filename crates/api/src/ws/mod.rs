//! WebSocket push of job progress.
//!
//! Provides connection management, heartbeat pings, and the upgrade
//! handler that bridges a job's progress feed onto a socket.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::job_stream;
pub use heartbeat::{start_heartbeat, HEARTBEAT_INTERVAL};
pub use manager::WsManager;
