//! Client side of the job service.
//!
//! [`ForgeClient`] wraps the HTTP API. [`JobWatcher`] follows one job over
//! the progress WebSocket, reconnecting with backoff and catching up from
//! status snapshots, and folds everything it sees into a [`JobView`].

pub mod client;
pub mod reconcile;
pub mod reconnect;
pub mod watcher;

pub use client::{ClientError, ForgeClient};
pub use reconcile::{Applied, JobView};
pub use reconnect::ReconnectConfig;
pub use watcher::JobWatcher;
