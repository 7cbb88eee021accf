//! Keep-alive pings for idle progress streams.
//!
//! Long stages can go minutes without a progress event. Pinging every open
//! stream on a fixed interval keeps proxies from reaping them and lets dead
//! peers surface as send errors in the stream handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::ws::manager::WsManager;

/// Default interval between heartbeat pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the ping loop. It runs until `cancel` fires.
pub fn start_heartbeat(
    ws_manager: Arc<WsManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; nothing is idle yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let streams = ws_manager.connection_count().await;
            if streams == 0 {
                continue;
            }
            tracing::debug!(streams, "Pinging progress streams");
            ws_manager.ping_all().await;
        }
        tracing::info!("Heartbeat stopped");
    })
}
