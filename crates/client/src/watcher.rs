//! Follow one job to completion over the progress stream.
//!
//! The watcher starts from a status snapshot, then subscribes with
//! `after` set to the sequence it already holds so the server replays
//! anything it missed. After every (re)connect it fetches one more
//! snapshot to cover events that fell out of the server's retained
//! history, and it fetches another whenever the pushed sequence jumps.
//! Dropped connections are retried with exponential backoff until the job
//! reaches a terminal state or the watch is cancelled.

use forge_core::progress::ProgressEvent;
use forge_core::types::JobId;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, ForgeClient, ProgressStream};
use crate::reconcile::{Applied, JobView};
use crate::reconnect::{next_delay, ReconnectConfig};

/// How a single connection ended.
enum StreamEnd {
    Terminal,
    Disconnected,
}

pub struct JobWatcher {
    client: ForgeClient,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
}

impl JobWatcher {
    pub fn new(client: ForgeClient) -> Self {
        Self {
            client,
            reconnect: ReconnectConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for `job_id` to finish and return its final view.
    pub async fn watch(&self, job_id: JobId) -> Result<JobView, ClientError> {
        self.watch_with(job_id, |_| {}).await
    }

    /// Like [`watch`](Self::watch), calling `on_update` every time the view
    /// moves forward.
    ///
    /// Errors fetching the initial snapshot are returned as-is (unknown job,
    /// rejected token). Later stream failures are retried.
    pub async fn watch_with<F>(&self, job_id: JobId, mut on_update: F) -> Result<JobView, ClientError>
    where
        F: FnMut(&JobView),
    {
        let mut view = JobView::from_snapshot(&self.client.status(job_id).await?);
        on_update(&view);

        let mut delay = self.reconnect.initial_delay;
        let mut attempt = 0u32;

        while !view.is_terminal() {
            match self.follow(&mut view, &mut on_update).await {
                Ok(StreamEnd::Terminal) => break,
                Ok(StreamEnd::Disconnected) => {
                    tracing::debug!(%job_id, sequence = view.sequence, "Progress stream closed");
                    delay = self.reconnect.initial_delay;
                    attempt = 0;
                }
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        %job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Progress stream failed, reconnecting",
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            if attempt > 0 {
                delay = next_delay(delay, &self.reconnect);
            }
        }

        tracing::info!(%job_id, status = %view.status, sequence = view.sequence, "Job finished");
        Ok(view)
    }

    /// Run one connection: subscribe, catch up, then apply pushed events.
    async fn follow<F>(&self, view: &mut JobView, on_update: &mut F) -> Result<StreamEnd, ClientError>
    where
        F: FnMut(&JobView),
    {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            stream = self.client.connect(view.job_id, Some(view.sequence)) => stream?,
        };

        self.catch_up(view, on_update).await?;
        if view.is_terminal() {
            close(&mut stream).await;
            return Ok(StreamEnd::Terminal);
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    close(&mut stream).await;
                    return Err(ClientError::Cancelled);
                }
                frame = stream.next() => frame,
            };

            match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(StreamEnd::Disconnected),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    let event: ProgressEvent = serde_json::from_str(&text)?;
                    match view.apply_event(&event) {
                        Applied::Updated => on_update(view),
                        Applied::Gap { expected, received } => {
                            tracing::debug!(
                                job_id = %view.job_id,
                                expected,
                                received,
                                "Sequence gap, fetching snapshot",
                            );
                            on_update(view);
                            self.catch_up(view, on_update).await?;
                        }
                        Applied::Stale | Applied::ForeignJob => {
                            tracing::trace!(
                                job_id = %view.job_id,
                                sequence = event.sequence,
                                "Ignoring stale event",
                            );
                        }
                    }
                    if view.is_terminal() {
                        close(&mut stream).await;
                        return Ok(StreamEnd::Terminal);
                    }
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn catch_up<F>(&self, view: &mut JobView, on_update: &mut F) -> Result<(), ClientError>
    where
        F: FnMut(&JobView),
    {
        let snapshot = self.client.status(view.job_id).await?;
        if view.apply_snapshot(&snapshot) {
            on_update(view);
        }
        Ok(())
    }
}

async fn close(stream: &mut ProgressStream) {
    let _ = stream.close(None).await;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn unreachable_service_fails_fast() {
        // Port 1 is never served in the test environment.
        let watcher = JobWatcher::new(ForgeClient::new("http://127.0.0.1:1", "tok"));
        let result = watcher.watch(JobId::nil()).await;
        assert_matches!(result, Err(ClientError::Http(_)));
    }
}
