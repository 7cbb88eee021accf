use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use forge_core::progress::ProgressEvent;
use forge_core::types::{JobId, Sequence};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::auth::Caller;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Resume point: replay retained events with a larger sequence first.
    pub after: Option<Sequence>,
}

/// GET /api/v1/jobs/{id}/ws
///
/// Upgrade to a WebSocket carrying the job's progress events as JSON text
/// frames. The server closes the socket after the terminal event. Unknown
/// jobs are rejected with 404 before the upgrade.
pub async fn job_stream(
    ws: WebSocketUpgrade,
    caller: Caller,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Query(params): Query<StreamParams>,
) -> AppResult<impl IntoResponse> {
    state.status.get(job_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, job_id, params.after, caller)))
}

/// Manage a single progress stream after upgrade.
///
/// Splits the socket, then:
///   1. Registers the connection with `WsManager` (pings, shutdown).
///   2. Subscribes to the job's feed, replaying past `after` if given.
///   3. Spawns a sender task that forwards events and control frames.
///   4. Reads inbound frames until the client goes away.
///   5. Cleans up when either side finishes.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    job_id: JobId,
    after: Option<Sequence>,
    caller: Caller,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        conn_id = %conn_id,
        %job_id,
        caller = %caller.id,
        after,
        "Progress stream connected",
    );

    let mut control = state
        .ws_manager
        .add(conn_id.clone(), caller.id.clone(), job_id)
        .await;
    let job_streams = state.ws_manager.job_connection_count(job_id).await;
    tracing::debug!(
        %job_id,
        job_streams,
        "Open progress streams for job",
    );
    let mut subscription = state.publisher.subscribe(job_id, after);
    if subscription.replay_truncated() {
        tracing::debug!(
            conn_id = %conn_id,
            %job_id,
            after,
            "Retained history does not reach the resume point",
        );
    }

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward progress events and control frames to the sink.
    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = subscription.recv() => {
                    // Feed closed: the job finished and nothing newer than
                    // the resume point is left to send.
                    let Some(event) = event else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let terminal = event.is_terminal();
                    if send_event(&mut sink, &event).await.is_err() {
                        tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                        break;
                    }
                    if terminal {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
                frame = control.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let closing = matches!(frame, Message::Close(_));
                    if sink.send(frame).await.is_err() || closing {
                        break;
                    }
                }
            }
        }
        subscription.last_sequence_seen()
    });

    // Receiver task: drain inbound frames until the client closes.
    let receiver_conn_id = conn_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) => {
                    tracing::trace!(conn_id = %receiver_conn_id, "Pong received");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(conn_id = %receiver_conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    let last_sent = tokio::select! {
        result = &mut send_task => {
            recv_task.abort();
            result.ok().flatten()
        }
        _ = &mut recv_task => {
            send_task.abort();
            None
        }
    };

    state.ws_manager.remove(&conn_id).await;
    tracing::info!(conn_id = %conn_id, %job_id, last_sent, "Progress stream disconnected");
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ProgressEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(job_id = %event.job_id, sequence = event.sequence, error = %e, "Failed to encode progress event");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}
