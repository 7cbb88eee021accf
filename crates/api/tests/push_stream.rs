//! End-to-end tests for the per-job progress WebSocket.
//!
//! These tests run a real server on an ephemeral port so that upgrades,
//! resume via `after`, and the client watcher are exercised over TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::{build_test_app_with, spawn_server, token};
use forge_client::{ForgeClient, JobWatcher, ReconnectConfig};
use forge_core::executor::{StageContext, StageError, StageExecutor, StageOutput};
use forge_core::job::{JobStatus, JobType, SubmitJob};
use forge_core::progress::{EventKind, ProgressEvent};
use forge_core::types::JobId;
use forge_pipeline::executors::PassthroughExecutor;
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Passthrough executor that blocks every stage until a permit is added.
struct GatedExecutor {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl StageExecutor for GatedExecutor {
    async fn execute(&self, context: StageContext) -> Result<StageOutput, StageError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| StageError::Failed(e.to_string()))?
            .forget();
        PassthroughExecutor.execute(context).await
    }
}

struct Harness {
    app: common::TestApp,
    addr: std::net::SocketAddr,
    gate: Arc<Semaphore>,
    client: ForgeClient,
    token: String,
}

async fn harness() -> Harness {
    let gate = Arc::new(Semaphore::new(0));
    let app = build_test_app_with(Arc::new(GatedExecutor {
        gate: Arc::clone(&gate),
    }));
    let addr = spawn_server(app.router()).await;
    let token = token("studio-7");
    let client = ForgeClient::new(format!("http://{addr}"), token.clone());
    Harness {
        app,
        addr,
        gate,
        client,
        token,
    }
}

fn scripts_job() -> SubmitJob {
    SubmitJob {
        job_type: JobType::Scripts,
        input_payload: json!({ "blueprint": "b-1" }),
        max_iterations: None,
        autonomous: None,
    }
}

async fn open(h: &Harness, job_id: JobId, after: Option<u64>) -> Socket {
    let mut url = format!("ws://{}/api/v1/jobs/{job_id}/ws?token={}", h.addr, h.token);
    if let Some(after) = after {
        url.push_str(&format!("&after={after}"));
    }
    let (socket, _) = connect_async(url).await.expect("upgrade should succeed");
    socket
}

/// Next non-control frame, decoded as a progress event.
async fn next_event(socket: &mut Socket) -> ProgressEvent {
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("event should arrive in time")
            .expect("stream should be open")
            .expect("frame should be valid");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a progress event, got {other:?}"),
        }
    }
}

/// Assert the server closes the stream without sending more events.
async fn expect_closed(socket: &mut Socket) {
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("close should arrive in time");
        match frame {
            None | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
            Some(Err(_)) => return,
        }
    }
}

async fn wait_for_status(h: &Harness, job_id: JobId, status: JobStatus) {
    for _ in 0..500 {
        if h.client.status(job_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {status}");
}

fn http_status(result: Result<(Socket, tungstenite::handshake::client::Response), tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    }
}

// ---------------------------------------------------------------------------
// Resume after disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_resumes_after_last_seen_sequence() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let mut socket = open(&h, job.job_id, Some(0)).await;
    let first = next_event(&mut socket).await;
    assert_eq!(first.sequence, 1);
    assert_eq!(first.kind, EventKind::Progress);
    assert_eq!(first.status, JobStatus::Processing);

    h.gate.add_permits(1);
    let second = next_event(&mut socket).await;
    assert_eq!(second.sequence, 2);
    assert_eq!(second.message, "Finished 'parse_blueprint', starting 'generate_scripts'");

    socket.close(None).await.ok();
    drop(socket);

    h.gate.add_permits(1);
    wait_for_status(&h, job.job_id, JobStatus::Completed).await;

    let mut socket = open(&h, job.job_id, Some(2)).await;
    let third = next_event(&mut socket).await;
    assert_eq!(third.sequence, 3);
    assert_eq!(third.kind, EventKind::Completed);
    expect_closed(&mut socket).await;
}

#[tokio::test]
async fn resuming_past_the_terminal_event_closes_immediately() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();
    h.gate.add_permits(2);
    wait_for_status(&h, job.job_id, JobStatus::Completed).await;

    let mut socket = open(&h, job.job_id, Some(3)).await;
    expect_closed(&mut socket).await;
}

#[tokio::test]
async fn late_subscriber_to_finished_job_gets_terminal_event_once() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();
    h.gate.add_permits(2);
    wait_for_status(&h, job.job_id, JobStatus::Completed).await;

    let mut socket = open(&h, job.job_id, None).await;
    let event = next_event(&mut socket).await;
    assert_eq!(event.kind, EventKind::Completed);
    assert_eq!(event.sequence, 3);
    expect_closed(&mut socket).await;
}

// ---------------------------------------------------------------------------
// Push and poll agree
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_is_never_behind_a_pushed_event() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let mut socket = open(&h, job.job_id, Some(0)).await;
    h.gate.add_permits(2);

    loop {
        let event = next_event(&mut socket).await;
        let snapshot = h.client.status(job.job_id).await.unwrap();
        assert!(snapshot.sequence >= event.sequence);

        if event.is_terminal() {
            assert_eq!(snapshot.status, JobStatus::Completed);
            assert_eq!(snapshot.result_payload, event.result_payload);
            assert!(snapshot.result_payload.is_some());
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Client watcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn watcher_returns_terminal_view() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let watcher = JobWatcher::new(h.client.clone()).with_reconnect(ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    });
    let job_id = job.job_id;
    let watch = tokio::spawn(async move {
        let mut seen = Vec::new();
        let view = watcher
            .watch_with(job_id, |view| seen.push(view.sequence))
            .await;
        (view, seen)
    });

    h.gate.add_permits(2);
    let (view, seen) = tokio::time::timeout(WAIT, watch)
        .await
        .expect("watch should finish")
        .unwrap();
    let view = view.unwrap();

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.sequence, 3);
    assert!(view.result_payload.is_some());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "updates must move forward: {seen:?}");
    assert_eq!(seen.last(), Some(&3));
}

/// Wait until the server holds exactly `count` open progress streams.
async fn wait_for_streams(h: &Harness, count: usize) {
    for _ in 0..500 {
        if h.app.state.ws_manager.connection_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never held {count} progress streams");
}

#[tokio::test]
async fn watcher_reconnects_after_server_closes_mid_job() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let watcher = JobWatcher::new(h.client.clone()).with_reconnect(ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    });
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let job_id = job.job_id;
    let watch = {
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            watcher
                .watch_with(job_id, |view| seen.lock().unwrap().push(view.sequence))
                .await
        })
    };

    // Let the first stage finish, then drop every stream while the second
    // stage is still held at the gate.
    wait_for_streams(&h, 1).await;
    h.gate.add_permits(1);
    for _ in 0..500 {
        if seen.lock().unwrap().last().copied().unwrap_or(0) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let before_close = *seen.lock().unwrap().last().unwrap();
    assert!(before_close >= 1, "watcher should see the first stage");
    h.app.state.ws_manager.shutdown_all().await;

    wait_for_streams(&h, 1).await;
    h.gate.add_permits(1);

    let view = tokio::time::timeout(WAIT, watch)
        .await
        .expect("watch should finish")
        .unwrap()
        .unwrap();
    let seen = seen.lock().unwrap().clone();

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.sequence, 3);
    assert!(seen.contains(&before_close));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "updates must move forward: {seen:?}");
    assert_eq!(seen.last(), Some(&3));
}

#[tokio::test]
async fn cancelling_during_backoff_stops_the_watcher() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let cancel = CancellationToken::new();
    let watcher = JobWatcher::new(h.client.clone())
        .with_reconnect(ReconnectConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        })
        .with_cancellation(cancel.clone());
    let job_id = job.job_id;
    let watch = tokio::spawn(async move { watcher.watch(job_id).await });

    wait_for_streams(&h, 1).await;
    h.app.state.ws_manager.shutdown_all().await;
    // The watcher is now sleeping before its next attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.app.state.ws_manager.connection_count().await, 0);
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), watch)
        .await
        .expect("cancel should end the backoff")
        .unwrap();
    assert_matches!(result, Err(forge_client::ClientError::Cancelled));
}

#[tokio::test]
async fn watcher_reports_failed_jobs() {
    struct Failing;

    #[async_trait]
    impl StageExecutor for Failing {
        async fn execute(&self, _: StageContext) -> Result<StageOutput, StageError> {
            Err(StageError::Failed("blueprint is malformed".into()))
        }
    }

    let app = build_test_app_with(Arc::new(Failing));
    let addr = spawn_server(app.router()).await;
    let client = ForgeClient::new(format!("http://{addr}"), token("studio-7"));
    let job = client.submit(&scripts_job()).await.unwrap();

    let view = tokio::time::timeout(WAIT, JobWatcher::new(client).watch(job.job_id))
        .await
        .expect("watch should finish")
        .unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.error.as_deref(), Some("blueprint is malformed"));
}

#[tokio::test]
async fn watcher_surfaces_unknown_job() {
    let h = harness().await;
    let result = JobWatcher::new(h.client.clone())
        .watch(uuid::Uuid::now_v7())
        .await;

    assert_matches!(result, Err(forge_client::ClientError::Api { status: 404, .. }));
}

// ---------------------------------------------------------------------------
// Access gate and lookup on upgrade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_without_token_is_unauthorized() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let url = format!("ws://{}/api/v1/jobs/{}/ws", h.addr, job.job_id);
    assert_eq!(http_status(connect_async(url).await), 401);
}

#[tokio::test]
async fn upgrade_with_bad_token_is_unauthorized() {
    let h = harness().await;
    let job = h.client.submit(&scripts_job()).await.unwrap();

    let url = format!("ws://{}/api/v1/jobs/{}/ws?token=forged", h.addr, job.job_id);
    assert_eq!(http_status(connect_async(url).await), 401);
}

#[tokio::test]
async fn upgrade_for_unknown_job_is_not_found() {
    let h = harness().await;

    let url = format!(
        "ws://{}/api/v1/jobs/{}/ws?token={}",
        h.addr,
        uuid::Uuid::now_v7(),
        h.token
    );
    assert_eq!(http_status(connect_async(url).await), 404);
}
