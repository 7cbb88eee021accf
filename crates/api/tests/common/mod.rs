#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use forge_api::auth::jwt::{generate_access_token, JwtConfig};
use forge_api::config::ServerConfig;
use forge_api::router::build_app_router;
use forge_api::state::AppState;
use forge_core::executor::StageExecutor;
use forge_pipeline::executors::PassthroughExecutor;
use forge_pipeline::WorkerPool;

pub const TEST_SECRET: &str = "integration-test-secret-that-is-long-enough";

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default)
/// and a 30-second request timeout.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        jwt: JwtConfig {
            secret: TEST_SECRET.to_string(),
            access_token_expiry_mins: 15,
        },
        max_iterations: 3,
        stage_timeout_secs: 10,
        worker_pool_size: 2,
        event_history_capacity: 64,
        stage_command: None,
        stage_workdir: None,
    }
}

/// A running application: router, shared state, and the worker pool
/// draining its queue. Dropping it stops the workers.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub workers: WorkerPool,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Build the full application with the passthrough executor.
pub fn build_test_app() -> TestApp {
    build_test_app_with(Arc::new(PassthroughExecutor))
}

/// Build the full application around `executor`.
///
/// This mirrors the wiring in `main.rs` so integration tests exercise the
/// same middleware stack, scheduler, and worker pool that production uses.
pub fn build_test_app_with(executor: Arc<dyn StageExecutor>) -> TestApp {
    let config = test_config();
    let (state, queue) = AppState::new(config.clone(), executor);
    let workers = WorkerPool::start(
        Arc::clone(&state.scheduler),
        queue,
        config.worker_pool_size,
        CancellationToken::new(),
    );
    let router = build_app_router(state.clone(), &config);
    TestApp {
        router,
        state,
        workers,
    }
}

/// Serve `router` on an ephemeral localhost port for WebSocket tests.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

/// Access token for `subject` signed with the test secret.
pub fn token(subject: &str) -> String {
    generate_access_token(subject, &test_config().jwt).expect("token generation should succeed")
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json_auth(
    app: Router,
    uri: &str,
    body: serde_json::Value,
    token: &str,
) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
