//! HTTP and WebSocket access to the job service.
//!
//! [`ForgeClient`] submits jobs and reads status snapshots over the REST
//! API, and opens the per-job progress stream. Every call carries the
//! caller's access token.

use forge_core::job::{JobStatusView, SubmitJob};
use forge_core::types::{JobId, Sequence};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// A live progress stream for one job.
pub type ProgressStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Errors from the client layer.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP request itself failed (network, DNS, etc.).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Opening or reading the progress stream failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The service answered with a non-2xx status.
    #[error("API error ({status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// A pushed frame was not a progress event.
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// The watch was cancelled before the job finished.
    #[error("Cancelled")]
    Cancelled,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// Client for one job service instance.
#[derive(Clone)]
pub struct ForgeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ForgeClient {
    /// * `base_url` - HTTP origin, e.g. `http://host:3000`.
    /// * `token`    - bearer access token for the caller.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /api/v1/jobs`
    pub async fn submit(&self, input: &SubmitJob) -> Result<JobStatusView, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/jobs", self.base_url))
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        Self::parse_data(response).await
    }

    /// `GET /api/v1/jobs/{id}`
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/jobs/{}", self.base_url, job_id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::parse_data(response).await
    }

    /// WebSocket URL of a job's progress stream.
    ///
    /// Browsers cannot set headers on a WebSocket handshake, so the token
    /// travels as a query parameter.
    pub fn stream_url(&self, job_id: JobId, after: Option<Sequence>) -> String {
        let ws_base = match self.base_url.strip_prefix("http") {
            Some(rest) => format!("ws{rest}"),
            None => self.base_url.clone(),
        };
        let mut url = format!("{ws_base}/api/v1/jobs/{job_id}/ws?token={}", self.token);
        if let Some(after) = after {
            url.push_str(&format!("&after={after}"));
        }
        url
    }

    /// Open the progress stream, replaying retained events after `after`.
    pub async fn connect(
        &self,
        job_id: JobId,
        after: Option<Sequence>,
    ) -> Result<ProgressStream, ClientError> {
        let (stream, _response) = connect_async(self.stream_url(job_id, after)).await?;
        tracing::debug!(%job_id, after, "Connected to progress stream");
        Ok(stream)
    }

    // ---- private helpers ----

    async fn parse_data<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => (body.code, body.error),
                Err(_) => (String::new(), text),
            };
            return Err(ClientError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }
        let envelope: DataEnvelope<T> = response.json().await?;
        Ok(envelope.data)
    }
}
