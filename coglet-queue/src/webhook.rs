//! Response delivery for predictions.
//!
//! A [`WebhookDispatcher`] owns delivery for one prediction:
//! - at most one delivery in flight; while it runs, newer intermediate
//!   snapshots replace older undelivered ones
//! - intermediate deliveries are attempted once
//! - the terminal snapshot is sent after every earlier delivery finished,
//!   replaces anything still pending, and is retried with exponential backoff
//! - WEBHOOK_AUTH_TOKEN bearer authentication
//!
//! Where snapshots go is a [`ResponseSink`]: an HTTP webhook or a response key
//! on the job queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::prediction::PredictionResponse;
use crate::queue::{JobQueue, QueueError};
use crate::version::user_agent;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
    pub request_timeout: Duration,
    pub auth_token: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
            request_timeout: Duration::from_secs(30),
            auth_token: std::env::var("WEBHOOK_AUTH_TOKEN").ok(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write response: {0}")]
    Queue(#[from] QueueError),
}

impl DeliveryError {
    pub fn is_retryable(&self, retry_status_codes: &[u16]) -> bool {
        match self {
            Self::Request(_) | Self::Queue(_) => true,
            Self::Status(status) => retry_status_codes.contains(status),
            Self::Encode(_) => false,
        }
    }
}

/// Destination for prediction snapshots.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn deliver(&self, response: &PredictionResponse) -> Result<(), DeliveryError>;
}

/// HTTP client shared by every webhook delivery: auth and user agent headers,
/// request timeout.
pub fn webhook_client(config: &WebhookConfig) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(token) = &config.auth_token
        && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
    {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
        headers.insert(reqwest::header::USER_AGENT, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout)
        .build()
        .expect("Failed to create HTTP client")
}

/// POSTs snapshots as JSON to a callback URL.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    /// `client` is cheap to clone; build it once with [`webhook_client`].
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }
}

#[async_trait]
impl ResponseSink for WebhookSink {
    async fn deliver(&self, response: &PredictionResponse) -> Result<(), DeliveryError> {
        let resp = self.client.post(&self.url).json(response).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

/// Writes snapshots to a response key on the job queue.
pub struct QueueResponseSink {
    queue: Arc<dyn JobQueue>,
    key: String,
}

impl QueueResponseSink {
    pub fn new(queue: Arc<dyn JobQueue>, key: String) -> Self {
        Self { queue, key }
    }
}

#[async_trait]
impl ResponseSink for QueueResponseSink {
    async fn deliver(&self, response: &PredictionResponse) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(response)?;
        self.queue.write_response(&self.key, &payload).await?;
        Ok(())
    }
}

/// Used when a request names no destination; terminal results only reach the log.
pub struct LogOnlySink;

#[async_trait]
impl ResponseSink for LogOnlySink {
    async fn deliver(&self, response: &PredictionResponse) -> Result<(), DeliveryError> {
        if response.is_terminal() {
            tracing::info!(
                status = %response.status,
                error = response.error.as_deref().unwrap_or(""),
                "Prediction finished without a response destination"
            );
        }
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    latest: Option<PredictionResponse>,
    closed: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WebhookDispatcher {
    prediction_id: String,
    sink: Arc<dyn ResponseSink>,
    config: WebhookConfig,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl WebhookDispatcher {
    pub fn new(prediction_id: String, sink: Arc<dyn ResponseSink>, config: WebhookConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
        });
        let task = tokio::spawn(deliver_intermediate(
            prediction_id.clone(),
            sink.clone(),
            shared.clone(),
        ));

        Self {
            prediction_id,
            sink,
            config,
            shared,
            task,
        }
    }

    /// Queue an intermediate snapshot, replacing any undelivered one.
    pub fn send(&self, snapshot: PredictionResponse) {
        {
            let mut pending = self.shared.pending();
            if pending.closed {
                return;
            }
            pending.latest = Some(snapshot);
        }
        self.shared.notify.notify_one();
    }

    /// Deliver the terminal snapshot once the in-flight delivery finished.
    ///
    /// Returns the final delivery outcome; the queue entry is only acked on `Ok`.
    pub async fn finish(mut self, terminal: PredictionResponse) -> Result<(), DeliveryError> {
        {
            let mut pending = self.shared.pending();
            pending.latest = None;
            pending.closed = true;
        }
        self.shared.notify.notify_one();

        if let Err(e) = (&mut self.task).await {
            tracing::warn!(prediction_id = %self.prediction_id, error = %e, "Webhook task failed");
        }

        self.deliver_terminal(&terminal).await
    }

    async fn deliver_terminal(&self, terminal: &PredictionResponse) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            match self.sink.deliver(terminal).await {
                Ok(()) => {
                    tracing::debug!(
                        prediction_id = %self.prediction_id,
                        status = %terminal.status,
                        "Terminal response delivered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable(&self.config.retry_status_codes) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(
                            prediction_id = %self.prediction_id,
                            error = %e,
                            attempts = attempt,
                            "Terminal response failed after max retries"
                        );
                        return Err(e);
                    }

                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(
                        prediction_id = %self.prediction_id,
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal response failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        prediction_id = %self.prediction_id,
                        error = %e,
                        "Terminal response failed with non-retryable error"
                    );
                    return Err(e);
                }
            }
        }
    }
}

async fn deliver_intermediate(
    prediction_id: String,
    sink: Arc<dyn ResponseSink>,
    shared: Arc<Shared>,
) {
    loop {
        let next = {
            let mut pending = shared.pending();
            match pending.latest.take() {
                Some(snapshot) => Some(snapshot),
                None if pending.closed => return,
                None => None,
            }
        };

        match next {
            Some(snapshot) => {
                if let Err(e) = sink.deliver(&snapshot).await {
                    tracing::warn!(
                        prediction_id = %prediction_id,
                        error = %e,
                        "Failed to deliver intermediate response"
                    );
                }
            }
            None => shared.notify.notified().await,
        }
    }
}
