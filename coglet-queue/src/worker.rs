//! Worker subprocess - the child side of the runner protocol.
//!
//! A model binary implements [`PredictHandler`] and hands it to
//! [`run_worker`], which:
//! - connects to the socket named in the environment
//! - runs setup and reports `setup_complete` / `setup_failed`
//! - executes one prediction at a time, streaming outputs and logs
//! - writes a drain marker to stdout and stderr before every terminal message
//!
//! Anything the model prints goes to the process's stdout/stderr and is
//! captured by the runner as prediction logs.

use std::io::{self, Write};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    LogSource, SETUP_DRAIN_ID, WorkerMessage, WorkerRequest, drain_marker,
};
use crate::bridge::transport::{ChildTransportInfo, connect};
use crate::worker_tracing_layer::WorkerTracingLayer;

/// Setup phase errors. The worker reports them and exits.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Model weights or other resources could not be loaded.
    #[error("failed to load model: {message}")]
    Load { message: String },

    #[error("setup failed: {message}")]
    Setup { message: String },
}

impl SetupError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }
}

/// A prediction that raised.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictError {
    pub message: String,
    pub traceback: Option<String>,
}

impl PredictError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl std::fmt::Display for PredictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PredictError {}

/// Handle given to a running prediction.
#[derive(Clone)]
pub struct PredictContext {
    id: String,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    token: CancellationToken,
}

impl PredictContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream one output element. Marks the prediction's output as a list.
    pub fn yield_output(&self, output: serde_json::Value) -> io::Result<()> {
        self.send(WorkerMessage::OutputValue {
            id: self.id.clone(),
            output,
        })
    }

    /// Send a log line through the socket instead of stdout.
    pub fn log(&self, line: &str) -> io::Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        self.send(WorkerMessage::Log {
            source: LogSource::Stdout,
            data: line.to_string(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the runner asked for cancellation.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn send(&self, message: WorkerMessage) -> io::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker socket closed"))
    }
}

/// The model. Implemented by worker binaries.
#[async_trait::async_trait]
pub trait PredictHandler: Send + Sync + 'static {
    /// Load the model. Output printed here becomes setup logs.
    async fn setup(&self) -> Result<(), SetupError>;

    /// Run a prediction. Returning `Ok(None)` after streaming with
    /// [`PredictContext::yield_output`] leaves the streamed list as the output.
    ///
    /// The future is dropped when the prediction is cancelled.
    async fn predict(
        &self,
        input: serde_json::Value,
        ctx: PredictContext,
    ) -> Result<Option<serde_json::Value>, PredictError>;

    /// OpenAPI schema of the model's input and output.
    fn schema(&self) -> Option<serde_json::Value> {
        None
    }
}

pub struct WorkerConfig {
    /// Where to connect. Read from the environment when unset.
    pub transport: Option<ChildTransportInfo>,
    /// Install a subscriber that ships tracing events to the runner.
    pub install_tracing: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transport: None,
            install_tracing: true,
        }
    }
}

/// Run the worker event loop until shutdown or until the runner goes away.
pub async fn run_worker<H: PredictHandler>(
    handler: Arc<H>,
    config: WorkerConfig,
) -> io::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();

    if config.install_tracing {
        install_tracing(tx.clone());
    }

    let info = match config.transport {
        Some(info) => info,
        None => ChildTransportInfo::from_env()?,
    };
    tracing::trace!(?info, "Connecting to runner");
    let stream = connect(&info).await?;
    let (read_half, write_half) = stream.into_split();
    let mut requests = FramedRead::new(read_half, JsonCodec::<WorkerRequest>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<WorkerMessage>::new());

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let last = matches!(message, WorkerMessage::SetupFailed { .. });
            if writer.send(message).await.is_err() || last {
                break;
            }
        }
    });

    tracing::info!("Worker starting setup");
    let setup = handler.setup().await;
    write_drain_markers(SETUP_DRAIN_ID);
    if let Err(e) = setup {
        tracing::error!(error = %e, "Setup failed");
        let _ = tx.send(WorkerMessage::SetupFailed {
            error: e.to_string(),
        });
        let _ = writer_task.await;
        return Ok(());
    }
    let _ = tx.send(WorkerMessage::SetupComplete {
        schema: handler.schema(),
    });

    // Terminal messages come back through here so the worker is idle again
    // before the runner can see them.
    let (done_tx, mut done_rx) = mpsc::channel::<WorkerMessage>(1);
    let mut running: Option<(String, CancellationToken)> = None;

    loop {
        tokio::select! {
            biased;

            Some(terminal) = done_rx.recv() => {
                if running.as_ref().map(|(id, _)| id.as_str()) == terminal.terminal_id() {
                    running = None;
                }
                let _ = tx.send(terminal);
            }

            request = requests.next() => {
                match request {
                    Some(Ok(WorkerRequest::Predict { id, input })) => {
                        if let Some((busy, _)) = &running {
                            tracing::warn!(prediction_id = %id, busy = %busy, "Worker busy, ignoring request");
                            continue;
                        }
                        let token = CancellationToken::new();
                        running = Some((id.clone(), token.clone()));

                        let ctx = PredictContext { id: id.clone(), tx: tx.clone(), token };
                        let handler = Arc::clone(&handler);
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let terminal = run_prediction(handler, input, ctx).await;
                            let _ = done_tx.send(terminal).await;
                        });
                    }
                    Some(Ok(WorkerRequest::Cancel { id })) => {
                        match &running {
                            Some((current, token)) if *current == id => {
                                tracing::debug!(prediction_id = %id, "Cancel requested");
                                token.cancel();
                            }
                            _ => tracing::debug!(prediction_id = %id, "Cancel for idle prediction, ignoring"),
                        }
                    }
                    Some(Ok(WorkerRequest::Shutdown)) => {
                        tracing::info!("Shutdown requested");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Socket read error");
                        break;
                    }
                    None => {
                        tracing::debug!("Runner closed the socket, exiting");
                        break;
                    }
                }
            }
        }
    }

    if let Some((_, token)) = running.take() {
        token.cancel();
    }
    drop(tx);
    writer_task.abort();
    Ok(())
}

async fn run_prediction<H: PredictHandler>(
    handler: Arc<H>,
    input: serde_json::Value,
    ctx: PredictContext,
) -> WorkerMessage {
    let id = ctx.id.clone();
    let token = ctx.token.clone();
    let tx = ctx.tx.clone();
    let _ = tx.send(WorkerMessage::PredictionStarted { id: id.clone() });

    let terminal = tokio::select! {
        _ = token.cancelled() => WorkerMessage::CancelAck { id: id.clone() },
        result = handler.predict(input, ctx) => match result {
            Ok(output) => WorkerMessage::OutputDone { id: id.clone(), output },
            Err(e) => WorkerMessage::PredictionError {
                id: id.clone(),
                error: e.message,
                traceback: e.traceback,
            },
        },
    };

    write_drain_markers(&id);
    terminal
}

/// Every line printed before this point is ordered ahead of the marker.
fn write_drain_markers(id: &str) {
    let marker = drain_marker(id);
    {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{marker}");
        let _ = out.flush();
    }
    let mut err = io::stderr().lock();
    let _ = writeln!(err, "{marker}");
    let _ = err.flush();
}

fn install_tracing(tx: mpsc::UnboundedSender<WorkerMessage>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(crate::logging::env_filter())
        .with(WorkerTracingLayer::new(tx))
        .try_init();
}
