//! Queue consumer - claims one entry at a time and runs it to completion.
//!
//! Nothing is claimed before the worker finished setup, and the next entry is
//! claimed only after the previous one's terminal response was delivered. An
//! entry is acknowledged only once that delivery succeeded; otherwise it stays
//! pending and is handed out again after a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::execution::Executor;
use crate::health::SetupStatus;
use crate::input_validation::InputValidator;
use crate::queue::{JobQueue, QueueEntry, QueueError};
use crate::runner::{Runner, RunnerError};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    runner: Runner,
    executor: Executor,
    validator: Option<InputValidator>,
    block: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn JobQueue>, runner: Runner, executor: Executor) -> Self {
        Self {
            queue,
            runner,
            executor,
            validator: None,
            block: Duration::from_secs(1),
        }
    }

    /// How long one claim waits for a new entry.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Run until `shutdown` fires or a fatal error occurs. The worker process
    /// is shut down either way.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let result = self.consume(&shutdown).await;
        self.runner.shutdown().await;
        tracing::info!("Queue worker stopped");
        result
    }

    async fn consume(&mut self, shutdown: &CancellationToken) -> Result<(), ConsumerError> {
        let started = self.runner.start().await;
        self.after_setup();
        started?;

        while !shutdown.is_cancelled() {
            // A worker that died while idle is replaced before anything is claimed.
            match self.runner.ensure_ready().await {
                Ok(false) => {}
                Ok(true) => self.after_setup(),
                Err(e) if e.is_fatal() => {
                    self.after_setup();
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Worker not ready, waiting");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.block) => continue,
                    }
                }
            }

            let claimed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                claimed = self.queue.claim(self.block) => claimed?,
            };
            let Some(message) = claimed else {
                continue;
            };

            let entry = match QueueEntry::parse(&message.payload) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(message_id = %message.message_id, error = %e, "Dropping malformed queue entry");
                    self.queue.ack(&message.message_id).await?;
                    continue;
                }
            };
            tracing::debug!(message_id = %message.message_id, prediction_id = %entry.id, "Claimed queue entry");

            let outcome = self
                .executor
                .execute(&mut self.runner, self.validator.as_ref(), entry, shutdown)
                .await;

            match outcome.delivery {
                Ok(()) => self.queue.ack(&message.message_id).await?,
                Err(_) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        "Leaving entry pending after failed delivery"
                    );
                }
            }
        }

        Ok(())
    }

    /// Report the setup that just finished and pick up the worker's schema.
    fn after_setup(&mut self) {
        if let Some(setup) = self.runner.setup_result() {
            match setup.status {
                SetupStatus::Succeeded => tracing::info!(
                    started_at = %setup.started_at,
                    completed_at = setup.completed_at.as_deref().unwrap_or(""),
                    log_lines = setup.logs.lines().count(),
                    "Worker setup succeeded"
                ),
                SetupStatus::Failed => tracing::error!(
                    started_at = %setup.started_at,
                    logs = %setup.logs.trim_end(),
                    "Worker setup failed"
                ),
                SetupStatus::Starting => {}
            }
        }

        self.validator = self
            .runner
            .schema()
            .and_then(InputValidator::from_openapi_schema);
        if self.validator.is_none() {
            tracing::debug!("No input schema, inputs are passed through unvalidated");
        }
    }
}
