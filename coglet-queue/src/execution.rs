//! Drives one queue entry from validation to its terminal response.
//!
//! The runner's event stream races the prediction deadline and the consumer's
//! shutdown token. Every state change produces a snapshot for the dispatcher;
//! the terminal snapshot is delivered after all intermediate ones.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::input_validation::{InputValidator, format_errors};
use crate::output::OutputSerializer;
use crate::health::RunnerState;
use crate::prediction::{Prediction, PredictionResponse, StateError};
use crate::queue::{JobQueue, QueueEntry, ResponseTarget};
use crate::runner::{CRASH_ERROR, Runner, RunnerEvent};
use crate::timeout::{PredictionDeadline, TIMEOUT_ERROR};
use crate::webhook::{
    DeliveryError, LogOnlySink, QueueResponseSink, ResponseSink, WebhookConfig, WebhookDispatcher,
    WebhookSink, webhook_client,
};

/// How long a finished prediction waits for its log lines to reach the log stream.
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What happened to one entry.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub response: PredictionResponse,
    /// Outcome of the terminal delivery. The entry is acked only on `Ok`.
    pub delivery: Result<(), DeliveryError>,
}

enum Step {
    Event(Option<RunnerEvent>),
    TimedOut,
    Cancelled,
}

/// How the event loop ended.
enum Ending {
    /// The worker still runs the prediction and must be cancelled.
    CancelWorker,
    Settled,
}

/// Publishes one prediction's log lines in order without blocking the event loop.
struct LogPublisher {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl LogPublisher {
    fn spawn(queue: Arc<dyn JobQueue>, prediction_id: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = queue.publish_log(&prediction_id, &line).await {
                    tracing::warn!(prediction_id = %prediction_id, error = %e, "Failed to publish log line");
                }
            }
        });
        Self { tx, task }
    }

    fn publish(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    async fn flush(self) {
        let Self { tx, mut task } = self;
        drop(tx);
        if tokio::time::timeout(LOG_FLUSH_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("Log stream is lagging, dropping unpublished lines");
            task.abort();
        }
    }
}

pub struct Executor {
    queue: Arc<dyn JobQueue>,
    serializer: OutputSerializer,
    webhook: WebhookConfig,
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        serializer: OutputSerializer,
        webhook: WebhookConfig,
        timeout: Option<Duration>,
    ) -> Self {
        let client = webhook_client(&webhook);
        Self {
            queue,
            serializer,
            webhook,
            client,
            timeout,
        }
    }

    fn sink_for(&self, entry: &QueueEntry) -> Arc<dyn ResponseSink> {
        match entry.response_target() {
            ResponseTarget::Webhook(url) => Arc::new(WebhookSink::new(url, self.client.clone())),
            ResponseTarget::ResponseKey(key) => {
                Arc::new(QueueResponseSink::new(self.queue.clone(), key))
            }
            ResponseTarget::None => Arc::new(LogOnlySink),
        }
    }

    /// Run `entry` on `runner`. `cancel` ends the prediction as `canceled`.
    pub async fn execute(
        &self,
        runner: &mut Runner,
        validator: Option<&InputValidator>,
        entry: QueueEntry,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let deadline = PredictionDeadline::new(self.timeout);
        let id = entry.id.clone();
        let dispatcher = WebhookDispatcher::new(id.clone(), self.sink_for(&entry), self.webhook.clone());
        let mut prediction = Prediction::new(&id);
        let input = Value::Object(entry.input);

        if let Some(validator) = validator
            && let Err(errors) = validator.validate(&input)
        {
            let message = format_errors(&errors);
            tracing::info!(prediction_id = %id, error = %message, "Input validation failed");
            check(prediction.fail(message));
            return finish(dispatcher, &prediction).await;
        }

        check(prediction.start());
        dispatcher.send(prediction.response());
        tracing::info!(prediction_id = %id, timeout = ?deadline.remaining(), "Prediction started");

        let mut handed = runner.predict(&id, input.clone()).await;
        // The worker can die between the readiness check and the hand-off.
        if handed.is_err() && runner.state() == RunnerState::Defunct {
            tracing::warn!(prediction_id = %id, "Worker gone before prediction, restarting");
            handed = match runner.ensure_ready().await {
                Ok(_) => runner.predict(&id, input).await,
                Err(e) => Err(e),
            };
        }
        if let Err(e) = handed {
            tracing::error!(prediction_id = %id, error = %e, "Failed to hand prediction to worker");
            check(prediction.fail(CRASH_ERROR));
            return finish(dispatcher, &prediction).await;
        }

        let logs = LogPublisher::spawn(self.queue.clone(), id.clone());
        let ending = self
            .drive(runner, &mut prediction, &dispatcher, &logs, &deadline, cancel)
            .await;

        let response = prediction.response();
        let delivery = match ending {
            Ending::CancelWorker => {
                let (delivery, _) = tokio::join!(dispatcher.finish(response.clone()), runner.cancel());
                delivery
            }
            Ending::Settled => dispatcher.finish(response.clone()).await,
        };
        logs.flush().await;
        log_outcome(&id, &response, &delivery);
        ExecutionOutcome { response, delivery }
    }

    async fn drive(
        &self,
        runner: &mut Runner,
        prediction: &mut Prediction,
        dispatcher: &WebhookDispatcher,
        logs: &LogPublisher,
        deadline: &PredictionDeadline,
        cancel: &CancellationToken,
    ) -> Ending {
        loop {
            let step = tokio::select! {
                biased;
                _ = deadline.expired() => Step::TimedOut,
                _ = cancel.cancelled() => Step::Cancelled,
                event = runner.next_event() => Step::Event(event),
            };

            let event = match step {
                Step::TimedOut => {
                    tracing::warn!(prediction_id = %prediction.id(), "Prediction timed out");
                    check(prediction.fail(TIMEOUT_ERROR));
                    return Ending::CancelWorker;
                }
                Step::Cancelled => {
                    tracing::info!(prediction_id = %prediction.id(), "Prediction canceled");
                    check(prediction.cancel());
                    return Ending::CancelWorker;
                }
                Step::Event(None) => {
                    check(prediction.fail(CRASH_ERROR));
                    return Ending::Settled;
                }
                Step::Event(Some(event)) => event,
            };

            match event {
                RunnerEvent::Started => {}
                RunnerEvent::Log(line) => {
                    record_log(prediction, logs, line);
                    dispatcher.send(prediction.response());
                }
                RunnerEvent::OutputAppend(value) => {
                    match self.serialize(&value, deadline).await {
                        Ok(value) => {
                            check(prediction.append_output(value));
                            dispatcher.send(prediction.response());
                        }
                        Err(error) => {
                            check(prediction.fail(error));
                            return Ending::CancelWorker;
                        }
                    }
                }
                RunnerEvent::OutputFinal(value) => {
                    match self.serialize(&value, deadline).await {
                        Ok(value) => check(prediction.succeed(Some(value))),
                        Err(error) => check(prediction.fail(error)),
                    }
                    return Ending::Settled;
                }
                RunnerEvent::Done => {
                    check(prediction.succeed(None));
                    return Ending::Settled;
                }
                RunnerEvent::Error { message, traceback } => {
                    for line in traceback.iter().flat_map(|t| t.lines()) {
                        record_log(prediction, logs, line.to_string());
                    }
                    check(prediction.fail(message));
                    return Ending::Settled;
                }
                RunnerEvent::CancelAck => {
                    check(prediction.cancel());
                    return Ending::Settled;
                }
            }
        }
    }

    /// Serialize one output value unless the deadline passes first.
    async fn serialize(&self, value: &Value, deadline: &PredictionDeadline) -> Result<Value, String> {
        tokio::select! {
            biased;
            _ = deadline.expired() => Err(TIMEOUT_ERROR.to_string()),
            result = self.serializer.serialize(value) => result.map_err(|e| {
                tracing::error!(error = %e, "Failed to serialize output");
                e.to_string()
            }),
        }
    }
}

fn record_log(prediction: &mut Prediction, logs: &LogPublisher, line: String) {
    tracing::info!(target: "coglet::prediction", prediction_id = %prediction.id(), "{}", line);
    logs.publish(&line);
    check(prediction.append_log(line));
}

async fn finish(dispatcher: WebhookDispatcher, prediction: &Prediction) -> ExecutionOutcome {
    let response = prediction.response();
    let delivery = dispatcher.finish(response.clone()).await;
    log_outcome(prediction.id(), &response, &delivery);
    ExecutionOutcome { response, delivery }
}

fn log_outcome(id: &str, response: &PredictionResponse, delivery: &Result<(), DeliveryError>) {
    match delivery {
        Ok(()) => tracing::info!(prediction_id = %id, status = %response.status, "Prediction finished"),
        Err(e) => tracing::error!(
            prediction_id = %id,
            status = %response.status,
            error = %e,
            "Terminal response was not delivered"
        ),
    }
}

/// Transitions here only run on live predictions.
fn check(result: Result<(), StateError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Ignored invalid prediction transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::PredictionStatus;
    use crate::queue::MemoryQueue;
    use crate::runner::RunnerConfig;
    use serde_json::json;

    fn executor(queue: Arc<MemoryQueue>) -> Executor {
        Executor::new(
            queue,
            OutputSerializer::inline(),
            WebhookConfig {
                max_retries: 0,
                backoff_base: Duration::from_millis(1),
                auth_token: None,
                ..WebhookConfig::default()
            },
            None,
        )
    }

    fn entry(payload: Value) -> QueueEntry {
        serde_json::from_value(payload).unwrap()
    }

    #[tokio::test]
    async fn invalid_input_fails_without_running() {
        let queue = Arc::new(MemoryQueue::new());
        let executor = executor(queue.clone());
        let mut runner = Runner::new(RunnerConfig::new(vec!["true".into()]));
        let validator = InputValidator::from_openapi_schema(&json!({
            "components": {"schemas": {"Input": {
                "type": "object",
                "properties": {"num": {"type": "integer"}},
                "required": ["num"]
            }}}
        }))
        .unwrap();

        let outcome = executor
            .execute(
                &mut runner,
                Some(&validator),
                entry(json!({"id": "p1", "input": {"num": "not a number"}, "response_queue": "resp"})),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.delivery.is_ok());
        assert_eq!(outcome.response.status, PredictionStatus::Failed);
        assert!(
            outcome
                .response
                .error
                .as_deref()
                .unwrap()
                .contains("value is not a valid integer")
        );
        assert!(outcome.response.logs.is_empty());
        assert!(outcome.response.timestamps.is_none());

        let responses = queue.responses("resp");
        assert_eq!(responses.len(), 1);
        let delivered: Value = serde_json::from_str(&responses[0]).unwrap();
        assert_eq!(delivered["status"], "failed");
    }

    #[tokio::test]
    async fn runner_not_ready_fails_prediction() {
        let queue = Arc::new(MemoryQueue::new());
        let executor = executor(queue.clone());
        let mut runner = Runner::new(RunnerConfig::new(vec!["true".into()]));

        let outcome = executor
            .execute(
                &mut runner,
                None,
                entry(json!({"id": "p2", "input": {}, "response_queue": "resp"})),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.response.status, PredictionStatus::Failed);
        assert_eq!(outcome.response.error.as_deref(), Some(CRASH_ERROR));
        let last: Value = serde_json::from_str(queue.responses("resp").last().unwrap()).unwrap();
        assert_eq!(last["status"], "failed");
    }

    /// Log stream that never answers.
    struct StalledLogStream(MemoryQueue);

    #[async_trait::async_trait]
    impl JobQueue for StalledLogStream {
        async fn claim(
            &self,
            block: Duration,
        ) -> Result<Option<crate::queue::QueueMessage>, crate::queue::QueueError> {
            self.0.claim(block).await
        }

        async fn ack(&self, message_id: &str) -> Result<(), crate::queue::QueueError> {
            self.0.ack(message_id).await
        }

        async fn write_response(
            &self,
            key: &str,
            payload: &str,
        ) -> Result<(), crate::queue::QueueError> {
            self.0.write_response(key, payload).await
        }

        async fn publish_log(
            &self,
            _prediction_id: &str,
            _line: &str,
        ) -> Result<(), crate::queue::QueueError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn log_lines_are_published_in_order() {
        let queue = Arc::new(MemoryQueue::new());
        let logs = LogPublisher::spawn(queue.clone(), "p1".to_string());
        for line in ["one", "two", "three"] {
            logs.publish(line);
        }
        logs.flush().await;

        let published: Vec<String> = queue.published_logs().into_iter().map(|(_, l)| l).collect();
        assert_eq!(published, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_log_stream_never_blocks_publishing() {
        let logs = LogPublisher::spawn(
            Arc::new(StalledLogStream(MemoryQueue::new())),
            "p1".to_string(),
        );
        let started = tokio::time::Instant::now();
        for i in 0..100 {
            logs.publish(&format!("line {i}"));
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        logs.flush().await;
        assert!(started.elapsed() >= LOG_FLUSH_TIMEOUT);
        assert!(started.elapsed() < LOG_FLUSH_TIMEOUT * 2);
    }
}
