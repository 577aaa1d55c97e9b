#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use coglet_queue::runner::CommandSpawner;
use coglet_queue::{
    ConsumerError, Executor, MemoryQueue, OutputSerializer, QueueWorker, Runner, RunnerConfig,
    WebhookConfig,
};

pub const DEMO_WORKER: &str = env!("CARGO_BIN_EXE_coglet-demo-worker");

pub struct Demo<'a> {
    pub model: &'a str,
    pub output_dir: &'a Path,
    pub setup_seconds: f64,
    pub timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub upload_url: Option<String>,
    pub webhook: WebhookConfig,
}

impl<'a> Demo<'a> {
    pub fn new(model: &'a str, output_dir: &'a Path) -> Self {
        Self {
            model,
            output_dir,
            setup_seconds: 0.0,
            timeout: None,
            cancel_grace: Duration::from_secs(2),
            upload_url: None,
            webhook: WebhookConfig {
                max_retries: 2,
                backoff_base: Duration::from_millis(10),
                auth_token: None,
                ..WebhookConfig::default()
            },
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let spawner = CommandSpawner::new(vec![DEMO_WORKER.to_string()])
            .with_env("DEMO_MODEL", self.model)
            .with_env("DEMO_SETUP_SECONDS", self.setup_seconds.to_string())
            .with_env("DEMO_OUTPUT_DIR", self.output_dir.display().to_string());
        RunnerConfig::with_spawner(Arc::new(spawner))
            .with_setup_timeout(Some(Duration::from_secs(30)))
            .with_cancel_grace(self.cancel_grace)
            .with_shutdown_grace(Duration::from_secs(2))
    }

    pub fn runner(&self) -> Runner {
        Runner::new(self.runner_config())
    }

    /// Start a consumer on `queue` in the background.
    pub fn spawn(self, queue: Arc<MemoryQueue>) -> Running {
        let executor = Executor::new(
            queue.clone(),
            OutputSerializer::new(self.upload_url.clone()),
            self.webhook.clone(),
            self.timeout,
        );
        let worker = QueueWorker::new(queue, self.runner(), executor)
            .with_block(Duration::from_millis(50));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(worker.run(shutdown.clone()));
        Running { shutdown, task }
    }
}

pub struct Running {
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), ConsumerError>>,
}

impl Running {
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("consumer did not stop")
            .expect("consumer panicked")
            .expect("consumer failed");
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Snapshots written to a response key, parsed.
pub fn responses(queue: &MemoryQueue, key: &str) -> Vec<Value> {
    queue
        .responses(key)
        .iter()
        .map(|r| serde_json::from_str(r).unwrap())
        .collect()
}

pub fn entry(id: &str, input: Value, response_queue: &str) -> String {
    serde_json::json!({"id": id, "input": input, "response_queue": response_queue}).to_string()
}

/// Run one entry to an acknowledged terminal response.
pub async fn run_one(demo: Demo<'_>, input: Value) -> Vec<Value> {
    let queue = Arc::new(MemoryQueue::new());
    let running = demo.spawn(queue.clone());
    queue.push(entry("p1", input, "resp"));
    wait_for(Duration::from_secs(20), || queue.acked().len() == 1).await;
    running.stop().await;
    responses(&queue, "resp")
}

/// Checks that hold for every prediction's snapshot sequence.
pub fn assert_well_formed(snapshots: &[Value]) {
    let (last, rest) = snapshots.split_last().expect("no snapshots");
    let terminal = ["succeeded", "failed", "canceled"];
    assert!(terminal.contains(&last["status"].as_str().unwrap()), "{last}");
    for snapshot in rest {
        assert!(
            !terminal.contains(&snapshot["status"].as_str().unwrap()),
            "terminal snapshot before the last: {snapshot}"
        );
    }

    for pair in snapshots.windows(2) {
        let before = pair[0]["logs"].as_array().unwrap();
        let after = pair[1]["logs"].as_array().unwrap();
        assert!(after.starts_with(before), "logs shrank: {before:?} -> {after:?}");
    }

    if let Some(timestamps) = last.get("x-experimental-timestamps") {
        let started = timestamps["started_at"].as_str().unwrap();
        let completed = timestamps["completed_at"].as_str().unwrap();
        assert!(completed >= started);
    }
}
