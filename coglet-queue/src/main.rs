use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use coglet_queue::config::USAGE;
use coglet_queue::logging::init_tracing;
use coglet_queue::{
    Executor, OutputSerializer, QueueWorker, QueueWorkerConfig, RedisQueue, Runner, VersionInfo,
};

#[tokio::main]
async fn main() {
    let config = match QueueWorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(config).await {
        tracing::error!(error = format!("{e:#}"), "Queue worker failed");
        process::exit(1);
    }
}

async fn run(config: QueueWorkerConfig) -> anyhow::Result<()> {
    let version = VersionInfo::new().with_worker(config.worker_command.join(" "));
    tracing::info!(
        version = version.coglet_queue,
        worker = version.worker.as_deref().unwrap_or(""),
        queue = %config.redis.stream,
        consumer = %config.redis.consumer,
        "Starting queue worker"
    );

    let queue = RedisQueue::connect(config.redis.clone())
        .await
        .with_context(|| format!("failed to connect to redis at {}", config.redis.url()))?;
    let queue = Arc::new(queue);

    let executor = Executor::new(
        queue.clone(),
        OutputSerializer::new(config.upload_url.clone()),
        config.webhook_config(),
        config.predict_timeout,
    );
    let worker = QueueWorker::new(queue, Runner::new(config.runner_config()), executor);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    worker.run(shutdown).await.context("queue worker stopped")?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl-C, shutting down");
    }

    shutdown.cancel();
}
