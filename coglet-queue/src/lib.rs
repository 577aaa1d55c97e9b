//! coglet-queue: queue-driven prediction execution for cog models.
//!
//! A [`QueueWorker`] claims prediction requests from a [`JobQueue`], runs them
//! in a supervised worker subprocess through the [`Runner`], and reports every
//! state change to a webhook or response key. The [`worker`] module is the
//! other end: the protocol implementation a model binary links against.

pub mod bridge;
pub mod config;
pub mod consumer;
pub mod execution;
mod health;
pub mod input_validation;
pub mod logging;
pub mod output;
mod prediction;
pub mod queue;
pub mod runner;
pub mod timeout;
mod version;
pub mod webhook;
pub mod worker;
mod worker_tracing_layer;

pub use config::{ConfigError, QueueWorkerConfig};
pub use consumer::{ConsumerError, QueueWorker};
pub use execution::{ExecutionOutcome, Executor};
pub use health::{RunnerState, SetupResult, SetupStatus};
pub use output::{OutputError, OutputSerializer, file_ref};
pub use prediction::{
    Prediction, PredictionOutput, PredictionResponse, PredictionStatus, StateError, Timestamps,
};
pub use queue::{JobQueue, MemoryQueue, QueueEntry, QueueError, RedisQueue, RedisQueueConfig};
pub use runner::{Runner, RunnerConfig, RunnerError, RunnerEvent};
pub use version::{COGLET_QUEUE_VERSION, VersionInfo, user_agent};
pub use webhook::{DeliveryError, WebhookConfig, WebhookDispatcher};
pub use worker::{PredictContext, PredictError, PredictHandler, SetupError, WorkerConfig, run_worker};
