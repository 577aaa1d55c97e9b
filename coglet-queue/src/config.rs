//! Process configuration from positional arguments and the environment.

use std::time::Duration;

use crate::queue::RedisQueueConfig;
use crate::runner::RunnerConfig;
use crate::webhook::WebhookConfig;

pub const USAGE: &str = "Usage: coglet-queue <redis_host> <redis_port> <queue_name> <upload_url> \
<worker_id> <model_id> <log_stream> [timeout_seconds]";

/// Worker command line, split on whitespace.
pub const WORKER_ENV: &str = "COGLET_WORKER";
pub const SETUP_TIMEOUT_ENV: &str = "COGLET_SETUP_TIMEOUT";
pub const CANCEL_GRACE_ENV: &str = "COGLET_CANCEL_GRACE";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("expected 7 or 8 arguments, got {0}")]
    ArgumentCount(usize),

    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("COGLET_WORKER is not set")]
    MissingWorker,
}

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub redis: RedisQueueConfig,
    pub upload_url: Option<String>,
    pub predict_timeout: Option<Duration>,
    pub worker_command: Vec<String>,
    pub setup_timeout: Option<Duration>,
    pub cancel_grace: Duration,
}

impl QueueWorkerConfig {
    /// Read from the process's arguments and environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_args_and_env(&args, |key| std::env::var(key).ok())
    }

    /// `args` excludes the program name.
    pub fn from_args_and_env(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let [host, port, queue, upload_url, worker_id, model_id, log_stream, rest @ ..] = args
        else {
            return Err(ConfigError::ArgumentCount(args.len()));
        };
        let predict_timeout = match rest {
            [] => None,
            [seconds] => Some(parse_seconds("timeout_seconds", seconds)?),
            _ => return Err(ConfigError::ArgumentCount(args.len())),
        };

        let port = port.parse().map_err(|_| ConfigError::Invalid {
            name: "redis_port",
            value: port.clone(),
        })?;

        let worker_command: Vec<String> = env(WORKER_ENV)
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();
        if worker_command.is_empty() {
            return Err(ConfigError::MissingWorker);
        }

        let setup_timeout = env(SETUP_TIMEOUT_ENV)
            .filter(|v| !v.is_empty())
            .map(|v| parse_seconds(SETUP_TIMEOUT_ENV, &v))
            .transpose()?;
        let cancel_grace = env(CANCEL_GRACE_ENV)
            .filter(|v| !v.is_empty())
            .map(|v| parse_seconds(CANCEL_GRACE_ENV, &v))
            .transpose()?
            .unwrap_or(Duration::from_secs(5));

        Ok(Self {
            redis: RedisQueueConfig {
                host: host.clone(),
                port,
                stream: queue.clone(),
                group: queue.clone(),
                consumer: worker_id.clone(),
                model_id: model_id.clone(),
                log_stream: non_empty(log_stream),
            },
            upload_url: non_empty(upload_url),
            predict_timeout,
            worker_command,
            setup_timeout,
            cancel_grace,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new(self.worker_command.clone())
            .with_setup_timeout(self.setup_timeout)
            .with_cancel_grace(self.cancel_grace)
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig::default()
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_seconds(name: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
}
