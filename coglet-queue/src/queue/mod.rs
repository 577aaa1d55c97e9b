//! Job queue abstraction.
//!
//! A [`JobQueue`] hands out one raw message at a time to this consumer and
//! takes it back with [`JobQueue::ack`] once the prediction's terminal
//! response has been delivered. Parsing into a [`QueueEntry`] happens in the
//! consumer so malformed messages can be acknowledged and dropped.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::memory::MemoryQueue;
pub use self::redis::{RedisQueue, RedisQueueConfig};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("message {id} has no `value` field")]
    MissingValue { id: String },

    #[error("queue is closed")]
    Closed,
}

/// A claimed, not yet acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub payload: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Claim the next message for this consumer, waiting up to `block`.
    async fn claim(&self, block: Duration) -> Result<Option<QueueMessage>, QueueError>;

    async fn ack(&self, message_id: &str) -> Result<(), QueueError>;

    /// Write a response payload where a caller waits for it.
    async fn write_response(&self, key: &str, payload: &str) -> Result<(), QueueError>;

    /// Mirror a prediction log line to an external log stream.
    async fn publish_log(&self, _prediction_id: &str, _line: &str) -> Result<(), QueueError> {
        Ok(())
    }
}

/// A prediction request as enqueued by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(
        default,
        alias = "response_sink",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_queue: Option<String>,
}

/// Where a prediction's snapshots go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseTarget {
    Webhook(String),
    ResponseKey(String),
    None,
}

impl QueueEntry {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// The webhook wins when both are present.
    pub fn response_target(&self) -> ResponseTarget {
        match (&self.webhook, &self.response_queue) {
            (Some(url), _) => ResponseTarget::Webhook(url.clone()),
            (None, Some(key)) => ResponseTarget::ResponseKey(key.clone()),
            (None, None) => ResponseTarget::None,
        }
    }
}
