//! Redis Streams consumer group backend.
//!
//! - the consumer group is named after the stream and created on connect
//! - messages claimed by this consumer but never acked (a previous run died
//!   mid-prediction) are handed out again before new ones, once each per run
//! - the request JSON lives in the stream field `value`
//! - responses are `SET` at the caller's key
//! - log lines are `XADD`ed to an optional log stream

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::StreamReadReply;
use async_trait::async_trait;

use super::{JobQueue, QueueError, QueueMessage};

#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub host: String,
    pub port: u16,
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub model_id: String,
    pub log_stream: Option<String>,
}

impl RedisQueueConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

pub struct RedisQueue {
    config: RedisQueueConfig,
    /// Dedicated to blocking reads so acks and writes are never stuck behind them.
    read_conn: MultiplexedConnection,
    conn: MultiplexedConnection,
    backlog: Mutex<BacklogCursor>,
}

/// Position in this consumer's pending backlog.
///
/// Reading the backlog from `0` returns the same entry until it is acked, so
/// an entry left pending (its delivery failed) would be handed out forever.
/// The cursor moves past every entry it returns and the backlog is done after
/// one pass.
#[derive(Debug)]
struct BacklogCursor {
    after: Option<String>,
}

impl BacklogCursor {
    fn new() -> Self {
        Self {
            after: Some("0".to_string()),
        }
    }

    /// Id to read the backlog after, or `None` once it has been walked.
    fn position(&self) -> Option<String> {
        self.after.clone()
    }

    fn advance(&mut self, message_id: &str) {
        if self.after.is_some() {
            self.after = Some(message_id.to_string());
        }
    }

    fn finish(&mut self) {
        self.after = None;
    }
}

impl RedisQueue {
    pub async fn connect(config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(config.url())?;
        let read_conn = client.get_multiplexed_async_connection().await?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        ensure_group(&mut conn, &config.stream, &config.group).await?;
        tracing::info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %config.consumer,
            "Connected to redis queue"
        );

        Ok(Self {
            config,
            read_conn,
            conn,
            backlog: Mutex::new(BacklogCursor::new()),
        })
    }

    fn backlog(&self) -> std::sync::MutexGuard<'_, BacklogCursor> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read(
        &self,
        from_id: &str,
        block: Option<Duration>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.config.stream).arg(from_id);

        let mut conn = self.read_conn.clone();
        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        let Some(reply) = reply else {
            return Ok(None);
        };

        let Some(entry) = reply.keys.into_iter().flat_map(|k| k.ids).next() else {
            return Ok(None);
        };
        match entry.get::<String>("value") {
            Some(payload) => Ok(Some(QueueMessage {
                message_id: entry.id,
                payload,
            })),
            None => Err(QueueError::MissingValue { id: entry.id }),
        }
    }
}

async fn ensure_group(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
) -> Result<(), QueueError> {
    let result: Result<(), ::redis::RedisError> = ::redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(()) => {
            tracing::debug!(stream, group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn claim(&self, block: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let position = self.backlog().position();
        if let Some(after) = position {
            match self.read(&after, None).await {
                Ok(Some(message)) => {
                    self.backlog().advance(&message.message_id);
                    tracing::info!(message_id = %message.message_id, "Reclaimed pending message");
                    return Ok(Some(message));
                }
                Ok(None) => {
                    tracing::debug!("Pending backlog drained");
                    self.backlog().finish();
                }
                Err(QueueError::MissingValue { id }) => {
                    self.backlog().advance(&id);
                    tracing::warn!(message_id = %id, "Pending message has no value, acknowledging");
                    self.ack(&id).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        match self.read(">", Some(block)).await {
            Err(QueueError::MissingValue { id }) => {
                tracing::warn!(message_id = %id, "Message has no value, acknowledging");
                self.ack(&id).await?;
                Ok(None)
            }
            other => other,
        }
    }

    async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("XACK")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(message_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn write_response(&self, key: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish_log(&self, prediction_id: &str, line: &str) -> Result<(), QueueError> {
        let Some(log_stream) = &self.config.log_stream else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("XADD")
            .arg(log_stream)
            .arg("*")
            .arg("model_id")
            .arg(&self.config.model_id)
            .arg("worker_id")
            .arg(&self.config.consumer)
            .arg("prediction_id")
            .arg(prediction_id)
            .arg("line")
            .arg(line)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
