//! In-process queue for embedding and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{JobQueue, QueueError, QueueMessage};

#[derive(Default)]
struct State {
    next_id: u64,
    waiting: VecDeque<QueueMessage>,
    pending: HashMap<String, QueueMessage>,
    acked: Vec<String>,
    responses: HashMap<String, Vec<String>>,
    logs: Vec<(String, String)>,
    closed: bool,
}

/// Queue with consumer-group semantics: claimed messages stay pending until
/// acked and are not handed out again until [`MemoryQueue::recover`].
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a payload; returns its message id.
    pub fn push(&self, payload: impl Into<String>) -> String {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.waiting.push_back(QueueMessage {
                message_id: id.clone(),
                payload: payload.into(),
            });
            id
        };
        self.notify.notify_waiters();
        id
    }

    /// Wake blocked claimers and make further claims return nothing.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    /// Return every unacknowledged message to the head of the queue, oldest
    /// first, the way a restarted consumer re-reads its pending backlog.
    /// Returns how many were recovered.
    pub fn recover(&self) -> usize {
        let recovered = {
            let mut state = self.state();
            let mut pending: Vec<QueueMessage> = state.pending.drain().map(|(_, m)| m).collect();
            pending.sort_by_key(|m| message_seq(&m.message_id));
            for message in pending.iter().rev() {
                state.waiting.push_front(message.clone());
            }
            pending.len()
        };
        self.notify.notify_waiters();
        recovered
    }

    /// Messages claimed but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state().acked.clone()
    }

    /// Every payload written to `key`, oldest first.
    pub fn responses(&self, key: &str) -> Vec<String> {
        self.state().responses.get(key).cloned().unwrap_or_default()
    }

    pub fn published_logs(&self) -> Vec<(String, String)> {
        self.state().logs.clone()
    }
}

fn message_seq(message_id: &str) -> u64 {
    message_id
        .split_once('-')
        .and_then(|(seq, _)| seq.parse().ok())
        .unwrap_or(u64::MAX)
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn claim(&self, block: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return Ok(None);
                }
                if let Some(message) = state.waiting.pop_front() {
                    state
                        .pending
                        .insert(message.message_id.clone(), message.clone());
                    return Ok(Some(message));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.pending.remove(message_id).is_some() {
            state.acked.push(message_id.to_string());
        }
        Ok(())
    }

    async fn write_response(&self, key: &str, payload: &str) -> Result<(), QueueError> {
        self.state()
            .responses
            .entry(key.to_string())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }

    async fn publish_log(&self, prediction_id: &str, line: &str) -> Result<(), QueueError> {
        self.state()
            .logs
            .push((prediction_id.to_string(), line.to_string()));
        Ok(())
    }
}
