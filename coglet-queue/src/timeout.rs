//! Per-prediction wall-clock deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Error message recorded when a prediction exceeds its deadline.
pub const TIMEOUT_ERROR: &str = "Prediction timed out";

/// Deadline armed when a prediction is dequeued.
///
/// Dropping it disarms it; there is no background timer.
#[derive(Debug, Clone, Copy)]
pub struct PredictionDeadline {
    deadline: Option<Instant>,
}

impl PredictionDeadline {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves at the deadline, or never when no timeout is configured.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
