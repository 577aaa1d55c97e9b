//! Wire protocol types for runner-worker communication.
//!
//! One structured channel (a Unix socket) carries these messages in both
//! directions. The worker's stdout/stderr are captured separately and merged
//! with socket traffic by the runner; see [`drain_marker`] for how the two are
//! synchronized at the end of a prediction.

use serde::{Deserialize, Serialize};

/// Line written to stdout and stderr by a worker right before it reports a
/// terminal message for a prediction.
///
/// The leading NUL keeps it from colliding with anything user code prints.
pub const DRAIN_MARKER_PREFIX: &str = "\u{0}coglet-drain:";

/// Drain marker id written once setup finished, before `setup_complete` or
/// `setup_failed`.
pub const SETUP_DRAIN_ID: &str = "\u{0}setup";

pub fn drain_marker(prediction_id: &str) -> String {
    format!("{DRAIN_MARKER_PREFIX}{prediction_id}")
}

/// Returns the prediction id if `line` is a drain marker.
pub fn parse_drain_marker(line: &str) -> Option<&str> {
    line.strip_prefix(DRAIN_MARKER_PREFIX)
}

/// Messages from runner to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Predict {
        id: String,
        input: serde_json::Value,
    },

    /// Cooperative cancellation of the running prediction.
    Cancel {
        id: String,
    },

    Shutdown,
}

/// Messages from worker to runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Model loaded; the worker accepts predictions from now on.
    SetupComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<serde_json::Value>,
    },

    /// Model setup raised. The worker exits after sending this.
    SetupFailed {
        error: String,
    },

    PredictionStarted {
        id: String,
    },

    /// One element of a streamed output.
    OutputValue {
        id: String,
        output: serde_json::Value,
    },

    /// Prediction finished. `output` is the returned value for non-streaming
    /// predictors and absent once everything was streamed.
    OutputDone {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },

    /// Log line sent through the structured channel instead of stdout/stderr.
    Log {
        source: LogSource,
        data: String,
    },

    PredictionError {
        id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },

    CancelAck {
        id: String,
    },

    /// Worker-side tracing event. Never part of prediction logs.
    WorkerLog {
        target: String,
        level: String,
        message: String,
    },
}

impl WorkerMessage {
    /// Prediction this message terminates, if it is a terminal message.
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            Self::OutputDone { id, .. }
            | Self::PredictionError { id, .. }
            | Self::CancelAck { id } => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}
