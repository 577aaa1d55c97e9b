//! Prediction state tracking.
//!
//! A [`Prediction`] moves `starting -> processing -> {succeeded, failed, canceled}`.
//! Every transition method returns [`StateError`] once the prediction is
//! terminal, so a terminal prediction can never be mutated.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prediction output - single value or streamed chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(serde_json::Value),
    Stream(Vec<serde_json::Value>),
}

impl PredictionOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, PredictionOutput::Stream(_))
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            PredictionOutput::Single(v) => v.clone(),
            PredictionOutput::Stream(v) => serde_json::Value::Array(v.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("prediction {id} is already {status}")]
    Terminal { id: String, status: PredictionStatus },

    #[error("prediction {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: String,
        status: PredictionStatus,
        expected: PredictionStatus,
    },
}

/// Timestamps block of the response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Snapshot payload delivered to webhooks and response keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub status: PredictionStatus,
    pub output: Option<serde_json::Value>,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "x-experimental-timestamps",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamps: Option<Timestamps>,
}

impl PredictionResponse {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Prediction lifecycle state.
#[derive(Debug, Clone)]
pub struct Prediction {
    id: String,
    status: PredictionStatus,
    output: Option<PredictionOutput>,
    logs: Vec<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PredictionStatus::Starting,
            output: None,
            logs: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn output(&self) -> Option<&PredictionOutput> {
        self.output.as_ref()
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn ensure_mutable(&self) -> Result<(), StateError> {
        if self.is_terminal() {
            return Err(StateError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_status(&self, expected: PredictionStatus) -> Result<(), StateError> {
        self.ensure_mutable()?;
        if self.status != expected {
            return Err(StateError::InvalidTransition {
                id: self.id.clone(),
                status: self.status,
                expected,
            });
        }
        Ok(())
    }

    /// `starting -> processing`; sets `started_at`.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.ensure_status(PredictionStatus::Starting)?;
        self.status = PredictionStatus::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn append_log(&mut self, line: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.logs.push(line.into());
        Ok(())
    }

    /// Append one streamed output value. The output becomes a sequence.
    pub fn append_output(&mut self, value: serde_json::Value) -> Result<(), StateError> {
        self.ensure_status(PredictionStatus::Processing)?;
        match &mut self.output {
            Some(PredictionOutput::Stream(values)) => values.push(value),
            Some(PredictionOutput::Single(single)) => {
                let first = std::mem::take(single);
                self.output = Some(PredictionOutput::Stream(vec![first, value]));
            }
            None => self.output = Some(PredictionOutput::Stream(vec![value])),
        }
        Ok(())
    }

    /// Terminal success. A final value after streamed values is appended to
    /// the stream; with nothing streamed it becomes the single output.
    pub fn succeed(&mut self, output: Option<serde_json::Value>) -> Result<(), StateError> {
        self.ensure_status(PredictionStatus::Processing)?;
        if let Some(value) = output {
            match &mut self.output {
                Some(PredictionOutput::Stream(values)) => values.push(value),
                _ => self.output = Some(PredictionOutput::Single(value)),
            }
        }
        self.finish(PredictionStatus::Succeeded);
        Ok(())
    }

    /// Terminal failure from `starting` or `processing`. Partial output is kept.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.error = Some(error.into());
        self.finish(PredictionStatus::Failed);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.finish(PredictionStatus::Canceled);
        Ok(())
    }

    fn finish(&mut self, status: PredictionStatus) {
        let now = Utc::now();
        let completed_at = match self.started_at {
            Some(started_at) if started_at > now => started_at,
            _ => now,
        };
        self.status = status;
        self.completed_at = Some(completed_at);
    }

    /// Snapshot of the current state in wire form.
    pub fn response(&self) -> PredictionResponse {
        let timestamps = self.started_at.map(|started_at| Timestamps {
            started_at: format_timestamp(started_at),
            completed_at: self.completed_at.map(format_timestamp),
        });

        PredictionResponse {
            status: self.status,
            output: self.output.as_ref().map(PredictionOutput::to_value),
            logs: self.logs.clone(),
            error: self.error.clone(),
            timestamps,
        }
    }
}
