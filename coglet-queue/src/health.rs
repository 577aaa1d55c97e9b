//! Runner lifecycle state and setup results.

use serde::{Deserialize, Serialize};

/// Lifecycle of the worker subprocess owned by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    /// No process yet
    #[default]
    Spawning,
    /// Process running model setup
    SettingUp,
    /// Idle, accepting a prediction
    Ready,
    /// One prediction bound
    Busy,
    ShuttingDown,
    /// Process exited or was killed; must be restarted
    Defunct,
}

impl RunnerState {
    pub fn accepts_predictions(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Status of the setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Result of the setup phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResult {
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub status: SetupStatus,
    /// Output the worker produced while loading the model.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

impl SetupResult {
    pub fn starting() -> Self {
        Self {
            started_at: now(),
            completed_at: None,
            status: SetupStatus::Starting,
            logs: String::new(),
        }
    }

    pub fn append_log(&mut self, line: &str) {
        self.logs.push_str(line);
        self.logs.push('\n');
    }

    pub fn succeeded(mut self) -> Self {
        self.completed_at = Some(now());
        self.status = SetupStatus::Succeeded;
        self
    }

    pub fn failed(mut self) -> Self {
        self.completed_at = Some(now());
        self.status = SetupStatus::Failed;
        self
    }
}
