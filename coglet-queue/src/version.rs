//! Version information for coglet-queue.

/// Version from Cargo.toml
pub const COGLET_QUEUE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value of the `User-Agent` header on outgoing requests.
pub fn user_agent() -> String {
    format!("coglet-queue/{COGLET_QUEUE_VERSION}")
}

/// Version information logged at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub coglet_queue: &'static str,
    /// Worker command the runner supervises.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            coglet_queue: COGLET_QUEUE_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: String) -> Self {
        self.worker = Some(worker);
        self
    }
}
