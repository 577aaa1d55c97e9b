//! Output serialization.
//!
//! Workers refer to files they produced with a file leaf, `{"$file": "<path>"}`,
//! anywhere inside an output value. Before an output leaves the container each
//! leaf is replaced with a URL:
//! - an upload endpoint is configured: the file is PUT there (multipart, field
//!   `file`) and the returned `{"url": ...}` is used
//! - otherwise: a base64 `data:` URL
//!
//! Every distinct path is resolved once per value, however often it appears.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Key marking a file leaf in worker output.
pub const FILE_KEY: &str = "$file";

/// Build a file leaf for `path`.
pub fn file_ref(path: impl AsRef<Path>) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(
        FILE_KEY.to_string(),
        Value::String(path.as_ref().display().to_string()),
    );
    Value::Object(map)
}

fn as_file_leaf(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(FILE_KEY).and_then(Value::as_str),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to read output file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to upload output file {}: {source}", path.display())]
    Upload {
        path: PathBuf,
        source: reqwest::Error,
    },

    #[error("upload of {} rejected with status {status}", path.display())]
    UploadStatus { path: PathBuf, status: u16 },
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

pub struct OutputSerializer {
    upload_url: Option<String>,
    client: reqwest::Client,
}

impl OutputSerializer {
    pub fn new(upload_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");
        Self { upload_url, client }
    }

    /// Serializer that inlines files as data URLs.
    pub fn inline() -> Self {
        Self::new(None)
    }

    /// Produce a transport-safe copy of `value`. `value` itself is untouched.
    pub async fn serialize(&self, value: &Value) -> Result<Value, OutputError> {
        let mut paths = Vec::new();
        collect_files(value, &mut paths);
        if paths.is_empty() {
            return Ok(value.clone());
        }

        let mut resolved = HashMap::with_capacity(paths.len());
        for path in paths {
            let url = match &self.upload_url {
                Some(endpoint) => self.upload(endpoint, Path::new(path)).await?,
                None => data_url(Path::new(path)).await?,
            };
            resolved.insert(path, url);
        }

        Ok(rewrite(value, &resolved))
    }

    async fn upload(&self, endpoint: &str, path: &Path) -> Result<String, OutputError> {
        let bytes = read_file(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        tracing::debug!(path = %path.display(), size = bytes.len(), "Uploading output file");

        let upload_err = |source| OutputError::Upload {
            path: path.to_path_buf(),
            source,
        };
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime.as_ref())
            .map_err(upload_err)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .put(endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(upload_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(OutputError::UploadStatus {
                path: path.to_path_buf(),
                status: status.as_u16(),
            });
        }

        let body: UploadResponse = response.json().await.map_err(upload_err)?;
        Ok(body.url)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, OutputError> {
    tokio::fs::read(path).await.map_err(|source| OutputError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Encode a file as "data:{mime};base64,{encoded}".
async fn data_url(path: &Path) -> Result<String, OutputError> {
    use base64::Engine as _;

    let bytes = read_file(path).await?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

fn collect_files<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    if let Some(path) = as_file_leaf(value) {
        if !out.contains(&path) {
            out.push(path);
        }
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_files(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_files(v, out)),
        _ => {}
    }
}

fn rewrite(value: &Value, resolved: &HashMap<&str, String>) -> Value {
    if let Some(path) = as_file_leaf(value)
        && let Some(url) = resolved.get(path)
    {
        return Value::String(url.clone());
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite(v, resolved)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite(v, resolved)).collect()),
        other => other.clone(),
    }
}
