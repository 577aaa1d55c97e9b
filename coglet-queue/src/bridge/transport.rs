//! Socket transport for the structured worker channel.
//!
//! Platform-specific implementations:
//! - **Named socket**: filesystem socket (macOS, Linux, BSD)
//! - **Abstract socket**: Linux abstract namespace (no filesystem, auto-cleanup)
//!
//! Each spawned worker gets a fresh socket; its address reaches the child
//! through [`TRANSPORT_ENV`].

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

/// Environment variable carrying the JSON-encoded [`ChildTransportInfo`].
pub const TRANSPORT_ENV: &str = "COGLET_WORKER_TRANSPORT";

/// Information passed to the child process for connecting back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildTransportInfo {
    NamedSocket {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    AbstractSocket {
        name: String,
    },
}

impl ChildTransportInfo {
    pub fn to_env_value(&self) -> io::Result<String> {
        serde_json::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn from_env_value(value: &str) -> io::Result<Self> {
        serde_json::from_str(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read the transport address the runner handed to this process.
    pub fn from_env() -> io::Result<Self> {
        let value = std::env::var(TRANSPORT_ENV).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{TRANSPORT_ENV} is not set; worker must be started by coglet-queue"),
            )
        })?;
        Self::from_env_value(&value)
    }
}

fn socket_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("coglet-{}-{}", std::process::id(), &suffix[..12])
}

/// Parent-side listener accepting the worker's single connection.
pub struct WorkerListener {
    listener: UnixListener,
    path: Option<PathBuf>,
}

impl WorkerListener {
    /// Bind using the platform default (abstract on Linux, named elsewhere).
    pub fn bind() -> io::Result<(Self, ChildTransportInfo)> {
        #[cfg(target_os = "linux")]
        {
            Self::bind_abstract()
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::bind_named(std::env::temp_dir())
        }
    }

    /// Bind a filesystem socket inside `dir`.
    pub fn bind_named(dir: PathBuf) -> io::Result<(Self, ChildTransportInfo)> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.sock", socket_name()));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(transport_type = "named", path = %path.display(), "Bound worker socket");

        let info = ChildTransportInfo::NamedSocket { path: path.clone() };
        Ok((
            Self {
                listener,
                path: Some(path),
            },
            info,
        ))
    }

    #[cfg(target_os = "linux")]
    pub fn bind_abstract() -> io::Result<(Self, ChildTransportInfo)> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let name = socket_name();
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        tracing::debug!(transport_type = "abstract", name = %name, "Bound worker socket");

        Ok((
            Self {
                listener,
                path: None,
            },
            ChildTransportInfo::AbstractSocket { name },
        ))
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!("Worker connected");
        Ok(stream)
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %path.display(), "Failed to remove worker socket");
        }
    }
}

/// Connect from the child side.
pub async fn connect(info: &ChildTransportInfo) -> io::Result<UnixStream> {
    match info {
        ChildTransportInfo::NamedSocket { path } => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        ChildTransportInfo::AbstractSocket { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}
