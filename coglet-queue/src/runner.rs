//! Runner - owns the worker subprocess and turns its output into events.
//!
//! Flow:
//! 1. Bind a socket, spawn the worker with stdout/stderr piped
//! 2. Wait for the worker to connect and report `setup_complete`
//! 3. Per prediction: send `predict`, then pull [`RunnerEvent`]s until a
//!    terminal one
//! 4. On crash: synthesize a terminal event, go defunct, restart on demand
//!
//! Socket messages and stdout/stderr lines are funneled into one channel by
//! reader tasks. A terminal message is held back until both output streams
//! delivered the worker's drain marker for that prediction, so every line the
//! prediction printed is surfaced before its terminal event.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    DRAIN_MARKER_PREFIX, LogSource, SETUP_DRAIN_ID, WorkerMessage, WorkerRequest,
    parse_drain_marker,
};
use crate::bridge::transport::{TRANSPORT_ENV, WorkerListener};
use crate::health::{RunnerState, SetupResult};
use crate::timeout::PredictionDeadline;

/// Error message for a prediction whose worker died under it.
pub const CRASH_ERROR: &str = "prediction failed";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("failed to create worker socket: {0}")]
    Transport(#[source] io::Error),

    #[error("worker setup failed: {0}")]
    SetupFailed(String),

    #[error("worker exited during setup: {0}")]
    ExitedDuringSetup(String),

    #[error("worker setup timed out after {0:?}")]
    SetupTimeout(Duration),

    #[error("worker is not ready (state {0:?})")]
    NotReady(RunnerState),

    #[error("failed to send to worker: {0}")]
    Send(#[source] io::Error),
}

impl RunnerError {
    /// Setup problems can't be fixed by retrying; the container has to go.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_)
                | Self::Transport(_)
                | Self::SetupFailed(_)
                | Self::ExitedDuringSetup(_)
                | Self::SetupTimeout(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to spawn process: {0}")]
    Io(#[from] io::Error),
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
}

/// Everything a spawner must hand to the child.
pub struct WorkerSpawnConfig {
    /// Value for [`TRANSPORT_ENV`].
    pub transport_env: String,
}

/// Extension point for different worker spawn strategies.
///
/// Spawned children must have stdout and stderr piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns a fixed command line.
pub struct CommandSpawner {
    command: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::EmptyCommand)?;
        let child = Command::new(program)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env(TRANSPORT_ENV, &config.transport_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub struct RunnerConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub setup_timeout: Option<Duration>,
    /// How long a cancelled prediction gets to acknowledge before the worker is killed.
    pub cancel_grace: Duration,
    /// How long a terminal event waits for the output streams to drain.
    pub drain_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl RunnerConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self::with_spawner(Arc::new(CommandSpawner::new(command)))
    }

    pub fn with_spawner(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            setup_timeout: None,
            cancel_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_setup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// What a running prediction produced, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Started,
    Log(String),
    OutputAppend(serde_json::Value),
    OutputFinal(serde_json::Value),
    /// Finished with everything already streamed.
    Done,
    Error {
        message: String,
        traceback: Option<String>,
    },
    CancelAck,
}

impl RunnerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OutputFinal(_) | Self::Done | Self::Error { .. } | Self::CancelAck
        )
    }
}

/// Output of the reader tasks.
#[derive(Debug)]
enum Raw {
    Message(WorkerMessage),
    Line { source: LogSource, line: String },
    Drained { source: LogSource, id: String },
    StreamClosed(LogSource),
    SocketClosed,
}

struct WorkerProcess {
    child: Child,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<WorkerRequest>>,
    events: mpsc::UnboundedReceiver<Raw>,
    tasks: Vec<JoinHandle<()>>,
    socket_open: bool,
    stdout_open: bool,
    stderr_open: bool,
}

impl WorkerProcess {
    fn stream_closed(&mut self, source: LogSource) {
        match source {
            LogSource::Stdout => self.stdout_open = false,
            LogSource::Stderr => self.stderr_open = false,
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The prediction currently bound to the worker.
struct Bound {
    id: String,
    cancel_requested: bool,
    held: Option<RunnerEvent>,
    hold_deadline: Option<Instant>,
    stdout_drained: bool,
    stderr_drained: bool,
}

impl Bound {
    fn drained(&self, source: LogSource) -> bool {
        match source {
            LogSource::Stdout => self.stdout_drained,
            LogSource::Stderr => self.stderr_drained,
        }
    }

    fn mark_drained(&mut self, source: LogSource) {
        match source {
            LogSource::Stdout => self.stdout_drained = true,
            LogSource::Stderr => self.stderr_drained = true,
        }
    }

    fn hold(&mut self, event: RunnerEvent, drain_timeout: Duration) {
        if self.held.is_none() {
            self.held = Some(event);
            self.hold_deadline = Some(Instant::now() + drain_timeout);
        }
    }

    fn ready_to_release(&self) -> bool {
        self.held.is_some() && self.stdout_drained && self.stderr_drained
    }
}

enum Next {
    Raw(Option<Raw>),
    DrainTimeout,
}

/// Owner of the single worker subprocess.
pub struct Runner {
    config: RunnerConfig,
    state: RunnerState,
    process: Option<WorkerProcess>,
    current: Option<Bound>,
    schema: Option<serde_json::Value>,
    setup: Option<SetupResult>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            state: RunnerState::Spawning,
            process: None,
            current: None,
            schema: None,
            setup: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.accepts_predictions()
    }

    /// OpenAPI schema reported by the worker at setup.
    pub fn schema(&self) -> Option<&serde_json::Value> {
        self.schema.as_ref()
    }

    pub fn setup_result(&self) -> Option<&SetupResult> {
        self.setup.as_ref()
    }

    /// Spawn the worker and wait for its setup to finish.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        self.state = RunnerState::Spawning;
        let result = self.spawn_and_setup().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Worker setup failed");
            if let Some(setup) = self.setup.take() {
                self.setup = Some(setup.failed());
            }
            self.kill().await;
        }
        result
    }

    async fn spawn_and_setup(&mut self) -> Result<(), RunnerError> {
        let (listener, child_info) = WorkerListener::bind().map_err(RunnerError::Transport)?;
        let transport_env = child_info.to_env_value().map_err(RunnerError::Transport)?;

        tracing::info!("Spawning worker subprocess");
        let mut child = self
            .config
            .spawner
            .spawn(&WorkerSpawnConfig { transport_env })?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        self.state = RunnerState::SettingUp;
        self.setup = Some(SetupResult::starting());
        let deadline = PredictionDeadline::new(self.config.setup_timeout);

        let (tx, events) = mpsc::unbounded_channel();
        let mut tasks = vec![
            tokio::spawn(read_lines(stdout, LogSource::Stdout, tx.clone())),
            tokio::spawn(read_lines(stderr, LogSource::Stderr, tx.clone())),
        ];

        tracing::debug!("Waiting for worker to connect");
        let stream = tokio::select! {
            accepted = listener.accept() => accepted.map_err(RunnerError::Transport)?,
            status = child.wait() => {
                let status = status.map_or_else(|e| e.to_string(), |s| s.to_string());
                return Err(RunnerError::ExitedDuringSetup(status));
            }
            _ = deadline.expired() => {
                return Err(RunnerError::SetupTimeout(self.config.setup_timeout.unwrap_or_default()));
            }
        };
        drop(listener);

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, JsonCodec::<WorkerMessage>::new());
        tasks.push(tokio::spawn(read_messages(reader, tx)));

        self.process = Some(WorkerProcess {
            child,
            writer: FramedWrite::new(write_half, JsonCodec::new()),
            events,
            tasks,
            socket_open: true,
            stdout_open: true,
            stderr_open: true,
        });

        tracing::debug!("Waiting for setup to complete");
        let mut finished: Option<Result<(), RunnerError>> = None;
        let mut drain_deadline: Option<Instant> = None;
        let mut stdout_drained = false;
        let mut stderr_drained = false;

        // Setup output is flushed with drain markers too, so it all lands in
        // the setup logs rather than being logged as idle output later.
        while !(finished.is_some() && stdout_drained && stderr_drained) {
            let Some(process) = self.process.as_mut() else {
                return Err(RunnerError::ExitedDuringSetup("process lost".to_string()));
            };
            let raw = tokio::select! {
                raw = process.events.recv() => raw,
                _ = deadline.expired(), if finished.is_none() => {
                    return Err(RunnerError::SetupTimeout(self.config.setup_timeout.unwrap_or_default()));
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() => break,
            };

            match raw {
                Some(Raw::Message(WorkerMessage::SetupComplete { schema })) => {
                    self.schema = schema;
                    finished = Some(Ok(()));
                    drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                }
                Some(Raw::Message(WorkerMessage::SetupFailed { error })) => {
                    finished = Some(Err(RunnerError::SetupFailed(error)));
                    drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                }
                Some(Raw::Message(WorkerMessage::WorkerLog {
                    target,
                    level,
                    message,
                })) => emit_worker_log(&target, &level, &message),
                Some(Raw::Message(WorkerMessage::Log { data, .. })) => {
                    for line in data.lines() {
                        self.record_setup_line(line);
                    }
                }
                Some(Raw::Message(other)) => {
                    tracing::warn!(?other, "Unexpected message during setup");
                }
                Some(Raw::Line { line, .. }) => self.record_setup_line(&line),
                Some(Raw::Drained { source, id }) => {
                    if id == SETUP_DRAIN_ID {
                        match source {
                            LogSource::Stdout => stdout_drained = true,
                            LogSource::Stderr => stderr_drained = true,
                        }
                    }
                }
                Some(Raw::StreamClosed(source)) => {
                    process.stream_closed(source);
                    match source {
                        LogSource::Stdout => stdout_drained = true,
                        LogSource::Stderr => stderr_drained = true,
                    }
                }
                Some(Raw::SocketClosed) | None if finished.is_some() => {
                    process.socket_open = false;
                    if !(process.stdout_open || process.stderr_open) {
                        break;
                    }
                }
                Some(Raw::SocketClosed) | None => {
                    let status = match process.child.wait().await {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(RunnerError::ExitedDuringSetup(status));
                }
            }
        }

        match finished {
            Some(Ok(())) => {
                if let Some(setup) = self.setup.take() {
                    self.setup = Some(setup.succeeded());
                }
                self.state = RunnerState::Ready;
                tracing::info!("Worker ready");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(RunnerError::ExitedDuringSetup("no setup result".to_string())),
        }
    }

    fn record_setup_line(&mut self, line: &str) {
        tracing::info!(target: "coglet::setup", "{}", line);
        if let Some(setup) = self.setup.as_mut() {
            setup.append_log(line);
        }
    }

    /// Restart the worker if it died since its last prediction. Returns
    /// whether a new worker was started; fails only if its setup fails.
    pub async fn ensure_ready(&mut self) -> Result<bool, RunnerError> {
        self.drain_idle();
        match self.state {
            RunnerState::Ready => Ok(false),
            RunnerState::Defunct | RunnerState::Spawning => {
                tracing::warn!("Restarting worker");
                self.kill().await;
                self.start().await.map(|()| true)
            }
            state => Err(RunnerError::NotReady(state)),
        }
    }

    /// Log whatever arrived while no prediction was bound.
    fn drain_idle(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        while let Ok(raw) = process.events.try_recv() {
            match raw {
                Raw::Message(WorkerMessage::WorkerLog {
                    target,
                    level,
                    message,
                }) => emit_worker_log(&target, &level, &message),
                Raw::Message(WorkerMessage::Log { source, data }) => {
                    emit_idle_line(source, &data);
                }
                Raw::Message(other) => tracing::debug!(?other, "Dropping stale worker message"),
                Raw::Line { source, line } => emit_idle_line(source, &line),
                Raw::Drained { .. } => {}
                Raw::StreamClosed(source) => process.stream_closed(source),
                Raw::SocketClosed => process.socket_open = false,
            }
        }
        if let Ok(Some(status)) = process.child.try_wait() {
            tracing::debug!(%status, "Worker process exited");
            process.socket_open = false;
        }
        if !process.socket_open && self.state == RunnerState::Ready {
            tracing::error!("Worker exited while idle");
            self.state = RunnerState::Defunct;
        }
    }

    /// Bind a prediction and send it to the worker.
    pub async fn predict(
        &mut self,
        id: &str,
        input: serde_json::Value,
    ) -> Result<(), RunnerError> {
        self.drain_idle();
        if !self.is_ready() {
            return Err(RunnerError::NotReady(self.state));
        }
        let Some(process) = self.process.as_mut() else {
            return Err(RunnerError::NotReady(self.state));
        };

        let request = WorkerRequest::Predict {
            id: id.to_string(),
            input,
        };
        if let Err(e) = process.writer.send(request).await {
            self.state = RunnerState::Defunct;
            return Err(RunnerError::Send(e));
        }

        self.current = Some(Bound {
            id: id.to_string(),
            cancel_requested: false,
            held: None,
            hold_deadline: None,
            stdout_drained: !process.stdout_open,
            stderr_drained: !process.stderr_open,
        });
        self.state = RunnerState::Busy;
        Ok(())
    }

    /// Next event of the bound prediction; `None` once its terminal event
    /// has been returned.
    ///
    /// Cancel safe: nothing is lost when the returned future is dropped.
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        loop {
            let bound = self.current.as_mut()?;
            if bound.ready_to_release() {
                return self.release();
            }

            let Some(process) = self.process.as_mut() else {
                bound.hold(crash_event(bound.cancel_requested), Duration::ZERO);
                return self.release();
            };

            let next = match bound.hold_deadline {
                Some(deadline) => tokio::select! {
                    raw = process.events.recv() => Next::Raw(raw),
                    _ = tokio::time::sleep_until(deadline) => Next::DrainTimeout,
                },
                None => Next::Raw(process.events.recv().await),
            };

            let raw = match next {
                Next::DrainTimeout => {
                    tracing::debug!(prediction_id = %bound.id, "Output drain timed out");
                    return self.release();
                }
                Next::Raw(Some(raw)) => raw,
                Next::Raw(None) => Raw::SocketClosed,
            };

            if let Some(event) = self.apply(raw) {
                return Some(event);
            }
        }
    }

    /// Fold one raw item into the bound prediction. Returns an event to surface.
    fn apply(&mut self, raw: Raw) -> Option<RunnerEvent> {
        let drain_timeout = self.config.drain_timeout;
        let bound = self.current.as_mut()?;
        let process = self.process.as_mut()?;

        match raw {
            Raw::Message(message) => {
                if let WorkerMessage::WorkerLog {
                    target,
                    level,
                    message,
                } = &message
                {
                    emit_worker_log(target, level, message);
                    return None;
                }
                if let WorkerMessage::Log { source, data } = message {
                    if bound.drained(source) {
                        emit_idle_line(source, &data);
                        return None;
                    }
                    return Some(RunnerEvent::Log(data.trim_end_matches('\n').to_string()));
                }

                let id = match &message {
                    WorkerMessage::PredictionStarted { id }
                    | WorkerMessage::OutputValue { id, .. }
                    | WorkerMessage::OutputDone { id, .. }
                    | WorkerMessage::PredictionError { id, .. }
                    | WorkerMessage::CancelAck { id } => id.as_str(),
                    other => {
                        tracing::warn!(?other, "Unexpected message during prediction");
                        return None;
                    }
                };
                if id != bound.id {
                    tracing::debug!(prediction_id = %id, "Dropping message for stale prediction");
                    return None;
                }

                match message {
                    WorkerMessage::PredictionStarted { .. } => Some(RunnerEvent::Started),
                    WorkerMessage::OutputValue { output, .. } => {
                        Some(RunnerEvent::OutputAppend(output))
                    }
                    WorkerMessage::OutputDone { output, .. } => {
                        let event = output.map_or(RunnerEvent::Done, RunnerEvent::OutputFinal);
                        bound.hold(event, drain_timeout);
                        None
                    }
                    WorkerMessage::PredictionError {
                        error, traceback, ..
                    } => {
                        bound.hold(
                            RunnerEvent::Error {
                                message: error,
                                traceback,
                            },
                            drain_timeout,
                        );
                        None
                    }
                    WorkerMessage::CancelAck { .. } => {
                        bound.hold(RunnerEvent::CancelAck, drain_timeout);
                        None
                    }
                    _ => None,
                }
            }
            Raw::Line { source, line } => {
                if bound.drained(source) {
                    emit_idle_line(source, &line);
                    None
                } else {
                    Some(RunnerEvent::Log(line))
                }
            }
            Raw::Drained { source, id } => {
                if id == bound.id {
                    bound.mark_drained(source);
                }
                None
            }
            Raw::StreamClosed(source) => {
                process.stream_closed(source);
                bound.mark_drained(source);
                None
            }
            Raw::SocketClosed => {
                if process.socket_open {
                    tracing::error!(prediction_id = %bound.id, "Worker exited during prediction");
                }
                process.socket_open = false;
                bound.hold(crash_event(bound.cancel_requested), drain_timeout);
                None
            }
        }
    }

    fn release(&mut self) -> Option<RunnerEvent> {
        let bound = self.current.take()?;
        let alive = self.process.as_ref().is_some_and(|p| p.socket_open);
        self.state = if alive {
            RunnerState::Ready
        } else {
            RunnerState::Defunct
        };
        bound.held
    }

    /// Cancel the bound prediction and wait for it to stop.
    ///
    /// The worker gets `cancel_grace` to acknowledge; after that it is killed
    /// and will be restarted before the next prediction. Returns the
    /// prediction's terminal event (synthesized `CancelAck` after a kill).
    pub async fn cancel(&mut self) -> RunnerEvent {
        let Some(bound) = self.current.as_mut() else {
            return RunnerEvent::CancelAck;
        };
        bound.cancel_requested = true;
        let id = bound.id.clone();

        if let Some(process) = self.process.as_mut()
            && process.socket_open
            && let Err(e) = process
                .writer
                .send(WorkerRequest::Cancel { id: id.clone() })
                .await
        {
            tracing::warn!(prediction_id = %id, error = %e, "Failed to send cancel");
        }

        let grace = self.config.cancel_grace;
        match tokio::time::timeout(grace, self.drain_to_terminal()).await {
            Ok(event) => event,
            Err(_) => {
                tracing::warn!(
                    prediction_id = %id,
                    grace_ms = grace.as_millis(),
                    "Worker did not acknowledge cancel, killing it"
                );
                self.kill().await;
                RunnerEvent::CancelAck
            }
        }
    }

    async fn drain_to_terminal(&mut self) -> RunnerEvent {
        while let Some(event) = self.next_event().await {
            if event.is_terminal() {
                return event;
            }
        }
        RunnerEvent::CancelAck
    }

    async fn kill(&mut self) {
        self.current = None;
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.start_kill() {
                tracing::debug!(error = %e, "Worker already gone");
            }
            let _ = process.child.wait().await;
        }
        self.state = RunnerState::Defunct;
    }

    /// Stop the worker: ask politely, then SIGTERM, then kill.
    pub async fn shutdown(&mut self) {
        self.state = RunnerState::ShuttingDown;
        self.current = None;
        let Some(mut process) = self.process.take() else {
            return;
        };
        let grace = self.config.shutdown_grace;

        if process.socket_open {
            let _ = process.writer.send(WorkerRequest::Shutdown).await;
        }
        if tokio::time::timeout(grace, process.child.wait()).await.is_ok() {
            tracing::info!("Worker exited");
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = process.child.id() {
                tracing::warn!(pid, "Worker ignored shutdown, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                if tokio::time::timeout(grace, process.child.wait()).await.is_ok() {
                    return;
                }
            }
        }

        tracing::warn!("Killing worker");
        let _ = process.child.kill().await;
    }
}

fn crash_event(cancel_requested: bool) -> RunnerEvent {
    if cancel_requested {
        RunnerEvent::CancelAck
    } else {
        RunnerEvent::Error {
            message: CRASH_ERROR.to_string(),
            traceback: None,
        }
    }
}

async fn read_lines<R>(stream: R, source: LogSource, tx: mpsc::UnboundedSender<Raw>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(['\n', '\r']);
                // A marker may trail output that had no newline of its own.
                let (text, marker) = match line.find(DRAIN_MARKER_PREFIX) {
                    Some(at) => (&line[..at], parse_drain_marker(&line[at..])),
                    None => (line, None),
                };
                let mut raws = Vec::with_capacity(2);
                if marker.is_none() || !text.is_empty() {
                    raws.push(Raw::Line {
                        source,
                        line: text.to_string(),
                    });
                }
                if let Some(id) = marker {
                    raws.push(Raw::Drained {
                        source,
                        id: id.to_string(),
                    });
                }
                for raw in raws {
                    if tx.send(raw).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(source = source.as_str(), error = %e, "Worker output read error");
                break;
            }
        }
    }
    let _ = tx.send(Raw::StreamClosed(source));
}

async fn read_messages<R>(
    mut reader: FramedRead<R, JsonCodec<WorkerMessage>>,
    tx: mpsc::UnboundedSender<Raw>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(message) => {
                if tx.send(Raw::Message(message)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker socket error");
                break;
            }
        }
    }
    let _ = tx.send(Raw::SocketClosed);
}

fn emit_idle_line(source: LogSource, line: &str) {
    for line in line.lines() {
        tracing::info!(target: "coglet::worker", source = source.as_str(), "{}", line);
    }
}

/// Re-emit a worker-side tracing event under the `coglet::worker` target.
fn emit_worker_log(target: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "coglet::worker", worker_target = target, "{}", message),
        "warn" => tracing::warn!(target: "coglet::worker", worker_target = target, "{}", message),
        "debug" => tracing::debug!(target: "coglet::worker", worker_target = target, "{}", message),
        "trace" => tracing::trace!(target: "coglet::worker", worker_target = target, "{}", message),
        _ => tracing::info!(target: "coglet::worker", worker_target = target, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RunnerConfig::new(vec!["worker".to_string()]);
        assert_eq!(config.setup_timeout, None);
        assert_eq!(config.cancel_grace, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_builder_pattern() {
        let config = RunnerConfig::new(vec!["worker".to_string()])
            .with_setup_timeout(Some(Duration::from_secs(60)))
            .with_cancel_grace(Duration::from_millis(200))
            .with_drain_timeout(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_secs(1));
        assert_eq!(config.setup_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.cancel_grace, Duration::from_millis(200));
        assert_eq!(config.drain_timeout, Duration::from_millis(50));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn terminal_events() {
        assert!(RunnerEvent::Done.is_terminal());
        assert!(RunnerEvent::CancelAck.is_terminal());
        assert!(RunnerEvent::OutputFinal(serde_json::json!(1)).is_terminal());
        assert!(
            RunnerEvent::Error {
                message: "x".into(),
                traceback: None
            }
            .is_terminal()
        );
        assert!(!RunnerEvent::Started.is_terminal());
        assert!(!RunnerEvent::Log("x".into()).is_terminal());
        assert!(!RunnerEvent::OutputAppend(serde_json::json!(1)).is_terminal());
    }

    #[test]
    fn crash_event_depends_on_cancel() {
        assert_eq!(crash_event(true), RunnerEvent::CancelAck);
        assert_eq!(
            crash_event(false),
            RunnerEvent::Error {
                message: CRASH_ERROR.to_string(),
                traceback: None
            }
        );
    }

    #[test]
    fn setup_errors_are_fatal() {
        assert!(RunnerError::SetupFailed("boom".into()).is_fatal());
        assert!(RunnerError::ExitedDuringSetup("exit status: 1".into()).is_fatal());
        assert!(RunnerError::SetupTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!RunnerError::NotReady(RunnerState::Busy).is_fatal());
    }

    #[tokio::test]
    async fn empty_command_fails_to_spawn() {
        let mut runner = Runner::new(RunnerConfig::new(Vec::new()));
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(SpawnError::EmptyCommand)));
        assert!(err.is_fatal());
        assert_eq!(runner.state(), RunnerState::Defunct);
    }

    #[tokio::test]
    async fn process_exiting_before_setup_is_fatal() {
        let mut runner = Runner::new(
            RunnerConfig::new(vec!["sh".into(), "-c".into(), "echo loading; exit 3".into()])
                .with_setup_timeout(Some(Duration::from_secs(10))),
        );
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::ExitedDuringSetup(_)), "{err}");
        assert!(!runner.is_ready());
    }

    #[tokio::test]
    async fn setup_timeout_is_enforced() {
        let mut runner = Runner::new(
            RunnerConfig::new(vec!["sleep".into(), "30".into()])
                .with_setup_timeout(Some(Duration::from_millis(200))),
        );
        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::SetupTimeout(_)), "{err}");
    }

    #[tokio::test]
    async fn predict_requires_ready_runner() {
        let mut runner = Runner::new(RunnerConfig::new(vec!["true".into()]));
        let err = runner
            .predict("p1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotReady(RunnerState::Spawning)));
        assert!(runner.next_event().await.is_none());
    }
}
