//! IPC bridge between the runner and the worker subprocess.
//!
//! - **protocol**: Message types (WorkerRequest, WorkerMessage) and drain markers
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket the two sides talk over

pub mod codec;
pub mod protocol;
pub mod transport;
