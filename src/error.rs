//! Error types shared across the crate.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the inference engine capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no inference device found")]
    NoDevice,
    #[error("device error: {0}")]
    Device(String),
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("failed to create generation context: {0}")]
    Context(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("token read failed: {0}")]
    Read(String),
    #[error("no generation context is active")]
    NoContext,
}

/// Terminal failures of the worker: once one of these is hit the backend
/// never becomes ready.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("session establishment exhausted after {attempts} attempts: {last}")]
    SessionExhausted { attempts: u32, last: String },
    #[error("startup interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors surfaced to a caller of `ask`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AskError {
    #[error("device not ready")]
    NotReady,
    #[error("an interactive request is already in flight")]
    Busy,
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("worker stopped before answering")]
    WorkerGone,
}

/// Problems with the prompt / backend configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("use case not found: {0}")]
    UnknownUseCase(String),
    #[error("prompt file defines no use cases")]
    NoUseCases,
}

/// A captured frame that cannot be turned into model input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("frame has zero width or height")]
    Empty,
}
