//! Orchestration for a vision-language model running on a single-generator
//! accelerator: periodic frame classification plus on-demand questions, all
//! funnelled through one worker thread that owns the device.

pub mod classifier;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logger;
pub mod session;
pub mod stream;
pub mod worker;

pub use classifier::{classify, Classification, NO_EVENT_LABEL};
pub use config::{BackendConfig, PromptConfig, UseCaseDefinition};
pub use error::{AskError, BackendError, ConfigError, EngineError, FrameError};
pub use frame::{Frame, PixelFormat};
pub use worker::{Answer, AnswerKind, MonitorBackend, MonitorResult, ResultKind, WorkerPhase};
