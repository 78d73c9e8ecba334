//! Single-owner inference worker and its caller-side handle.

mod handoff;
mod messages;
mod worker_bridge;
mod worker_main;

pub use handoff::WorkerPhase;
pub use messages::{format_elapsed, Answer, AnswerKind, MonitorResult, ResultKind};
pub use worker_bridge::MonitorBackend;
