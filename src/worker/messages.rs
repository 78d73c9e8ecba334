//! Values exchanged between the capture/UI side and the worker thread.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::classifier::raw_preview;
use crate::frame::Frame;

/// How a monitor cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Output was classified into a label.
    Classified,
    /// A token read stalled; partial output was discarded.
    Timeout,
    /// Aborted via `abort_current` or shutdown.
    Aborted,
    /// Engine failure; the generator was recreated.
    Error,
    /// No generator could be created, the frame was not processed.
    Skipped,
}

/// Latest monitor outcome. The result slot holds at most one; an unread
/// result is replaced by the next.
#[derive(Debug, Clone)]
pub struct MonitorResult {
    pub frame: Frame,
    pub label: String,
    pub raw_text: String,
    pub elapsed: Duration,
    pub kind: ResultKind,
}

impl MonitorResult {
    /// Label with a preview of the raw model text, for operator display.
    pub fn display_label(&self) -> String {
        if self.raw_text.is_empty() {
            self.label.clone()
        } else {
            format!("{} [raw: {}]", self.label, raw_preview(&self.raw_text))
        }
    }

    pub fn elapsed_str(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    Answered,
    /// The model produced nothing.
    Empty,
    Aborted,
    /// A token read stalled.
    Timeout,
    Error,
}

/// Reply to an interactive question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub elapsed: Duration,
    pub kind: AnswerKind,
}

impl Answer {
    pub fn elapsed_str(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

/// `1.23s`
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// One pending question. Lives in the interactive slot until the worker takes
/// it.
pub(crate) struct InteractiveRequest {
    pub frame: Frame,
    pub question: String,
    /// Bounded(1) reply channel; the asker may have stopped listening.
    pub reply: Sender<Answer>,
    /// Set by whichever side resolves the request first (answer delivered or
    /// deadline passed).
    pub cancelled: Arc<AtomicBool>,
    pub tokens: Option<Sender<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(1234)), "1.23s");
        assert_eq!(format_elapsed(Duration::ZERO), "0.00s");
    }

    #[test]
    fn test_display_label_includes_raw_preview() {
        let result = MonitorResult {
            frame: Frame::solid_bgr(1, 1, [0, 0, 0]),
            label: "pickup".to_string(),
            raw_text: "someone grabbing a can".to_string(),
            elapsed: Duration::from_millis(500),
            kind: ResultKind::Classified,
        };
        assert_eq!(result.display_label(), "pickup [raw: someone grabbing a can]");
        assert_eq!(result.elapsed_str(), "0.50s");
    }
}
