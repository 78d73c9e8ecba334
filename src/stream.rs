//! Draining a single generation's token stream.
//!
//! Reads are individually bounded by a short timeout so a stalled device is
//! detected quickly instead of hanging the worker. Every early exit (abort,
//! cancel, stall, token budget) issues a best-effort abort on the stream and
//! returns whatever text was produced so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::debug;

use crate::engine::{StreamRead, TokenStream};
use crate::error::EngineError;

/// Why reading stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The engine reported the generation as complete.
    Finished,
    /// The end-of-sequence marker was produced.
    EndOfSequence,
    /// Worker-wide abort (or shutdown) was requested.
    Aborted,
    /// The request's own cancellation flag was set.
    Cancelled,
    /// A single read exceeded the per-read timeout.
    ReadTimeout,
    /// `max_tokens` were read.
    TokenBudget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Output with end-of-sequence markers removed and whitespace trimmed.
    pub text: String,
    pub tokens: u32,
    pub stop: StopReason,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadLimits<'a> {
    pub max_tokens: u32,
    pub read_timeout: Duration,
    pub eos_marker: &'a str,
}

/// Flags polled between reads.
#[derive(Debug, Clone, Copy)]
pub struct CancelSignals<'a> {
    pub abort: &'a AtomicBool,
    pub running: &'a AtomicBool,
    pub request: Option<&'a AtomicBool>,
}

impl CancelSignals<'_> {
    fn check(&self) -> Option<StopReason> {
        if self.abort.load(Ordering::SeqCst) || !self.running.load(Ordering::SeqCst) {
            return Some(StopReason::Aborted);
        }
        if self.request.is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Some(StopReason::Cancelled);
        }
        None
    }
}

/// Read tokens until the stream ends or a limit is hit.
///
/// `observer` receives each token as it arrives (the end-of-sequence marker is
/// never forwarded). Engine read failures are returned as errors after the
/// stream has been aborted; the caller owns recovery.
pub fn read_all_tokens(
    stream: &mut dyn TokenStream,
    limits: &ReadLimits<'_>,
    signals: &CancelSignals<'_>,
    observer: Option<&Sender<String>>,
) -> Result<ReadOutcome, EngineError> {
    let mut raw = String::new();
    let mut tokens = 0u32;

    let stop = loop {
        if !stream.is_generating() {
            break StopReason::Finished;
        }
        if let Some(reason) = signals.check() {
            abort_quietly(stream);
            break reason;
        }

        match stream.read(limits.read_timeout) {
            Ok(StreamRead::Token(token)) => {
                tokens += 1;
                let is_eos = !limits.eos_marker.is_empty() && token.contains(limits.eos_marker);
                if let Some(tx) = observer {
                    let visible = strip_marker(&token, limits.eos_marker);
                    // A full or dropped observer loses the token; the worker never blocks on it.
                    if !visible.is_empty() {
                        let _ = tx.try_send(visible);
                    }
                }
                raw.push_str(&token);
                if is_eos {
                    break StopReason::EndOfSequence;
                }
                if tokens >= limits.max_tokens {
                    abort_quietly(stream);
                    break StopReason::TokenBudget;
                }
            }
            Ok(StreamRead::Timeout) => {
                debug!("[READER] No token within {:?}, aborting", limits.read_timeout);
                abort_quietly(stream);
                break StopReason::ReadTimeout;
            }
            Ok(StreamRead::EndOfStream) => break StopReason::Finished,
            Err(e) => {
                abort_quietly(stream);
                return Err(e);
            }
        }
    };

    Ok(ReadOutcome {
        text: strip_marker(&raw, limits.eos_marker).trim().to_string(),
        tokens,
        stop,
    })
}

fn strip_marker(text: &str, marker: &str) -> String {
    if marker.is_empty() {
        text.to_string()
    } else {
        text.replace(marker, "")
    }
}

fn abort_quietly(stream: &mut dyn TokenStream) {
    if let Err(e) = stream.abort() {
        debug!("[READER] Abort failed (ignored): {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    const EOS: &str = "<|im_end|>";

    struct ScriptedStream {
        reads: VecDeque<Result<StreamRead, EngineError>>,
        aborts: usize,
    }

    impl ScriptedStream {
        fn tokens(tokens: &[&str]) -> Self {
            Self {
                reads: tokens
                    .iter()
                    .map(|t| Ok(StreamRead::Token(t.to_string())))
                    .collect(),
                aborts: 0,
            }
        }

        fn then(mut self, read: Result<StreamRead, EngineError>) -> Self {
            self.reads.push_back(read);
            self
        }
    }

    impl TokenStream for ScriptedStream {
        fn is_generating(&self) -> bool {
            self.aborts == 0
        }

        fn read(&mut self, _timeout: Duration) -> Result<StreamRead, EngineError> {
            self.reads.pop_front().unwrap_or(Ok(StreamRead::EndOfStream))
        }

        fn abort(&mut self) -> Result<(), EngineError> {
            self.aborts += 1;
            Ok(())
        }
    }

    fn limits(max_tokens: u32) -> ReadLimits<'static> {
        ReadLimits {
            max_tokens,
            read_timeout: Duration::from_millis(10),
            eos_marker: EOS,
        }
    }

    fn run(
        stream: &mut ScriptedStream,
        max_tokens: u32,
        abort: bool,
        cancel: bool,
    ) -> Result<ReadOutcome, EngineError> {
        let abort = AtomicBool::new(abort);
        let running = AtomicBool::new(true);
        let cancel = AtomicBool::new(cancel);
        let signals = CancelSignals {
            abort: &abort,
            running: &running,
            request: Some(&cancel),
        };
        read_all_tokens(stream, &limits(max_tokens), &signals, None)
    }

    #[test]
    fn test_stops_at_eos_and_strips_it() {
        let mut stream = ScriptedStream::tokens(&[" pickup", " now ", EOS, "ignored"]);
        let out = run(&mut stream, 40, false, false).unwrap();
        assert_eq!(out.text, "pickup now");
        assert_eq!(out.stop, StopReason::EndOfSequence);
        assert_eq!(stream.aborts, 0);
    }

    #[test]
    fn test_end_of_stream_finishes() {
        let mut stream = ScriptedStream::tokens(&["browsing"]);
        let out = run(&mut stream, 40, false, false).unwrap();
        assert_eq!(out.text, "browsing");
        assert_eq!(out.stop, StopReason::Finished);
    }

    #[test]
    fn test_token_budget_aborts() {
        let mut stream = ScriptedStream::tokens(&["a ", "b ", "c ", "d "]);
        let out = run(&mut stream, 2, false, false).unwrap();
        assert_eq!(out.text, "a b");
        assert_eq!(out.tokens, 2);
        assert_eq!(out.stop, StopReason::TokenBudget);
        assert_eq!(stream.aborts, 1);
    }

    #[test]
    fn test_read_timeout_returns_partial_text() {
        let mut stream = ScriptedStream::tokens(&["someone "]).then(Ok(StreamRead::Timeout));
        let out = run(&mut stream, 40, false, false).unwrap();
        assert_eq!(out.text, "someone");
        assert_eq!(out.stop, StopReason::ReadTimeout);
        assert_eq!(stream.aborts, 1);
    }

    #[test]
    fn test_abort_flag_stops_before_reading() {
        let mut stream = ScriptedStream::tokens(&["x"]);
        let out = run(&mut stream, 40, true, false).unwrap();
        assert_eq!(out.text, "");
        assert_eq!(out.stop, StopReason::Aborted);
        assert_eq!(stream.aborts, 1);
    }

    #[test]
    fn test_request_cancel_is_reported_separately() {
        let mut stream = ScriptedStream::tokens(&["x"]);
        let out = run(&mut stream, 40, false, true).unwrap();
        assert_eq!(out.stop, StopReason::Cancelled);
    }

    #[test]
    fn test_read_error_propagates_after_abort() {
        let mut stream =
            ScriptedStream::tokens(&["a"]).then(Err(EngineError::Read("bus".to_string())));
        let err = run(&mut stream, 40, false, false).unwrap_err();
        assert_eq!(err, EngineError::Read("bus".to_string()));
        assert_eq!(stream.aborts, 1);
    }

    #[test]
    fn test_observer_receives_tokens_without_marker() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut stream = ScriptedStream::tokens(&["It ", "is ", "red.", EOS]);
        let abort = AtomicBool::new(false);
        let running = AtomicBool::new(true);
        let signals = CancelSignals {
            abort: &abort,
            running: &running,
            request: None,
        };
        let out = read_all_tokens(&mut stream, &limits(200), &signals, Some(&tx)).unwrap();
        drop(tx);
        let streamed: Vec<String> = rx.iter().collect();
        assert_eq!(streamed, vec!["It ", "is ", "red."]);
        assert_eq!(out.text, "It is red.");
    }

    #[test]
    fn test_full_observer_does_not_block_reading() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut stream = ScriptedStream::tokens(&["one ", "two ", "three ", "four", EOS]);
        let abort = AtomicBool::new(false);
        let running = AtomicBool::new(true);
        let signals = CancelSignals {
            abort: &abort,
            running: &running,
            request: None,
        };
        let out = read_all_tokens(&mut stream, &limits(200), &signals, Some(&tx)).unwrap();
        assert_eq!(out.text, "one two three four");
        assert_eq!(out.stop, StopReason::EndOfSequence);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["one "]);
    }
}
