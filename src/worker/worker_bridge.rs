//! Caller-side handle to the worker thread.
//!
//! `MonitorBackend` is `Sync`: a capture loop can submit frames and poll
//! results while a UI thread asks questions through the same `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{info, warn};

use super::handoff::{Shared, WorkerPhase};
use super::messages::{Answer, InteractiveRequest, MonitorResult};
use super::worker_main::{run_worker, WorkerSetup};
use crate::config::{BackendConfig, UseCaseDefinition};
use crate::engine::InferenceEngine;
use crate::error::{AskError, BackendError, EngineError};
use crate::frame::Frame;
use crate::session;

pub struct MonitorBackend {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Disconnects when the worker thread returns.
    done_rx: Receiver<()>,
    use_case_name: String,
    ask_timeout: Duration,
    shutdown_grace: Duration,
}

/// Clears the in-flight marker however `ask` returns.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MonitorBackend {
    /// Spawn the worker. Returns immediately; the session is established in
    /// the background, watch [`is_ready`](Self::is_ready) or
    /// [`phase`](Self::phase).
    pub fn start(
        engine: impl InferenceEngine,
        use_case: UseCaseDefinition,
        config: BackendConfig,
    ) -> Result<Self, BackendError> {
        let shared = Arc::new(Shared::new());
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let use_case_name = use_case.name.clone();
        let ask_timeout = config.ask_timeout();
        let shutdown_grace = config.shutdown_grace();

        let setup = WorkerSetup {
            engine: Box::new(engine),
            use_case,
            config,
            shared: shared.clone(),
            done: done_tx,
        };
        let handle = thread::Builder::new()
            .name("vlm-worker".to_string())
            .spawn(move || run_worker(setup))?;
        info!("[BACKEND] Worker spawned (use case: {use_case_name})");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            done_rx,
            use_case_name,
            ask_timeout,
            shutdown_grace,
        })
    }

    /// Check a device without starting a worker.
    pub fn diagnose_device(engine: &mut dyn InferenceEngine) -> Result<Vec<String>, EngineError> {
        session::diagnose(engine)
    }

    pub fn use_case(&self) -> &str {
        &self.use_case_name
    }

    /// Replace the pending frame. Never blocks on inference.
    pub fn submit_frame(&self, frame: Frame) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.slots().pending_frame = Some(frame);
        self.shared.wake();
    }

    /// Take the latest monitor result, if one arrived since the last poll.
    pub fn poll_result(&self) -> Option<MonitorResult> {
        self.shared.slots().result.take()
    }

    /// Stop monitor dispatch. Questions are still answered.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("[BACKEND] Monitoring paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("[BACKEND] Monitoring resumed");
            self.shared.wake();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Ask a question about `frame` and wait for the answer.
    pub fn ask(&self, frame: Frame, question: &str) -> Result<Answer, AskError> {
        self.submit_question(frame, question, None)
    }

    /// Like [`ask`](Self::ask), also forwarding each token to `tokens` as it
    /// is generated.
    pub fn ask_streaming(
        &self,
        frame: Frame,
        question: &str,
        tokens: Sender<String>,
    ) -> Result<Answer, AskError> {
        self.submit_question(frame, question, Some(tokens))
    }

    fn submit_question(
        &self,
        frame: Frame,
        question: &str,
        tokens: Option<Sender<String>>,
    ) -> Result<Answer, AskError> {
        if !self.is_ready() || !self.shared.running.load(Ordering::SeqCst) {
            return Err(AskError::NotReady);
        }
        if self
            .shared
            .ask_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AskError::Busy);
        }
        let _in_flight = InFlight(&self.shared.ask_in_flight);

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.shared.slots().interactive = Some(InteractiveRequest {
            frame,
            question: question.to_string(),
            reply: reply_tx,
            cancelled: cancelled.clone(),
            tokens,
        });
        self.shared.wake();

        match reply_rx.recv_timeout(self.ask_timeout) {
            Ok(answer) => Ok(answer),
            Err(RecvTimeoutError::Timeout) => {
                if cancelled
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    warn!(
                        "[BACKEND] No answer within {:?}, aborting request",
                        self.ask_timeout
                    );
                    self.shared.abort_requested.store(true, Ordering::SeqCst);
                    Err(AskError::Timeout(self.ask_timeout))
                } else {
                    // The worker claimed the request first; its answer is on the way.
                    reply_rx.recv().map_err(|_| AskError::WorkerGone)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(AskError::WorkerGone),
        }
    }

    /// Best-effort cancel of whatever is generating right now.
    pub fn abort_current(&self) {
        self.shared.abort_requested.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    /// Model loaded and monitor generator created.
    pub fn is_ready(&self) -> bool {
        self.shared.phase() == WorkerPhase::Ready
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.phase()
    }

    /// Completion time of the most recent monitor or interactive dispatch.
    pub fn last_dispatch(&self) -> Option<Instant> {
        self.shared.last_dispatch()
    }

    /// Stop the worker, waiting at most the configured grace period. A worker
    /// stuck inside the engine is detached rather than joined. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[BACKEND] Shutting down");
        self.shared.abort_requested.store(true, Ordering::SeqCst);
        self.shared.wake();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match self.done_rx.recv_timeout(self.shutdown_grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[BACKEND] Worker did not stop within {:?}, detaching",
                    self.shutdown_grace
                );
            }
            _ => {
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        warn!("[BACKEND] Worker thread panicked");
                    }
                }
                info!("[BACKEND] Worker stopped");
            }
        }
    }
}

impl Drop for MonitorBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
