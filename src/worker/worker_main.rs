//! The worker thread: sole owner of the engine session, the model and the
//! monitor generator.
//!
//! Each loop turn picks at most one job. A pending question always wins;
//! a pending frame runs only when not paused and the cooldown since the last
//! dispatch has passed. Otherwise the thread sleeps on the wake channel for
//! the poll interval (or the remaining cooldown, if shorter).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use super::handoff::{Shared, WorkerPhase};
use super::messages::{Answer, AnswerKind, InteractiveRequest, MonitorResult, ResultKind};
use crate::classifier::classify;
use crate::config::{BackendConfig, UseCaseDefinition};
use crate::context::ContextManager;
use crate::engine::{build_messages, InferenceEngine};
use crate::error::{BackendError, EngineError};
use crate::frame::{self, Frame};
use crate::session::{self, LoadedModel, RetryPolicy};
use crate::stream::{read_all_tokens, CancelSignals, ReadLimits, StopReason};

/// Everything moved onto the worker thread.
pub(crate) struct WorkerSetup {
    pub engine: Box<dyn InferenceEngine>,
    pub use_case: UseCaseDefinition,
    pub config: BackendConfig,
    pub shared: Arc<Shared>,
    /// Never sent on; dropping it tells the owner the thread is done.
    pub done: Sender<()>,
}

enum Job {
    Interactive(InteractiveRequest),
    Monitor(Frame),
}

enum Next {
    Run(Job),
    Wait(Duration),
}

pub(crate) fn run_worker(setup: WorkerSetup) {
    let WorkerSetup {
        mut engine,
        use_case,
        config,
        shared,
        done,
    } = setup;
    let _done = done;

    info!("[WORKER] Starting (use case: {})", use_case.name);
    match Worker::start(engine.as_mut(), use_case, config, &shared) {
        Ok(mut worker) => {
            shared.set_phase(WorkerPhase::Ready);
            info!("[WORKER] Ready");
            worker.run();
            worker.teardown();
            shared.set_phase(WorkerPhase::Stopped);
        }
        Err(BackendError::Interrupted) => {
            info!("[WORKER] Startup interrupted by shutdown");
            shared.set_phase(WorkerPhase::Stopped);
        }
        Err(e) => {
            error!("[WORKER] FATAL: {e}");
            shared.set_phase(WorkerPhase::Failed);
        }
    }

    // Unblock an asker whose request was never taken.
    drop(shared.slots().interactive.take());
    info!("[WORKER] Exiting");
}

struct Worker<'a> {
    // Declared before `loaded` so the generator is released before the model.
    contexts: ContextManager,
    loaded: LoadedModel,
    use_case: UseCaseDefinition,
    config: BackendConfig,
    shared: &'a Shared,
}

impl<'a> Worker<'a> {
    fn start(
        engine: &mut dyn InferenceEngine,
        use_case: UseCaseDefinition,
        config: BackendConfig,
        shared: &'a Shared,
    ) -> Result<Self, BackendError> {
        let policy = RetryPolicy {
            max_attempts: config.max_retries,
            warmup: Duration::from_millis(config.warmup_ms),
            retry_wait: Duration::from_millis(config.retry_wait_ms),
        };
        let session = session::establish(engine, &policy, &shared.running)?;
        let mut loaded = session::load_model(session, &config.model_path)?;

        let mut contexts = ContextManager::new(&use_case, config.monitor_sampling());
        contexts.create(loaded.model.as_mut())?;
        info!(
            "[WORKER] Monitor generator ready. Cooldown: {}ms",
            config.cooldown_ms
        );

        Ok(Self {
            contexts,
            loaded,
            use_case,
            config,
            shared,
        })
    }

    fn run(&mut self) {
        while self.shared.running.load(Ordering::SeqCst) {
            match self.next_job() {
                Next::Run(Job::Interactive(request)) => self.dispatch_interactive(request),
                Next::Run(Job::Monitor(frame)) => self.dispatch_monitor(frame),
                Next::Wait(wait) => {
                    let _ = self.shared.wake_rx.recv_timeout(wait);
                }
            }
        }
        info!("[WORKER] Loop stopped");
    }

    fn next_job(&self) -> Next {
        let mut slots = self.shared.slots();
        if let Some(request) = slots.interactive.take() {
            return Next::Run(Job::Interactive(request));
        }

        let poll = self.config.poll_interval();
        if slots.pending_frame.is_none() || self.shared.paused.load(Ordering::SeqCst) {
            return Next::Wait(poll);
        }
        let remaining = self.cooldown_remaining();
        if remaining.is_zero() {
            if let Some(frame) = slots.pending_frame.take() {
                return Next::Run(Job::Monitor(frame));
            }
        }
        Next::Wait(poll.min(remaining))
    }

    fn cooldown_remaining(&self) -> Duration {
        match self.shared.last_dispatch() {
            Some(last) => self.config.cooldown().saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn read_limits(&self, max_tokens: u32) -> ReadLimits<'_> {
        ReadLimits {
            max_tokens,
            read_timeout: self.config.read_timeout(),
            eos_marker: &self.config.eos_marker,
        }
    }

    fn clear_quietly(&mut self) {
        if let Err(e) = self.loaded.model.clear_context() {
            debug!("[WORKER] clear_context failed (ignored): {e}");
        }
    }

    fn dispatch_monitor(&mut self, frame: Frame) {
        self.shared.abort_requested.store(false, Ordering::SeqCst);

        if !self.contexts.is_active() {
            if let Err(e) = self.contexts.create(self.loaded.model.as_mut()) {
                warn!("[WORKER] No monitor generator, skipping frame: {e}");
                self.publish(MonitorResult {
                    frame,
                    label: "Monitor unavailable".to_string(),
                    raw_text: String::new(),
                    elapsed: Duration::ZERO,
                    kind: ResultKind::Skipped,
                });
                return;
            }
            info!("[WORKER] Monitor generator recreated");
        }

        let started = Instant::now();
        let (kind, label, raw_text) = self.run_monitor(&frame);
        let elapsed = started.elapsed();
        debug!("[WORKER] Monitor: {label} ({:.2}s)", elapsed.as_secs_f64());

        self.publish(MonitorResult {
            frame,
            label,
            raw_text,
            elapsed,
            kind,
        });
        self.shared.mark_dispatched();
    }

    fn run_monitor(&mut self, frame: &Frame) -> (ResultKind, String, String) {
        let input = frame::prepare(frame, self.loaded.geometry());
        let mut stream = match self.contexts.generate(&input) {
            Ok(stream) => stream,
            Err(e) => return self.recover_monitor(e),
        };

        let shared = self.shared;
        let signals = CancelSignals {
            abort: &shared.abort_requested,
            running: &shared.running,
            request: None,
        };
        let read = read_all_tokens(
            stream.as_mut(),
            &self.read_limits(self.config.max_tokens),
            &signals,
            None,
        );
        drop(stream);

        match read {
            Ok(outcome) => {
                self.clear_quietly();
                match outcome.stop {
                    StopReason::ReadTimeout => {
                        (ResultKind::Timeout, "Inference timeout".to_string(), String::new())
                    }
                    StopReason::Aborted | StopReason::Cancelled => {
                        (ResultKind::Aborted, "Aborted".to_string(), String::new())
                    }
                    _ => {
                        let classification = classify(&outcome.text, &self.use_case);
                        (
                            ResultKind::Classified,
                            classification.label,
                            classification.raw,
                        )
                    }
                }
            }
            Err(e) => self.recover_monitor(e),
        }
    }

    /// After an engine failure the generator is rebuilt; if that also fails
    /// the next cycle retries inline.
    fn recover_monitor(&mut self, e: EngineError) -> (ResultKind, String, String) {
        error!("[WORKER] Monitor generation failed: {e}");
        self.clear_quietly();
        let _ = self.contexts.recreate(self.loaded.model.as_mut());
        (ResultKind::Error, format!("Error: {e}"), String::new())
    }

    fn publish(&self, result: MonitorResult) {
        self.shared.slots().result = Some(result);
    }

    fn dispatch_interactive(&mut self, request: InteractiveRequest) {
        self.shared.abort_requested.store(false, Ordering::SeqCst);
        if request.cancelled.load(Ordering::SeqCst) {
            info!("[WORKER] Interactive request cancelled before start, skipping");
            return;
        }

        info!("[WORKER] Interactive: {}", request.question);
        self.contexts.destroy();

        let started = Instant::now();
        let (kind, text) = self.run_interactive(&request);
        let elapsed = started.elapsed();

        if let Err(e) = self.contexts.create(self.loaded.model.as_mut()) {
            warn!("[WORKER] Monitor generator recreate failed: {e}");
        }

        info!(
            "[WORKER] Interactive done in {:.2}s ({kind:?})",
            elapsed.as_secs_f64()
        );
        // The asker sets the same flag when its deadline passes; whoever
        // swaps it first owns the outcome.
        if request
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = request.reply.try_send(Answer {
                text,
                elapsed,
                kind,
            });
        } else {
            info!("[WORKER] Asker gave up, answer dropped");
        }
        self.shared.mark_dispatched();
    }

    fn run_interactive(&mut self, request: &InteractiveRequest) -> (AnswerKind, String) {
        let input = frame::prepare(&request.frame, self.loaded.geometry());
        let messages = build_messages(&self.config.interactive_system_prompt, &request.question);
        let sampling = self.config.interactive_sampling();

        let mut stream = match self.loaded.model.generate(&sampling, &messages, &input) {
            Ok(stream) => stream,
            Err(e) => {
                error!("[WORKER] Interactive generation failed: {e}");
                self.clear_quietly();
                return (AnswerKind::Error, format!("Error: {e}"));
            }
        };

        let shared = self.shared;
        let signals = CancelSignals {
            abort: &shared.abort_requested,
            running: &shared.running,
            request: Some(&request.cancelled),
        };
        let read = read_all_tokens(
            stream.as_mut(),
            &self.read_limits(self.config.interactive_max_tokens),
            &signals,
            request.tokens.as_ref(),
        );
        drop(stream);
        self.clear_quietly();

        match read {
            Ok(outcome) => match outcome.stop {
                StopReason::ReadTimeout => (AnswerKind::Timeout, "Timeout".to_string()),
                StopReason::Aborted | StopReason::Cancelled if outcome.text.is_empty() => {
                    (AnswerKind::Aborted, "Aborted".to_string())
                }
                StopReason::Aborted | StopReason::Cancelled => (AnswerKind::Aborted, outcome.text),
                _ if outcome.text.is_empty() => (AnswerKind::Empty, "No response".to_string()),
                _ => (AnswerKind::Answered, outcome.text),
            },
            Err(e) => {
                error!("[WORKER] Interactive read failed: {e}");
                (AnswerKind::Error, format!("Error: {e}"))
            }
        }
    }

    fn teardown(&mut self) {
        info!("[WORKER] Releasing monitor generator");
        self.contexts.destroy();
    }
}
