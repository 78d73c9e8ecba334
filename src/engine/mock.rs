//! Scripted in-process engine for tests and the demo binary.
//!
//! Replies are queued per generation mode; when a queue runs dry the default
//! reply is used. Failures can be injected at every stage, and a shared
//! [`MockHandle`] exposes counters after the engine has been moved onto the
//! worker thread.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    ChatMessage, ContextParams, EngineSession, FrameGeometry, GenerationContext, InferenceEngine,
    SamplingParams, StreamRead, TokenStream, VisionModel,
};
use crate::error::EngineError;

const MOCK_EOS: &str = "<|im_end|>";

/// What a single scripted generation produces.
#[derive(Debug, Clone)]
pub struct MockReply {
    tokens: Vec<String>,
    token_delay: Duration,
    stall_after: Option<usize>,
    fail_after: Option<usize>,
    emit_eos: bool,
}

impl MockReply {
    /// Reply that streams `text` word by word, then the end-of-sequence marker.
    pub fn text(text: &str) -> Self {
        Self {
            tokens: text.split_inclusive(' ').map(str::to_string).collect(),
            token_delay: Duration::ZERO,
            stall_after: None,
            fail_after: None,
            emit_eos: true,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// After `n` tokens every read blocks for the full timeout and reports it.
    pub fn stalling_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    /// After `n` tokens the next read fails with an engine error.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// End the stream without the end-of-sequence marker.
    pub fn without_eos(mut self) -> Self {
        self.emit_eos = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Through the persistent generation context.
    Context,
    /// Through the model's one-shot API.
    Direct,
}

/// One generation observed by the engine.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub mode: GenerationMode,
    pub started: Instant,
    /// Contexts alive at the moment the generation started.
    pub live_contexts: usize,
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    pub frame_len: usize,
}

#[derive(Debug)]
struct Script {
    devices: Vec<String>,
    scan_fails: bool,
    session_failures: u32,
    model_load_fails: bool,
    context_failures: u32,
    generate_failures: u32,
    geometry: FrameGeometry,
    context_replies: VecDeque<MockReply>,
    direct_replies: VecDeque<MockReply>,
    default_context_reply: MockReply,
    default_direct_reply: MockReply,
}

#[derive(Debug)]
struct MockState {
    script: Mutex<Script>,
    live_contexts: AtomicUsize,
    peak_live_contexts: AtomicUsize,
    contexts_created: AtomicUsize,
    session_attempts: AtomicUsize,
    clears: AtomicUsize,
    aborts: AtomicUsize,
    generations: Mutex<Vec<GenerationRecord>>,
}

impl MockState {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, record: GenerationRecord) {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn take_generate_failure(&self) -> bool {
        let mut script = self.script();
        if script.generate_failures > 0 {
            script.generate_failures -= 1;
            true
        } else {
            false
        }
    }
}

/// Scripted engine. Configure it, grab a [`MockHandle`], then hand it to the
/// backend.
#[derive(Debug)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        let script = Script {
            devices: vec!["mock-0000:01:00.0".to_string()],
            scan_fails: false,
            session_failures: 0,
            model_load_fails: false,
            context_failures: 0,
            generate_failures: 0,
            geometry: FrameGeometry::default(),
            context_replies: VecDeque::new(),
            direct_replies: VecDeque::new(),
            default_context_reply: MockReply::text("nobody in the aisle"),
            default_direct_reply: MockReply::text("The image shows a store shelf."),
        };
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(script),
                live_contexts: AtomicUsize::new(0),
                peak_live_contexts: AtomicUsize::new(0),
                contexts_created: AtomicUsize::new(0),
                session_attempts: AtomicUsize::new(0),
                clears: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
                generations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: self.state.clone(),
        }
    }

    pub fn with_devices(self, devices: Vec<String>) -> Self {
        self.state.script().devices = devices;
        self
    }

    pub fn with_scan_failure(self) -> Self {
        self.state.script().scan_fails = true;
        self
    }

    /// The first `n` session attempts fail.
    pub fn with_session_failures(self, n: u32) -> Self {
        self.state.script().session_failures = n;
        self
    }

    pub fn with_model_load_failure(self) -> Self {
        self.state.script().model_load_fails = true;
        self
    }

    pub fn with_geometry(self, geometry: FrameGeometry) -> Self {
        self.state.script().geometry = geometry;
        self
    }

    pub fn with_default_context_reply(self, reply: MockReply) -> Self {
        self.state.script().default_context_reply = reply;
        self
    }

    pub fn with_default_direct_reply(self, reply: MockReply) -> Self {
        self.state.script().default_direct_reply = reply;
        self
    }
}

impl InferenceEngine for MockEngine {
    fn scan_devices(&mut self) -> Result<Vec<String>, EngineError> {
        let script = self.state.script();
        if script.scan_fails {
            return Err(EngineError::Device("device scan failed".to_string()));
        }
        Ok(script.devices.clone())
    }

    fn create_session(&mut self) -> Result<Box<dyn EngineSession>, EngineError> {
        self.state.session_attempts.fetch_add(1, Ordering::SeqCst);
        let mut script = self.state.script();
        if script.session_failures > 0 {
            script.session_failures -= 1;
            return Err(EngineError::Device("device busy".to_string()));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

impl EngineSession for MockSession {
    fn load_model(&mut self, path: &Path) -> Result<Box<dyn VisionModel>, EngineError> {
        if self.state.script().model_load_fails {
            return Err(EngineError::ModelLoad(format!(
                "cannot open {}",
                path.display()
            )));
        }
        Ok(Box::new(MockModel {
            state: self.state.clone(),
        }))
    }
}

struct MockModel {
    state: Arc<MockState>,
}

impl VisionModel for MockModel {
    fn input_geometry(&self) -> FrameGeometry {
        self.state.script().geometry
    }

    fn create_context(
        &mut self,
        params: &ContextParams,
    ) -> Result<Box<dyn GenerationContext>, EngineError> {
        {
            let mut script = self.state.script();
            if script.context_failures > 0 {
                script.context_failures -= 1;
                return Err(EngineError::Context("out of device memory".to_string()));
            }
        }
        if self.state.live_contexts.load(Ordering::SeqCst) > 0 {
            return Err(EngineError::Context(
                "a generator already exists on this model".to_string(),
            ));
        }
        let live = self.state.live_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_live_contexts.fetch_max(live, Ordering::SeqCst);
        self.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            state: self.state.clone(),
            sampling: params.sampling,
        }))
    }

    fn generate(
        &mut self,
        sampling: &SamplingParams,
        messages: &[ChatMessage],
        frame: &[u8],
    ) -> Result<Box<dyn TokenStream>, EngineError> {
        let live_contexts = self.state.live_contexts.load(Ordering::SeqCst);
        if live_contexts > 0 {
            return Err(EngineError::Generation(
                "another generator is active".to_string(),
            ));
        }
        if self.state.take_generate_failure() {
            return Err(EngineError::Generation("device timeout".to_string()));
        }
        self.state.record(GenerationRecord {
            mode: GenerationMode::Direct,
            started: Instant::now(),
            live_contexts,
            messages: messages.to_vec(),
            sampling: *sampling,
            frame_len: frame.len(),
        });
        let reply = {
            let mut script = self.state.script();
            script
                .direct_replies
                .pop_front()
                .unwrap_or_else(|| script.default_direct_reply.clone())
        };
        Ok(Box::new(MockStream::new(self.state.clone(), reply)))
    }

    fn clear_context(&mut self) -> Result<(), EngineError> {
        self.state.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockContext {
    state: Arc<MockState>,
    sampling: SamplingParams,
}

impl GenerationContext for MockContext {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        frame: &[u8],
    ) -> Result<Box<dyn TokenStream>, EngineError> {
        if self.state.take_generate_failure() {
            return Err(EngineError::Generation("device timeout".to_string()));
        }
        self.state.record(GenerationRecord {
            mode: GenerationMode::Context,
            started: Instant::now(),
            live_contexts: self.state.live_contexts.load(Ordering::SeqCst),
            messages: messages.to_vec(),
            sampling: self.sampling,
            frame_len: frame.len(),
        });
        let reply = {
            let mut script = self.state.script();
            script
                .context_replies
                .pop_front()
                .unwrap_or_else(|| script.default_context_reply.clone())
        };
        Ok(Box::new(MockStream::new(self.state.clone(), reply)))
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.state.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockStream {
    state: Arc<MockState>,
    reply: MockReply,
    next: usize,
    aborted: bool,
    finished: bool,
}

impl MockStream {
    fn new(state: Arc<MockState>, reply: MockReply) -> Self {
        Self {
            state,
            reply,
            next: 0,
            aborted: false,
            finished: false,
        }
    }
}

impl TokenStream for MockStream {
    fn is_generating(&self) -> bool {
        !self.aborted && !self.finished
    }

    fn read(&mut self, timeout: Duration) -> Result<StreamRead, EngineError> {
        if !self.is_generating() {
            return Ok(StreamRead::EndOfStream);
        }
        if self.reply.fail_after.is_some_and(|n| self.next >= n) {
            return Err(EngineError::Read("device read failed".to_string()));
        }
        if self.reply.stall_after.is_some_and(|n| self.next >= n)
            || self.reply.token_delay > timeout
        {
            thread::sleep(timeout);
            return Ok(StreamRead::Timeout);
        }
        if !self.reply.token_delay.is_zero() {
            thread::sleep(self.reply.token_delay);
        }

        if let Some(token) = self.reply.tokens.get(self.next) {
            self.next += 1;
            return Ok(StreamRead::Token(token.clone()));
        }
        self.finished = true;
        if self.reply.emit_eos {
            Ok(StreamRead::Token(MOCK_EOS.to_string()))
        } else {
            Ok(StreamRead::EndOfStream)
        }
    }

    fn abort(&mut self) -> Result<(), EngineError> {
        self.aborted = true;
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Shared view of a [`MockEngine`] that outlives the move onto the worker.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
}

impl MockHandle {
    pub fn push_context_reply(&self, reply: MockReply) {
        self.state.script().context_replies.push_back(reply);
    }

    pub fn push_direct_reply(&self, reply: MockReply) {
        self.state.script().direct_replies.push_back(reply);
    }

    /// The next `n` context creations fail.
    pub fn fail_context_creations(&self, n: u32) {
        self.state.script().context_failures = n;
    }

    /// The next `n` generate calls (either mode) fail.
    pub fn fail_generations(&self, n: u32) {
        self.state.script().generate_failures = n;
    }

    pub fn live_contexts(&self) -> usize {
        self.state.live_contexts.load(Ordering::SeqCst)
    }

    pub fn peak_live_contexts(&self) -> usize {
        self.state.peak_live_contexts.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    pub fn session_attempts(&self) -> usize {
        self.state.session_attempts.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.state.clears.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> Vec<GenerationRecord> {
        self.state
            .generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generations_in(&self, mode: GenerationMode) -> Vec<GenerationRecord> {
        self.generations()
            .into_iter()
            .filter(|g| g.mode == mode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ContextParams {
        ContextParams {
            sampling: SamplingParams {
                temperature: 0.1,
                seed: 42,
                max_tokens: 15,
            },
            system_prompt: String::new(),
            user_prompt: "classify".to_string(),
        }
    }

    fn drain(stream: &mut dyn TokenStream) -> Vec<StreamRead> {
        let mut out = Vec::new();
        loop {
            let r = stream.read(Duration::from_millis(10)).unwrap();
            let done = r == StreamRead::EndOfStream || !stream.is_generating();
            out.push(r);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn test_reply_streams_words_then_eos() {
        let mut engine = MockEngine::new();
        let mut session = engine.create_session().unwrap();
        let mut model = session.load_model(Path::new("m.hef")).unwrap();
        let mut ctx = model.create_context(&params()).unwrap();
        let mut stream = ctx.generate(&[], &[0; 3]).unwrap();
        let reads = drain(stream.as_mut());
        assert_eq!(
            reads,
            vec![
                StreamRead::Token("nobody ".to_string()),
                StreamRead::Token("in ".to_string()),
                StreamRead::Token("the ".to_string()),
                StreamRead::Token("aisle".to_string()),
                StreamRead::Token(MOCK_EOS.to_string()),
            ]
        );
    }

    #[test]
    fn test_second_context_is_refused() {
        let mut engine = MockEngine::new();
        let handle = engine.handle();
        let mut session = engine.create_session().unwrap();
        let mut model = session.load_model(Path::new("m.hef")).unwrap();
        let first = model.create_context(&params()).unwrap();
        assert!(model.create_context(&params()).is_err());
        assert!(model.generate(&params().sampling, &[], &[]).is_err());
        drop(first);
        assert_eq!(handle.live_contexts(), 0);
        assert_eq!(handle.peak_live_contexts(), 1);
    }

    #[test]
    fn test_session_failures_are_consumed() {
        let mut engine = MockEngine::new().with_session_failures(2);
        assert!(engine.create_session().is_err());
        assert!(engine.create_session().is_err());
        assert!(engine.create_session().is_ok());
        assert_eq!(engine.handle().session_attempts(), 3);
    }
}
