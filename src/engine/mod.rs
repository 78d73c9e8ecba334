//! Inference engine capability.
//!
//! The orchestration layer never does inference math itself. It drives an
//! opaque vision-language engine through these traits:
//!
//! - [`InferenceEngine`]: device discovery and session creation
//! - [`EngineSession`]: a live device connection that can load a model
//! - [`VisionModel`]: a loaded model with fixed input geometry
//! - [`GenerationContext`]: the exclusive generator (at most one alive)
//! - [`TokenStream`]: the output of a single generation
//!
//! Everything below `InferenceEngine` is created and used on the worker thread
//! only, so those traits carry no `Send` bound.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Fixed input frame size the model expects (RGB, 8 bits per channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub height: u32,
    pub width: u32,
}

impl FrameGeometry {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// Bytes in one RGB frame of this geometry.
    pub fn frame_size(&self) -> usize {
        self.height as usize * self.width as usize * 3
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::new(336, 336)
    }
}

/// Sampling knobs for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: u32,
    pub max_tokens: u32,
}

/// Everything needed to build a persistent generation context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub sampling: SamplingParams,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// One part of a chat message. Images are placeholders; the pixels travel
/// separately as the frame buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image,
}

/// Structured chat message handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// User turn carrying the image placeholder followed by the prompt text.
    pub fn user_with_image(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::Image, ContentPart::Text { text: text.into() }],
        }
    }

    /// Serialized form expected by JSON-driven engines.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Build the system + user message pair for one request. An empty system
/// prompt is omitted.
pub fn build_messages(system_prompt: &str, user_prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.push(ChatMessage::user_with_image(user_prompt));
    messages
}

/// Outcome of one bounded read from a token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    Token(String),
    Timeout,
    EndOfStream,
}

/// Output of one generation.
pub trait TokenStream {
    /// Whether the engine still reports the generation as running.
    fn is_generating(&self) -> bool;

    /// Block for at most `timeout` waiting for the next token.
    fn read(&mut self, timeout: Duration) -> Result<StreamRead, EngineError>;

    /// Ask the engine to stop producing tokens.
    fn abort(&mut self) -> Result<(), EngineError>;
}

/// The exclusive generator. At most one may exist per model at a time.
pub trait GenerationContext {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        frame: &[u8],
    ) -> Result<Box<dyn TokenStream>, EngineError>;
}

/// A model loaded on a session.
pub trait VisionModel {
    fn input_geometry(&self) -> FrameGeometry;

    fn create_context(
        &mut self,
        params: &ContextParams,
    ) -> Result<Box<dyn GenerationContext>, EngineError>;

    /// One-shot generation without a persistent context. Must only be called
    /// while no [`GenerationContext`] exists.
    fn generate(
        &mut self,
        sampling: &SamplingParams,
        messages: &[ChatMessage],
        frame: &[u8],
    ) -> Result<Box<dyn TokenStream>, EngineError>;

    /// Drop the conversation state accumulated by the last generation.
    fn clear_context(&mut self) -> Result<(), EngineError>;
}

pub trait EngineSession {
    fn load_model(&mut self, path: &Path) -> Result<Box<dyn VisionModel>, EngineError>;
}

/// Entry point of the engine. Moved onto the worker thread at startup.
pub trait InferenceEngine: Send + 'static {
    /// Ids of the devices currently visible.
    fn scan_devices(&mut self) -> Result<Vec<String>, EngineError>;

    fn create_session(&mut self) -> Result<Box<dyn EngineSession>, EngineError>;
}
