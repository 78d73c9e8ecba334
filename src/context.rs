//! Owner of the single monitor generation context.
//!
//! The engine allows one generator per model. Only the worker thread holds a
//! `ContextManager`, so exclusivity comes from ownership: `create` always
//! destroys the previous context first, and interactive dispatch calls
//! `destroy` before touching the model's one-shot API.

use log::{info, warn};

use crate::config::UseCaseDefinition;
use crate::engine::{
    build_messages, ChatMessage, ContextParams, GenerationContext, SamplingParams, TokenStream,
    VisionModel,
};
use crate::error::EngineError;

pub struct ContextManager {
    params: ContextParams,
    /// Monitor prompts never change, so the message list is built once.
    messages: Vec<ChatMessage>,
    active: Option<Box<dyn GenerationContext>>,
}

impl ContextManager {
    pub fn new(use_case: &UseCaseDefinition, sampling: SamplingParams) -> Self {
        let params = use_case.context_params(sampling);
        let messages = build_messages(&params.system_prompt, &params.user_prompt);
        Self {
            params,
            messages,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Build a fresh context, releasing any existing one first.
    pub fn create(&mut self, model: &mut dyn VisionModel) -> Result<(), EngineError> {
        self.destroy();
        let context = model.create_context(&self.params)?;
        self.active = Some(context);
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.active = None;
    }

    /// Destroy and create again, logging the outcome.
    pub fn recreate(&mut self, model: &mut dyn VisionModel) -> Result<(), EngineError> {
        match self.create(model) {
            Ok(()) => {
                info!("[CONTEXT] Generator recreated");
                Ok(())
            }
            Err(e) => {
                warn!("[CONTEXT] Generator recreate failed: {e}");
                Err(e)
            }
        }
    }

    /// Start a monitor generation over `frame` using the cached messages.
    pub fn generate(&mut self, frame: &[u8]) -> Result<Box<dyn TokenStream>, EngineError> {
        let context = self.active.as_mut().ok_or(EngineError::NoContext)?;
        context.generate(&self.messages, frame)
    }
}
