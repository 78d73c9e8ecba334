//! Backend tuning knobs and the prompt file / use-case definitions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{ContextParams, SamplingParams};
use crate::error::ConfigError;

/// Placeholder in the user prompt replaced by a use case's `details`.
pub const DETAILS_PLACEHOLDER: &str = "{details}";

pub const DEFAULT_INTERACTIVE_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that analyzes images and answers questions about them.";

fn default_model_path() -> PathBuf {
    PathBuf::from("Qwen2-VL-2B-Instruct.hef")
}
fn default_monitor_max_tokens() -> u32 {
    15
}
fn default_monitor_temperature() -> f32 {
    0.1
}
fn default_seed() -> u32 {
    42
}
fn default_interactive_max_tokens() -> u32 {
    200
}
fn default_interactive_temperature() -> f32 {
    0.5
}
fn default_interactive_system_prompt() -> String {
    DEFAULT_INTERACTIVE_SYSTEM_PROMPT.to_string()
}
fn default_cooldown_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_warmup_ms() -> u64 {
    3000
}
fn default_retry_wait_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_ask_timeout_ms() -> u64 {
    60_000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_eos_marker() -> String {
    "<|im_end|>".to_string()
}

/// Everything the worker needs besides the engine and the use case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    // Monitor sampling: short and near-deterministic
    #[serde(default = "default_monitor_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_monitor_temperature")]
    pub temperature: f32,
    #[serde(default = "default_seed")]
    pub seed: u32,
    // Interactive sampling
    #[serde(default = "default_interactive_max_tokens")]
    pub interactive_max_tokens: u32,
    #[serde(default = "default_interactive_temperature")]
    pub interactive_temperature: f32,
    #[serde(default = "default_interactive_system_prompt")]
    pub interactive_system_prompt: String,
    // Scheduling
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    // Session establishment
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    // Timeouts
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_eos_marker")]
    pub eos_marker: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            max_tokens: default_monitor_max_tokens(),
            temperature: default_monitor_temperature(),
            seed: default_seed(),
            interactive_max_tokens: default_interactive_max_tokens(),
            interactive_temperature: default_interactive_temperature(),
            interactive_system_prompt: default_interactive_system_prompt(),
            cooldown_ms: default_cooldown_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            warmup_ms: default_warmup_ms(),
            retry_wait_ms: default_retry_wait_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            ask_timeout_ms: default_ask_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            eos_marker: default_eos_marker(),
        }
    }
}

impl BackendConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn monitor_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            seed: self.seed,
            max_tokens: self.max_tokens,
        }
    }

    pub fn interactive_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.interactive_temperature,
            seed: self.seed,
            max_tokens: self.interactive_max_tokens,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// A named classification task, resolved against the shared prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseCaseDefinition {
    pub name: String,
    /// Declared order is both match priority and fallback order.
    pub options: Vec<String>,
    /// Empty map means direct matching against `options`.
    pub keywords: HashMap<String, Vec<String>>,
    pub details: String,
    pub system_prompt: String,
    /// Template containing [`DETAILS_PLACEHOLDER`].
    pub user_prompt: String,
}

impl UseCaseDefinition {
    pub fn uses_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// User prompt with the first `{details}` replaced.
    pub fn render_user_prompt(&self) -> String {
        self.user_prompt.replacen(DETAILS_PLACEHOLDER, &self.details, 1)
    }

    /// Context parameters for the monitor generator.
    pub fn context_params(&self, sampling: SamplingParams) -> ContextParams {
        ContextParams {
            sampling,
            system_prompt: self.system_prompt.clone(),
            user_prompt: self.render_user_prompt(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UseCaseEntry {
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    keywords: HashMap<String, Vec<String>>,
    #[serde(default)]
    details: String,
}

/// Parsed prompt file. Use cases keep their file order.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    #[serde(default, alias = "hailo_system_prompt")]
    pub system_prompt: String,
    #[serde(default, alias = "hailo_user_prompt")]
    pub user_prompt: String,
    #[serde(default)]
    use_cases: serde_json::Map<String, serde_json::Value>,
}

impl PromptConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn use_case_names(&self) -> Vec<&str> {
        self.use_cases.keys().map(String::as_str).collect()
    }

    /// The first use case in file order.
    pub fn active_use_case(&self) -> Result<UseCaseDefinition, ConfigError> {
        let name = self.use_cases.keys().next().ok_or(ConfigError::NoUseCases)?;
        self.use_case(name)
    }

    pub fn use_case(&self, name: &str) -> Result<UseCaseDefinition, ConfigError> {
        let raw = self
            .use_cases
            .get(name)
            .ok_or_else(|| ConfigError::UnknownUseCase(name.to_string()))?;
        let entry: UseCaseEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[CONFIG] Use case \"{name}\" is malformed ({e}), using defaults");
                UseCaseEntry::default()
            }
        };
        Ok(UseCaseDefinition {
            name: name.to_string(),
            options: entry.options,
            keywords: entry.keywords,
            details: entry.details,
            system_prompt: self.system_prompt.clone(),
            user_prompt: self.user_prompt.clone(),
        })
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPTS: &str = r#"{
        "hailo_system_prompt": "You watch a shop camera.",
        "hailo_user_prompt": "Describe the person. {details}",
        "use_cases": {
            "shopping": {
                "options": ["empty", "pickup", "browsing"],
                "keywords": {"empty": ["nobody"], "pickup": ["grabbing"]},
                "details": "Mention what their hands do."
            },
            "door": {
                "options": ["open", "closed"],
                "details": "Is the door open or closed?"
            }
        }
    }"#;

    #[test]
    fn test_first_use_case_is_active() {
        let prompts = PromptConfig::from_json_str(PROMPTS).unwrap();
        assert_eq!(prompts.use_case_names(), vec!["shopping", "door"]);
        let uc = prompts.active_use_case().unwrap();
        assert_eq!(uc.name, "shopping");
        assert!(uc.uses_keywords());
        assert_eq!(
            uc.render_user_prompt(),
            "Describe the person. Mention what their hands do."
        );
        assert_eq!(uc.system_prompt, "You watch a shop camera.");
    }

    #[test]
    fn test_missing_keywords_means_direct_mode() {
        let prompts = PromptConfig::from_json_str(PROMPTS).unwrap();
        let uc = prompts.use_case("door").unwrap();
        assert!(!uc.uses_keywords());
        assert_eq!(uc.options, vec!["open", "closed"]);
    }

    #[test]
    fn test_malformed_use_case_falls_back_to_defaults() {
        let prompts =
            PromptConfig::from_json_str(r#"{"user_prompt": "x", "use_cases": {"bad": 7}}"#)
                .unwrap();
        let uc = prompts.use_case("bad").unwrap();
        assert!(uc.options.is_empty());
        assert!(!uc.uses_keywords());
    }

    #[test]
    fn test_unknown_and_missing_use_cases() {
        let prompts = PromptConfig::from_json_str(PROMPTS).unwrap();
        assert!(matches!(
            prompts.use_case("parking"),
            Err(ConfigError::UnknownUseCase(_))
        ));
        let empty = PromptConfig::from_json_str("{}").unwrap();
        assert!(matches!(empty.active_use_case(), Err(ConfigError::NoUseCases)));
    }

    #[test]
    fn test_backend_config_partial_json_keeps_defaults() {
        let config = BackendConfig::from_json_str(r#"{"cooldown_ms": 250}"#).unwrap();
        assert_eq!(config.cooldown(), Duration::from_millis(250));
        assert_eq!(config.max_tokens, 15);
        assert_eq!(config.interactive_sampling().max_tokens, 200);
        assert_eq!(config.eos_marker, "<|im_end|>");
    }
}
