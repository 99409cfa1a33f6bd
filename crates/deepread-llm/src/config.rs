//! LLM configuration and provider selection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{LlmProvider, ResolvedProvider, Sampling};

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

/// Stored LLM configuration (optionally read from `llm-config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_preferred")]
    pub preferred_provider: String,
    /// Primary secret for an OpenAI-compatible endpoint.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL of the OpenAI-compatible endpoint (without `/chat/completions`).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_preferred() -> String {
    "auto".into()
}
fn default_api_base() -> String {
    DEFAULT_OPENAI_BASE.into()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.into()
}
fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.into()
}
fn default_temperature() -> f64 {
    0.3
}
fn default_max_tokens() -> usize {
    4096
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred(),
            api_key: None,
            api_base: default_api_base(),
            openai_api_key: None,
            anthropic_api_key: None,
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            config_path: PathBuf::new(),
        }
    }
}

impl LlmConfig {
    /// Load config from file, falling back to env vars and defaults.
    pub fn load(config_path: &Path) -> Self {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Like [`LlmConfig::load`] with an explicit environment lookup.
    pub fn load_with(config_path: &Path, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config: LlmConfig = match std::fs::read_to_string(config_path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!("Ignoring invalid {}: {}", config_path.display(), e);
                LlmConfig::default()
            }),
            Err(_) => LlmConfig::default(),
        };
        config.config_path = config_path.to_path_buf();

        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if config.api_key.is_none() {
            config.api_key = non_empty("DEEPREAD_API_KEY");
        }
        if config.openai_api_key.is_none() {
            config.openai_api_key = non_empty("OPENAI_API_KEY");
        }
        if config.anthropic_api_key.is_none() {
            config.anthropic_api_key = non_empty("ANTHROPIC_API_KEY");
        }
        if let Some(base) = non_empty("DEEPREAD_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_empty("DEEPREAD_MODEL") {
            config.openai_model = model.clone();
            config.anthropic_model = model;
        }

        if let Some(resolved) = config.resolve_provider() {
            info!("LLM provider: {} ({})", resolved.provider, resolved.model);
        }
        config
    }

    fn openai_endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn openai(&self, key: &str) -> ResolvedProvider {
        ResolvedProvider {
            provider: LlmProvider::OpenAI,
            endpoint: self.openai_endpoint(),
            model: self.openai_model.clone(),
            api_key: key.to_string(),
        }
    }

    fn anthropic(&self, key: &str) -> ResolvedProvider {
        ResolvedProvider {
            provider: LlmProvider::Anthropic,
            endpoint: ANTHROPIC_ENDPOINT.to_string(),
            model: self.anthropic_model.clone(),
            api_key: key.to_string(),
        }
    }

    /// Resolve which provider, endpoint and model to use.
    pub fn resolve_provider(&self) -> Option<ResolvedProvider> {
        match self.preferred_provider.as_str() {
            "openai" => {
                return self
                    .api_key
                    .as_deref()
                    .or(self.openai_api_key.as_deref())
                    .map(|k| self.openai(k))
            }
            "anthropic" => return self.anthropic_api_key.as_deref().map(|k| self.anthropic(k)),
            _ => {}
        }

        // Auto mode: DEEPREAD_API_KEY > Anthropic > OpenAI
        if let Some(k) = &self.api_key {
            return Some(self.openai(k));
        }
        if let Some(k) = &self.anthropic_api_key {
            return Some(self.anthropic(k));
        }
        self.openai_api_key.as_deref().map(|k| self.openai(k))
    }

    pub fn is_configured(&self) -> bool {
        self.resolve_provider().is_some()
    }

    pub fn sampling(&self) -> Sampling {
        Sampling {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}
