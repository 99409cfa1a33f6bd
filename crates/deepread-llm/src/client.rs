//! High-level LLM client for the translate and analyze stages.

use deepread_core::AnalysisTree;
use reqwest::Client;
use tracing::debug;

use crate::config::LlmConfig;
use crate::prompts::{analyze_messages, parse_analysis, translate_messages};
use crate::providers::complete;
use crate::types::{LlmError, ResolvedProvider};

/// Shared HTTP client plus resolved configuration.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn provider(&self) -> Result<ResolvedProvider, LlmError> {
        self.config.resolve_provider().ok_or(LlmError::NotConfigured)
    }

    /// Translate one markdown segment into `target_language`.
    pub async fn translate(&self, text: &str, target_language: &str) -> Result<String, LlmError> {
        let provider = self.provider()?;
        debug!("Translating {} chars into {}", text.chars().count(), target_language);
        let out = complete(
            &self.http,
            &provider,
            translate_messages(text, target_language),
            self.config.sampling(),
        )
        .await?;
        if out.trim().is_empty() && !text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty translation".into()));
        }
        Ok(out)
    }

    /// Produce the deep reading tree for a paper body. Statistics are not filled.
    pub async fn analyze(
        &self,
        text: &str,
        translation: Option<&str>,
    ) -> Result<AnalysisTree, LlmError> {
        let provider = self.provider()?;
        let raw = complete(
            &self.http,
            &provider,
            analyze_messages(text, translation),
            self.config.sampling(),
        )
        .await?;
        parse_analysis(&raw)
    }
}
