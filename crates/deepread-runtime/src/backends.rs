//! Concrete capability backends: lopdf extraction and LLM translate/analyze.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deepread_core::{AnalysisOutput, Error};
use deepread_ingest::{extract_pdf, text_stats};
use deepread_llm::{LlmClient, LlmConfig, LlmError};
use tracing::{debug, error};

use crate::invoker::*;

/// Reads the source file and extracts it on a blocking thread.
pub struct PdfExtractCapability;

#[async_trait]
impl Capability for PdfExtractCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extract
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        let CapabilityParams::Extract { source, options } = params else {
            return Err(CapabilityError::invalid("extract expects a source path"));
        };
        let bytes = tokio::fs::read(&source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CapabilityError::invalid(format!("Source not found: {}", source.display()))
            } else {
                CapabilityError::upstream(format!("Failed to read {}: {}", source.display(), e))
            }
        })?;
        debug!("Extracting {} ({} bytes)", source.display(), bytes.len());

        let document = tokio::task::spawn_blocking(move || extract_pdf(&bytes, &options))
            .await
            .map_err(|e| CapabilityError::upstream(format!("extraction task failed: {}", e)))?
            .map_err(|e| match e {
                Error::Validation(msg) => CapabilityError::invalid(msg),
                other => CapabilityError::upstream(other.to_string()),
            })?;
        Ok(CapabilityOutput::Extracted(document))
    }
}

fn llm_error(e: LlmError) -> CapabilityError {
    match e {
        LlmError::NotConfigured => CapabilityError::config_missing(e.to_string()),
        other => CapabilityError::upstream(other.to_string()),
    }
}

pub struct LlmTranslateCapability {
    client: LlmClient,
}

impl LlmTranslateCapability {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for LlmTranslateCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Translate
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        let CapabilityParams::Translate {
            text,
            target_language,
        } = params
        else {
            return Err(CapabilityError::invalid("translate expects text"));
        };
        if text.trim().is_empty() {
            return Ok(CapabilityOutput::Translated(text));
        }
        let rendered = self
            .client
            .translate(&text, &target_language)
            .await
            .map_err(llm_error)?;
        Ok(CapabilityOutput::Translated(rendered))
    }
}

pub struct LlmAnalyzeCapability {
    client: LlmClient,
}

impl LlmAnalyzeCapability {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for LlmAnalyzeCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Analyze
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        let CapabilityParams::Analyze { text, translation } = params else {
            return Err(CapabilityError::invalid("analyze expects text"));
        };
        if text.trim().is_empty() {
            return Err(CapabilityError::invalid("Nothing to analyze"));
        }
        let mut tree = self
            .client
            .analyze(&text, translation.as_deref())
            .await
            .map_err(llm_error)?;

        tree.stats = text_stats(&text);
        tree.stats.key_point_count = tree.key_points.len();
        tree.stats.insight_count = tree.insights.len();
        tree.stats.reflection_count = tree.reflections.len();
        Ok(CapabilityOutput::Analyzed(AnalysisOutput::from_tree(tree)))
    }
}

/// The production invoker: PDF extraction plus LLM translate and analyze.
///
/// Missing credentials are reported once here; the LLM backends stay
/// registered and fail their calls with `ConfigMissing`.
pub fn default_invoker(llm: LlmConfig, timeout: Duration) -> Invoker {
    if !llm.is_configured() {
        error!("No LLM credentials configured; translate and analyze will fail until DEEPREAD_API_KEY is set");
    }
    let client = LlmClient::new(llm);
    Invoker::new(
        timeout,
        vec![
            Arc::new(PdfExtractCapability),
            Arc::new(LlmTranslateCapability::new(client.clone())),
            Arc::new(LlmAnalyzeCapability::new(client)),
        ],
    )
}
