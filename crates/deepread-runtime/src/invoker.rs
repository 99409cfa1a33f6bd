//! Capability invoker: one call surface over registered extract, translate and
//! analyze backends.
//!
//! Backends are registered at construction, keyed by [`CapabilityKind`]. Every
//! call runs under the configured per-call budget; an elapsed budget surfaces as
//! [`CapabilityErrorKind::Timeout`]. Results are all-or-nothing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deepread_core::{AnalysisOutput, ExtractOptions, ExtractedDocument};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The closed set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Extract,
    Translate,
    Analyze,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Translate => "translate",
            Self::Analyze => "analyze",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapabilityKind {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Self::Extract),
            "translate" => Ok(Self::Translate),
            "analyze" => Ok(Self::Analyze),
            other => Err(CapabilityError::new(
                CapabilityErrorKind::CapabilityNotFound,
                format!("Unknown capability: {}", other),
            )),
        }
    }
}

/// Parameters, one variant per capability.
#[derive(Debug, Clone)]
pub enum CapabilityParams {
    Extract {
        source: PathBuf,
        options: ExtractOptions,
    },
    Translate {
        text: String,
        target_language: String,
    },
    Analyze {
        text: String,
        translation: Option<String>,
    },
}

impl CapabilityParams {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Extract { .. } => CapabilityKind::Extract,
            Self::Translate { .. } => CapabilityKind::Translate,
            Self::Analyze { .. } => CapabilityKind::Analyze,
        }
    }
}

/// Successful capability value.
#[derive(Debug, Clone)]
pub enum CapabilityOutput {
    Extracted(ExtractedDocument),
    Translated(String),
    Analyzed(AnalysisOutput),
}

impl CapabilityOutput {
    pub fn into_extracted(self) -> Result<ExtractedDocument, CapabilityError> {
        match self {
            Self::Extracted(doc) => Ok(doc),
            other => Err(mismatch(CapabilityKind::Extract, &other)),
        }
    }

    pub fn into_translated(self) -> Result<String, CapabilityError> {
        match self {
            Self::Translated(text) => Ok(text),
            other => Err(mismatch(CapabilityKind::Translate, &other)),
        }
    }

    pub fn into_analyzed(self) -> Result<AnalysisOutput, CapabilityError> {
        match self {
            Self::Analyzed(out) => Ok(out),
            other => Err(mismatch(CapabilityKind::Analyze, &other)),
        }
    }

    fn kind(&self) -> CapabilityKind {
        match self {
            Self::Extracted(_) => CapabilityKind::Extract,
            Self::Translated(_) => CapabilityKind::Translate,
            Self::Analyzed(_) => CapabilityKind::Analyze,
        }
    }
}

fn mismatch(expected: CapabilityKind, got: &CapabilityOutput) -> CapabilityError {
    CapabilityError::upstream(format!(
        "{} backend returned a {} value",
        expected,
        got.kind()
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityErrorKind {
    CapabilityNotFound,
    InvalidArgument,
    UpstreamFailure,
    ConfigMissing,
    Timeout,
    Cancelled,
}

/// Failure half of a capability result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidArgument, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::UpstreamFailure, message)
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::ConfigMissing, message)
    }
}

impl From<CapabilityError> for deepread_core::Error {
    fn from(e: CapabilityError) -> Self {
        deepread_core::Error::Capability(e.message)
    }
}

pub type CapabilityResult = Result<CapabilityOutput, CapabilityError>;

/// A concrete backend for one capability kind.
#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;

    async fn call(&self, params: CapabilityParams) -> CapabilityResult;
}

struct InvokerInner {
    backends: HashMap<CapabilityKind, Arc<dyn Capability>>,
    timeout: Duration,
}

/// Registry of capability backends. Cheap to clone.
#[derive(Clone)]
pub struct Invoker {
    inner: Arc<InvokerInner>,
}

impl Invoker {
    /// Build an invoker. A later backend for the same kind replaces an earlier one.
    pub fn new(timeout: Duration, backends: Vec<Arc<dyn Capability>>) -> Self {
        let backends = backends.into_iter().map(|b| (b.kind(), b)).collect();
        Self {
            inner: Arc::new(InvokerInner { backends, timeout }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn has(&self, kind: CapabilityKind) -> bool {
        self.inner.backends.contains_key(&kind)
    }

    pub async fn invoke(&self, params: CapabilityParams) -> CapabilityResult {
        let kind = params.kind();
        let backend = self.inner.backends.get(&kind).cloned().ok_or_else(|| {
            CapabilityError::new(
                CapabilityErrorKind::CapabilityNotFound,
                format!("No backend registered for {}", kind),
            )
        })?;

        debug!("Invoking {}", kind);
        match tokio::time::timeout(self.inner.timeout, backend.call(params)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!("Capability {} failed: {}", kind, e);
                }
                result
            }
            Err(_) => Err(CapabilityError::new(
                CapabilityErrorKind::Timeout,
                format!("{} exceeded {}s budget", kind, self.inner.timeout.as_secs_f64()),
            )),
        }
    }

    /// Invoke by name; the name must match the parameter variant.
    pub async fn invoke_named(&self, name: &str, params: CapabilityParams) -> CapabilityResult {
        let kind: CapabilityKind = name.parse()?;
        if kind != params.kind() {
            return Err(CapabilityError::invalid(format!(
                "{} called with {} parameters",
                kind,
                params.kind()
            )));
        }
        self.invoke(params).await
    }

    /// Run calls concurrently; results come back in input order. A panicking
    /// or aborted call becomes a failure result and never affects its siblings.
    pub async fn batch_invoke(&self, calls: Vec<CapabilityParams>) -> Vec<CapabilityResult> {
        let handles: Vec<_> = calls
            .into_iter()
            .map(|params| {
                let invoker = self.clone();
                tokio::spawn(async move { invoker.invoke(params).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(CapabilityError::new(
                    CapabilityErrorKind::Cancelled,
                    "capability call was cancelled",
                )),
                Err(e) => Err(CapabilityError::upstream(format!(
                    "capability call panicked: {}",
                    e
                ))),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[tokio::test]
    async fn test_unknown_capability() {
        let invoker = Invoker::new(Duration::from_secs(1), vec![]);
        let err = invoker
            .invoke(CapabilityParams::Translate {
                text: "x".into(),
                target_language: "Chinese".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, CapabilityErrorKind::CapabilityNotFound);

        let err = invoker
            .invoke_named("summarize", CapabilityParams::Analyze { text: "x".into(), translation: None })
            .await
            .unwrap_err();
        assert_eq!(err.kind, CapabilityErrorKind::CapabilityNotFound);
    }

    #[tokio::test]
    async fn test_named_mismatch_is_invalid_argument() {
        let invoker = Invoker::new(Duration::from_secs(1), vec![Arc::new(EchoTranslate::default())]);
        let err = invoker
            .invoke_named("translate", CapabilityParams::Analyze { text: "x".into(), translation: None })
            .await
            .unwrap_err();
        assert_eq!(err.kind, CapabilityErrorKind::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let invoker = Invoker::new(
            Duration::from_secs(30),
            vec![Arc::new(SlowTranslate(Duration::from_secs(60)))],
        );
        let err = invoker
            .invoke(CapabilityParams::Translate {
                text: "x".into(),
                target_language: "Chinese".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, CapabilityErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_batch_invoke_keeps_order_and_isolates_failures() {
        let invoker = Invoker::new(
            Duration::from_secs(5),
            vec![Arc::new(EchoTranslate::failing_on("boom"))],
        );
        let calls = ["one", "boom", "three"]
            .iter()
            .map(|t| CapabilityParams::Translate {
                text: t.to_string(),
                target_language: "Chinese".into(),
            })
            .collect();
        let results = invoker.batch_invoke(calls).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].clone().unwrap().into_translated().unwrap(), "[zh] one");
        assert_eq!(results[1].as_ref().unwrap_err().kind, CapabilityErrorKind::UpstreamFailure);
        assert_eq!(results[2].clone().unwrap().into_translated().unwrap(), "[zh] three");
    }

    #[tokio::test]
    async fn test_batch_invoke_converts_panics() {
        let invoker = Invoker::new(Duration::from_secs(5), vec![Arc::new(PanickingTranslate)]);
        let results = invoker
            .batch_invoke(vec![CapabilityParams::Translate {
                text: "x".into(),
                target_language: "Chinese".into(),
            }])
            .await;
        assert_eq!(results[0].as_ref().unwrap_err().kind, CapabilityErrorKind::UpstreamFailure);
    }

    #[test]
    fn test_output_mismatch() {
        let err = CapabilityOutput::Translated("x".into()).into_extracted().unwrap_err();
        assert_eq!(err.kind, CapabilityErrorKind::UpstreamFailure);
    }
}
