//! Deterministic capability stubs shared by the runtime's unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deepread_core::{AnalysisOutput, AnalysisTree, DataPaths, ExtractedDocument};
use deepread_store::ArtifactStore;

use crate::events::EventBus;
use crate::invoker::*;
use crate::registry::TaskRegistry;

/// Translate backend that prefixes its input with `[zh] `.
#[derive(Default)]
pub struct EchoTranslate {
    fail_on: Option<String>,
    pub calls: AtomicUsize,
}

impl EchoTranslate {
    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Capability for EchoTranslate {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Translate
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let CapabilityParams::Translate { text, .. } = params else {
            return Err(CapabilityError::invalid("expected translate params"));
        };
        if self.fail_on.as_deref() == Some(text.as_str()) {
            return Err(CapabilityError::upstream(format!("cannot translate {}", text)));
        }
        Ok(CapabilityOutput::Translated(format!("[zh] {}", text)))
    }
}

pub struct SlowTranslate(pub Duration);

#[async_trait]
impl Capability for SlowTranslate {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Translate
    }

    async fn call(&self, _params: CapabilityParams) -> CapabilityResult {
        tokio::time::sleep(self.0).await;
        Ok(CapabilityOutput::Translated(String::new()))
    }
}

pub struct PanickingTranslate;

#[async_trait]
impl Capability for PanickingTranslate {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Translate
    }

    async fn call(&self, _params: CapabilityParams) -> CapabilityResult {
        panic!("translate backend exploded");
    }
}

/// Extract backend returning a fixed body. It can fail its first `fail_first`
/// calls, hold each call for `delay`, and records the peak number of
/// concurrent calls.
pub struct StubExtract {
    markdown: String,
    fail_first: usize,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubExtract {
    pub fn new(markdown: &str) -> Self {
        Self {
            markdown: markdown.to_string(),
            fail_first: 0,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for StubExtract {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Extract
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        let CapabilityParams::Extract { source, .. } = params else {
            return Err(CapabilityError::invalid("expected extract params"));
        };
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if n < self.fail_first {
            return Err(CapabilityError::upstream("transient extract failure"));
        }
        if !source.exists() {
            return Err(CapabilityError::invalid(format!(
                "source not found: {}",
                source.display()
            )));
        }
        Ok(CapabilityOutput::Extracted(ExtractedDocument {
            markdown: self.markdown.clone(),
            page_count: 1,
            word_count: deepread_ingest::word_count(&self.markdown),
            ..Default::default()
        }))
    }
}

/// Analyze backend returning a small fixed tree, or failing when `fail` is set.
#[derive(Default)]
pub struct StubAnalyze {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Capability for StubAnalyze {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Analyze
    }

    async fn call(&self, params: CapabilityParams) -> CapabilityResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let CapabilityParams::Analyze { text, .. } = params else {
            return Err(CapabilityError::invalid("expected analyze params"));
        };
        if self.fail {
            return Err(CapabilityError::upstream("analysis model unavailable"));
        }
        let mut tree = AnalysisTree {
            summary: "A short summary.".into(),
            key_points: vec!["First point".into(), "Second point".into()],
            insights: vec!["An insight".into()],
            reflections: vec!["A limitation".into()],
            ..Default::default()
        };
        tree.structure
            .insert("sections".into(), serde_json::json!(["Intro", "Method"]));
        tree.stats = deepread_ingest::text_stats(&text);
        tree.stats.key_point_count = tree.key_points.len();
        tree.stats.insight_count = tree.insights.len();
        tree.stats.reflection_count = tree.reflections.len();
        Ok(CapabilityOutput::Analyzed(AnalysisOutput::from_tree(tree)))
    }
}

/// Invoker over the given extract stub plus echo translate and stub analyze.
pub fn stub_invoker(extract: Arc<StubExtract>) -> Invoker {
    Invoker::new(
        Duration::from_secs(30),
        vec![
            extract,
            Arc::new(EchoTranslate::default()),
            Arc::new(StubAnalyze::default()),
        ],
    )
}

/// Store, registry and bus rooted in a temp directory.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub store: Arc<ArtifactStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<TaskRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(TaskRegistry::new(bus.clone(), Some(paths.task_logs.clone())));
        let store = Arc::new(ArtifactStore::open(paths));
        Self {
            dir,
            store,
            bus,
            registry,
        }
    }

    /// Write a file that passes the `%PDF` header check.
    pub fn write_pdf(&self, rel: &str) -> PathBuf {
        write_pdf(self.dir.path(), rel)
    }
}

pub fn write_pdf(root: &Path, rel: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, b"%PDF-1.4\n% stub\n").unwrap();
    path
}
