//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default recognized category keywords, matched against path components.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "llm-agents",
    "context-engineering",
    "reasoning",
    "rag",
    "multimodal",
    "knowledge-graph",
    "reinforcement-learning",
    "survey",
];

pub const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Paths to all DeepRead data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Uploaded source documents (`data/source/<category>/`).
    pub source: PathBuf,
    /// Extraction markdown (`data/extract/<category>/`).
    pub extract: PathBuf,
    /// Translated renderings (`data/translation/<category>/`).
    pub translation: PathBuf,
    /// Analysis markdown, structured tree and report (`data/analysis/<category>/`).
    pub analysis: PathBuf,
    /// Per-paper metadata records (`data/.metadata/`).
    pub metadata: PathBuf,
    /// Per-task log files (`data/logs/tasks/`).
    pub task_logs: PathBuf,
    /// LLM configuration (`data/llm-config.json`).
    pub llm_config_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            source: root.join("source"),
            extract: root.join("extract"),
            translation: root.join("translation"),
            analysis: root.join("analysis"),
            metadata: root.join(".metadata"),
            task_logs: root.join("logs").join("tasks"),
            llm_config_file: root.join("llm-config.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    /// Create all required directories.
    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source)?;
        std::fs::create_dir_all(&self.extract)?;
        std::fs::create_dir_all(&self.translation)?;
        std::fs::create_dir_all(&self.analysis)?;
        std::fs::create_dir_all(&self.metadata)?;
        std::fs::create_dir_all(&self.task_logs)?;
        Ok(())
    }
}

/// Defaults applied to batch runs when the caller leaves an option unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchDefaults {
    pub batch_size: usize,
    pub parallel_tasks: usize,
    pub failed_retry: u32,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            batch_size: 10,
            parallel_tasks: 3,
            failed_retry: 2,
        }
    }
}

/// Top-level DeepRead configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReadConfig {
    /// HTTP bind host.
    pub host: String,
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Upload size ceiling in bytes (50 MiB).
    pub max_upload_bytes: u64,
    /// Maximum number of papers accepted by one batch request.
    pub max_batch_papers: usize,
    pub batch: BatchDefaults,
    /// Character budget for one translation call before the body is segmented.
    pub translate_batch_chars: usize,
    /// Per-call capability budget.
    pub capability_timeout: Duration,
    /// Natural language the translate stage renders into.
    pub target_language: String,
    /// Recognized category keywords for path-based inference.
    pub categories: Vec<String>,
}

impl DeepReadConfig {
    /// Defaults rooted at `data_dir`, without reading the environment.
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            host: "0.0.0.0".into(),
            port: 8000,
            data_paths: DataPaths::new(data_dir)?,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
            max_upload_bytes: 50 * 1024 * 1024,
            max_batch_papers: 50,
            batch: BatchDefaults::default(),
            translate_batch_chars: 5000,
            capability_timeout: Duration::from_secs(30),
            target_language: "Chinese".into(),
            categories: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut config = Self::with_defaults(data_dir)?;

        if let Ok(host) = std::env::var("DEEPREAD_HOST") {
            config.host = host;
        }
        config.port = env_parse("DEEPREAD_PORT")
            .or_else(|| env_parse("PORT"))
            .unwrap_or(config.port);
        if let Some(origins) = env_list("DEEPREAD_CORS_ORIGINS") {
            config.cors_origins = origins;
        }
        if let Some(mb) = env_parse::<u64>("DEEPREAD_MAX_UPLOAD_MB") {
            match mb.checked_mul(1024 * 1024) {
                Some(bytes) => config.max_upload_bytes = bytes,
                None => warn!("Ignoring DEEPREAD_MAX_UPLOAD_MB={}: too large", mb),
            }
        }
        config.max_batch_papers =
            env_parse("DEEPREAD_MAX_BATCH_PAPERS").unwrap_or(config.max_batch_papers);
        config.batch.batch_size = env_parse("DEEPREAD_BATCH_SIZE")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(config.batch.batch_size);
        config.batch.parallel_tasks = env_parse("DEEPREAD_PARALLEL_TASKS")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(config.batch.parallel_tasks);
        config.batch.failed_retry =
            env_parse("DEEPREAD_FAILED_RETRY").unwrap_or(config.batch.failed_retry);
        config.translate_batch_chars = env_parse("DEEPREAD_TRANSLATE_BATCH_CHARS")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(config.translate_batch_chars);
        if let Some(secs) = env_parse::<u64>("DEEPREAD_CAPABILITY_TIMEOUT_SECS") {
            config.capability_timeout = Duration::from_secs(secs);
        }
        if let Ok(lang) = std::env::var("DEEPREAD_TARGET_LANGUAGE") {
            config.target_language = lang;
        }
        if let Some(categories) = env_list("DEEPREAD_CATEGORIES") {
            config.categories = categories;
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `None` when the variable is unset or does not parse; the latter is logged
/// and the default stays in effect.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value, keeping default", key, raw);
            None
        }
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        warn!("Ignoring {}: no entries, keeping default", key);
        None
    } else {
        Some(items)
    }
}
