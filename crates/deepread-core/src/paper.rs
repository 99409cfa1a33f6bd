//! Paper identity: filename sanitization, id minting, category recovery.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "general";

/// Every persisted output kind, keyed together with a `paper_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Source,
    Extract,
    Translation,
    Analysis,
    AnalysisStructured,
    Report,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        Self::Source,
        Self::Extract,
        Self::Translation,
        Self::Analysis,
        Self::AnalysisStructured,
        Self::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Extract => "extract",
            Self::Translation => "translation",
            Self::Analysis => "analysis",
            Self::AnalysisStructured => "analysis_structured",
            Self::Report => "report",
        }
    }

    /// Markdown-bodied kinds accepted by `put_text`.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Self::Extract | Self::Translation | Self::Analysis | Self::Report
        )
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content kinds exposed through the public content endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Source,
    Translation,
    Heartfelt,
}

impl ContentKind {
    pub fn artifact(&self) -> ArtifactKind {
        match self {
            Self::Source => ArtifactKind::Source,
            Self::Translation => ArtifactKind::Translation,
            Self::Heartfelt => ArtifactKind::Analysis,
        }
    }
}

impl std::str::FromStr for ContentKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Self::Source),
            "translation" => Ok(Self::Translation),
            "heartfelt" => Ok(Self::Heartfelt),
            other => Err(crate::Error::Validation(format!(
                "Invalid content type '{}': expected source, translation or heartfelt",
                other
            ))),
        }
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
/// Empty input becomes `unnamed`.
pub fn sanitize_filename(name: &str) -> String {
    if name.is_empty() {
        return "unnamed".to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Normalize a category label so it survives the `paper_id` prefix round trip:
/// lowercase, sanitized, free of underscores and of leading dots.
pub fn sanitize_category(category: &str) -> String {
    let trimmed = category.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return DEFAULT_CATEGORY.to_string();
    }
    sanitize_filename(&trimmed.to_lowercase()).replace('_', "-")
}

/// Mint `"{category}_{yyyyMMdd_HHmmss}_{safe_filename}"`.
pub fn mint_paper_id(category: &str, original_filename: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        sanitize_category(category),
        at.format("%Y%m%d_%H%M%S"),
        sanitize_filename(original_filename)
    )
}

/// Recover the category from a `paper_id` prefix (text before the first underscore).
pub fn category_from_paper_id(paper_id: &str) -> String {
    match paper_id.split_once('_') {
        Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
        _ => DEFAULT_CATEGORY.to_string(),
    }
}

/// Walk path components case-insensitively and return the first recognized
/// category keyword, or `general`.
pub fn infer_category(path: &Path, categories: &[String]) -> String {
    for component in path.components() {
        let part = component.as_os_str().to_string_lossy().to_lowercase();
        if let Some(found) = categories.iter().find(|c| c.to_lowercase() == part) {
            return sanitize_category(found);
        }
    }
    DEFAULT_CATEGORY.to_string()
}

/// Insert `_n` before the extension of a sanitized filename.
pub fn with_suffix(filename: &str, n: usize) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, n, ext),
        _ => format!("{}_{}", filename, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Attention Is All You Need.pdf"), "Attention_Is_All_You_Need.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("论文.pdf"), "__.pdf");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_sanitize_only_allowed_chars() {
        let inputs = ["a b/c\\d:e*f?g", "ümlaut-ß", "tab\tnew\nline", "ok_name-1.2.pdf"];
        for input in inputs {
            let out = sanitize_filename(input);
            assert!(out
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        }
    }

    #[test]
    fn test_mint_paper_id() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let id = mint_paper_id("llm-agents", "My Paper.pdf", at);
        assert_eq!(id, "llm-agents_20240305_140709_My_Paper.pdf");
        assert_eq!(category_from_paper_id(&id), "llm-agents");
    }

    #[test]
    fn test_category_underscores_normalized() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id = mint_paper_id("Knowledge_Graph", "a.pdf", at);
        assert_eq!(category_from_paper_id(&id), "knowledge-graph");
        assert_eq!(sanitize_category("  "), "general");
        assert_eq!(sanitize_category(".."), "general");
        assert_eq!(sanitize_category(".Hidden"), "hidden");
    }

    #[test]
    fn test_category_from_legacy_id() {
        assert_eq!(category_from_paper_id("noprefix"), "general");
        assert_eq!(category_from_paper_id("_x"), "general");
    }

    #[test]
    fn test_infer_category() {
        let cats: Vec<String> = vec!["llm-agents".into(), "rag".into()];
        assert_eq!(
            infer_category(Path::new("/papers/LLM-Agents/2024/x.pdf"), &cats),
            "llm-agents"
        );
        assert_eq!(infer_category(Path::new("/papers/RAG/x.pdf"), &cats), "rag");
        assert_eq!(infer_category(Path::new("/papers/misc/x.pdf"), &cats), "general");
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix("paper.pdf", 2), "paper_2.pdf");
        assert_eq!(with_suffix("paper", 3), "paper_3");
    }

    #[test]
    fn test_content_kind_parse() {
        assert_eq!("heartfelt".parse::<ContentKind>().unwrap(), ContentKind::Heartfelt);
        assert_eq!(ContentKind::Heartfelt.artifact(), ArtifactKind::Analysis);
        assert!("pdf".parse::<ContentKind>().unwrap_err().is_validation());
    }
}
