//! Document types shared by the extract, translate and analyze stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which extraction side-channels to populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOptions {
    #[serde(default = "default_true")]
    pub extract_images: bool,
    #[serde(default = "default_true")]
    pub extract_tables: bool,
    #[serde(default = "default_true")]
    pub extract_formulas: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            extract_images: true,
            extract_tables: true,
            extract_formulas: true,
        }
    }
}

/// An image XObject discovered on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub page: u32,
    pub name: String,
}

/// Output of the extract stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    /// Markdown text body.
    pub markdown: String,
    pub page_count: usize,
    pub word_count: usize,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub formulas: Vec<String>,
}

impl ExtractedDocument {
    /// Side-channel summary recorded in paper metadata.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "page_count": self.page_count,
            "word_count": self.word_count,
            "image_count": self.images.len(),
            "table_count": self.tables.len(),
            "formula_count": self.formulas.len(),
        })
    }
}

/// Locally computed statistics attached to every analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub word_count: usize,
    pub char_count: usize,
    pub paragraph_count: usize,
    pub section_count: usize,
    pub reading_time_minutes: usize,
    pub key_point_count: usize,
    pub insight_count: usize,
    pub reflection_count: usize,
}

/// Structured "deep reading" analysis of one paper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTree {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub reflections: Vec<String>,
    #[serde(default)]
    pub structure: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub stats: AnalysisStats,
}

impl AnalysisTree {
    /// Markdown rendering stored as the `analysis` artifact.
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Deep Reading\n\n## Summary\n\n");
        out.push_str(self.summary.trim());
        out.push_str("\n\n");

        push_list(&mut out, "Key Points", &self.key_points);
        push_list(&mut out, "Insights", &self.insights);
        push_list(&mut out, "Reflections", &self.reflections);

        if !self.structure.is_empty() {
            out.push_str("## Structure\n\n");
            for (key, value) in &self.structure {
                match value {
                    serde_json::Value::String(s) => out.push_str(&format!("- **{}**: {}\n", key, s)),
                    serde_json::Value::Array(items) => {
                        out.push_str(&format!("- **{}**\n", key));
                        for item in items {
                            let text = item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string());
                            out.push_str(&format!("  - {}\n", text));
                        }
                    }
                    other => out.push_str(&format!("- **{}**: {}\n", key, other)),
                }
            }
            out.push('\n');
        }

        out
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("## {}\n\n", title));
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, item.trim()));
    }
    out.push('\n');
}

/// Result of the analyze capability: the tree plus its markdown rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub tree: AnalysisTree,
    pub markdown: String,
}

impl AnalysisOutput {
    pub fn from_tree(tree: AnalysisTree) -> Self {
        let markdown = tree.to_markdown();
        Self { tree, markdown }
    }
}
