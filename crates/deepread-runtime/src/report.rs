//! Reading report generator.
//!
//! Composes the human-readable `report` artifact from a stored analysis tree and
//! whatever paper metadata is available.

use chrono::Utc;
use deepread_core::AnalysisTree;
use deepread_store::PaperMetadata;

pub fn render_report(meta: Option<&PaperMetadata>, paper_id: &str, tree: &AnalysisTree) -> String {
    let title = meta
        .map(|m| m.original_filename.trim_end_matches(".pdf").to_string())
        .unwrap_or_else(|| paper_id.to_string());

    let mut out = format!("# Reading Report: {}\n\n", title);

    out.push_str("| Field | Value |\n|---|---|\n");
    out.push_str(&format!("| Paper ID | `{}` |\n", paper_id));
    if let Some(meta) = meta {
        out.push_str(&format!("| Category | {} |\n", meta.category));
        out.push_str(&format!(
            "| Uploaded | {} |\n",
            meta.upload_time.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    out.push_str(&format!(
        "| Generated | {} |\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));

    let stats = &tree.stats;
    out.push_str("## Overview\n\n");
    out.push_str(&format!("- Words: {}\n", stats.word_count));
    out.push_str(&format!("- Sections: {}\n", stats.section_count));
    out.push_str(&format!("- Paragraphs: {}\n", stats.paragraph_count));
    out.push_str(&format!(
        "- Estimated reading time: {} min\n",
        stats.reading_time_minutes
    ));
    out.push_str(&format!(
        "- Key points / insights / reflections: {} / {} / {}\n\n",
        tree.key_points.len(),
        tree.insights.len(),
        tree.reflections.len()
    ));

    out.push_str("## Summary\n\n");
    if tree.summary.trim().is_empty() {
        out.push_str("_No summary available._\n\n");
    } else {
        out.push_str(tree.summary.trim());
        out.push_str("\n\n");
    }

    section(&mut out, "Key Points", &tree.key_points, true);
    section(&mut out, "Insights", &tree.insights, false);
    section(&mut out, "Reflections", &tree.reflections, false);

    if !tree.structure.is_empty() {
        out.push_str("## Structure\n\n");
        for (key, value) in &tree.structure {
            match value {
                serde_json::Value::Array(items) => {
                    let rendered: Vec<String> = items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .collect();
                    out.push_str(&format!("- **{}**: {}\n", key, rendered.join(" → ")));
                }
                serde_json::Value::String(s) => out.push_str(&format!("- **{}**: {}\n", key, s)),
                other => out.push_str(&format!("- **{}**: {}\n", key, other)),
            }
        }
        out.push('\n');
    }

    out
}

fn section(out: &mut String, title: &str, items: &[String], numbered: bool) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("## {}\n\n", title));
    for (i, item) in items.iter().enumerate() {
        if numbered {
            out.push_str(&format!("{}. {}\n", i + 1, item.trim()));
        } else {
            out.push_str(&format!("- {}\n", item.trim()));
        }
    }
    out.push('\n');
}
