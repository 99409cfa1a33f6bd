//! Prompt construction and response parsing for translation and analysis.

use std::collections::BTreeMap;

use deepread_core::AnalysisTree;
use serde::Deserialize;

use crate::types::{ChatMessage, LlmError};

/// Upper bound on body characters sent to the analyze prompt.
pub const MAX_ANALYZE_CHARS: usize = 60_000;

pub fn translate_messages(text: &str, target_language: &str) -> Vec<ChatMessage> {
    let system = format!(
        "You are a professional translator of academic papers. Translate the user's \
         markdown into {lang}. Rules:\n\
         1. Preserve the markdown structure exactly: headings, lists, tables, emphasis, links.\n\
         2. Do not translate or alter fenced code blocks or inline code.\n\
         3. Keep math formulas delimited by $...$ or $$...$$ unchanged.\n\
         4. Keep proper nouns, model names and citations in their original form when no \
         standard translation exists.\n\
         5. Output only the translation, with no preamble or commentary.",
        lang = target_language
    );
    vec![ChatMessage::system(system), ChatMessage::user(text)]
}

pub fn analyze_messages(text: &str, translation: Option<&str>) -> Vec<ChatMessage> {
    let system = "You are a careful research reader producing a deep reading of an academic \
        paper. Respond with a single JSON object and nothing else, using exactly these keys:\n\
        - \"summary\": string, one paragraph\n\
        - \"key_points\": array of strings, the paper's main contributions and findings\n\
        - \"insights\": array of strings, non-obvious implications for practitioners\n\
        - \"reflections\": array of strings, limitations, open questions, critique\n\
        - \"structure\": object describing the outline, e.g. {\"sections\": [...], \
        \"methodology\": \"...\", \"datasets\": [...]}";

    let mut user = String::from("Paper text:\n\n");
    user.push_str(truncate_chars(text, MAX_ANALYZE_CHARS));
    if let Some(translation) = translation {
        let budget = MAX_ANALYZE_CHARS.saturating_sub(text.chars().count());
        if budget > 0 {
            user.push_str("\n\nTranslated rendering (for reference):\n\n");
            user.push_str(truncate_chars(translation, budget));
        }
    }
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip a surrounding ```` ```json ```` fence if the model added one.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    reflections: Vec<String>,
    #[serde(default)]
    structure: BTreeMap<String, serde_json::Value>,
}

/// Parse the analyze response into a tree. `stats` is left at default.
pub fn parse_analysis(raw: &str) -> Result<AnalysisTree, LlmError> {
    let body = strip_code_fence(raw);
    // Tolerate prose around the object.
    let body = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => return Err(LlmError::InvalidResponse("no JSON object in response".into())),
    };
    let parsed: RawAnalysis =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
    if parsed.summary.trim().is_empty() && parsed.key_points.is_empty() {
        return Err(LlmError::InvalidResponse("analysis is empty".into()));
    }
    Ok(AnalysisTree {
        summary: parsed.summary,
        key_points: parsed.key_points,
        insights: parsed.insights,
        reflections: parsed.reflections,
        structure: parsed.structure,
        stats: Default::default(),
    })
}
