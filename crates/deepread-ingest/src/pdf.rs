//! PDF text extraction using lopdf.
//!
//! Pages are joined into a markdown body with one `## Page N` heading per page.
//! Side-channels (tables, formulas, images) are detected heuristically and only
//! populated when the matching option is enabled. Extraction is CPU-bound and
//! synchronous; async callers should run it on a blocking thread.

use deepread_core::{Error, ExtractOptions, ExtractedDocument, ImageRef, Result};
use lopdf::{Dictionary, Document, Object};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::stats::word_count;

static INLINE_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[^$\n]+\$").expect("valid inline math regex"));
static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("valid whitespace regex"));

const MATH_SYMBOLS: &str = "=+−×÷∑∏∫∂√≤≥≈≠∞∈∉⊂⊆∀∃αβγδεθλμσπφψω^";

/// True if the bytes start with the `%PDF` magic header.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Extract a markdown body and side-channels from PDF bytes.
pub fn extract_pdf(bytes: &[u8], options: &ExtractOptions) -> Result<ExtractedDocument> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| Error::Validation(format!("Failed to load PDF: {}", e)))?;

    let pages = doc.get_pages();
    debug!(page_count = pages.len(), "Extracting text from PDF");

    let mut markdown = String::new();
    let mut tables = Vec::new();
    let mut formulas = Vec::new();
    let mut images = Vec::new();
    let mut has_text = false;

    for (&page_num, &page_id) in pages.iter() {
        let text = match doc.extract_text(&[page_num]) {
            Ok(text) => clean_text(&text),
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to extract text from page, skipping");
                String::new()
            }
        };

        markdown.push_str(&format!("## Page {}\n\n", page_num));
        if !text.is_empty() {
            has_text = true;
            markdown.push_str(&text);
            markdown.push_str("\n\n");
        }

        if options.extract_tables {
            tables.extend(detect_tables(&text));
        }
        if options.extract_formulas {
            formulas.extend(detect_formulas(&text));
        }
        if options.extract_images {
            images.extend(
                page_images(&doc, page_id)
                    .into_iter()
                    .map(|name| ImageRef { page: page_num, name }),
            );
        }
    }

    if !has_text {
        return Err(Error::Validation(
            "No text content extracted from PDF".to_string(),
        ));
    }
    let body = markdown.trim_end().to_string();
    let words = word_count(&body);

    debug!(
        words,
        tables = tables.len(),
        formulas = formulas.len(),
        images = images.len(),
        "PDF extraction complete"
    );

    Ok(ExtractedDocument {
        markdown: body,
        page_count: pages.len(),
        word_count: words,
        images,
        tables,
        formulas,
    })
}

/// Collapse horizontal whitespace, trim lines, and squeeze blank-line runs.
fn clean_text(text: &str) -> String {
    let mut out = String::new();
    let mut blank = false;
    for line in text.lines() {
        let line = WHITESPACE_RUN.replace_all(line.trim(), " ");
        if line.is_empty() {
            if !blank && !out.is_empty() {
                out.push('\n');
            }
            blank = true;
            continue;
        }
        blank = false;
        out.push_str(&line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Group consecutive table-looking lines (pipe or tab separated, at least
/// three cells) into table blocks.
fn detect_tables(text: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let cells = line.matches('|').count().max(line.matches('\t').count());
        if cells >= 2 {
            current.push(line);
        } else if !current.is_empty() {
            if current.len() >= 2 {
                tables.push(current.join("\n"));
            }
            current.clear();
        }
    }
    if current.len() >= 2 {
        tables.push(current.join("\n"));
    }
    tables
}

/// Inline `$...$` spans plus lines dense in math symbols.
fn detect_formulas(text: &str) -> Vec<String> {
    let mut formulas: Vec<String> = INLINE_MATH
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();

    for line in text.lines() {
        let line = line.trim();
        let len = line.chars().count();
        if len < 5 || INLINE_MATH.is_match(line) {
            continue;
        }
        let symbols = line.chars().filter(|c| MATH_SYMBOLS.contains(*c)).count();
        if symbols * 5 >= len {
            formulas.push(line.to_string());
        }
    }
    formulas
}

/// Names of image XObjects referenced from a page's own resources.
fn page_images(doc: &Document, page_id: lopdf::ObjectId) -> Vec<String> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let Some(resources) = page.get(b"Resources").ok().and_then(|o| resolve_dict(doc, o)) else {
        return Vec::new();
    };
    let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| resolve_dict(doc, o)) else {
        return Vec::new();
    };

    xobjects
        .iter()
        .filter(|(_, obj)| is_image(doc, obj))
        .map(|(name, _)| String::from_utf8_lossy(name).into_owned())
        .collect()
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    let (_, obj) = doc.dereference(obj).ok()?;
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn is_image(doc: &Document, obj: &Object) -> bool {
    resolve_dict(doc, obj)
        .and_then(|dict| dict.get(b"Subtype").ok())
        .and_then(|subtype| subtype.as_name().ok())
        .map(|name| name == b"Image")
        .unwrap_or(false)
}
