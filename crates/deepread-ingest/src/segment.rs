//! Translation segmentation.
//!
//! Bodies longer than the character budget are split on paragraph boundaries
//! (`\n\n`); a paragraph still over budget is split after each CJK full stop
//! `。`. Fenced code blocks and `$$` math blocks are never split. Each segment
//! remembers the separator that followed it so the translated pieces can be
//! concatenated back in order without disturbing the layout.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default character budget per translation call.
pub const DEFAULT_SEGMENT_CHARS: usize = 5000;

const CJK_FULL_STOP: char = '。';

/// A paragraph break: two or more newlines, blank lines may hold spaces or tabs.
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)*").expect("valid paragraph break regex"));

/// One unit of translation work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    /// Exact separator to re-insert after this segment's rendering.
    pub separator: String,
}

/// Splits a markdown body into segments no longer than `limit` characters
/// (single sentences or code blocks longer than the limit are kept whole).
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    limit: usize,
}

impl Segmenter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn split(&self, text: &str) -> Vec<Segment> {
        if char_len(text) <= self.limit {
            return vec![Segment {
                text: text.to_string(),
                separator: String::new(),
            }];
        }

        let mut units: Vec<(String, String)> = Vec::new();
        for (block, separator) in paragraphs(text) {
            let pieces = if char_len(&block) > self.limit && !is_fenced(&block) {
                split_sentences(&block)
            } else {
                vec![block]
            };
            let n = pieces.len();
            for (j, piece) in pieces.into_iter().enumerate() {
                let sep = if j + 1 < n { String::new() } else { separator.clone() };
                units.push((piece, sep));
            }
        }

        // Greedy packing of consecutive units.
        let mut segments = Vec::new();
        let mut current: Option<(String, usize)> = None;
        let mut pending_sep = String::new();
        for (piece, sep) in units {
            let piece_len = char_len(&piece);
            current = Some(match current.take() {
                Some((mut text, len)) => {
                    let sep_len = char_len(&pending_sep);
                    if len + sep_len + piece_len > self.limit {
                        segments.push(Segment {
                            text,
                            separator: std::mem::take(&mut pending_sep),
                        });
                        (piece, piece_len)
                    } else {
                        text.push_str(&pending_sep);
                        text.push_str(&piece);
                        (text, len + sep_len + piece_len)
                    }
                }
                None => (piece, piece_len),
            });
            pending_sep = sep;
        }
        if let Some((text, _)) = current {
            segments.push(Segment {
                text,
                separator: pending_sep,
            });
        }

        segments
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_CHARS)
    }
}

/// Concatenate rendered segments in input order, restoring separators.
pub fn reassemble(segments: &[Segment], rendered: &[String]) -> String {
    let mut out = String::new();
    for (segment, text) in segments.iter().zip(rendered) {
        out.push_str(text);
        out.push_str(&segment.separator);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split on blank-line runs, pairing each block with the exact run after it.
/// Open code or math fences absorb following blocks until they close.
fn paragraphs(text: &str) -> Vec<(String, String)> {
    let mut raw: Vec<(&str, &str)> = Vec::new();
    let mut last = 0;
    for m in PARAGRAPH_BREAK.find_iter(text) {
        raw.push((&text[last..m.start()], m.as_str()));
        last = m.end();
    }
    if last < text.len() {
        raw.push((&text[last..], ""));
    }

    let mut out: Vec<(String, String)> = Vec::new();
    let mut open: Option<(String, String)> = None;
    for (block, separator) in raw {
        let (mut acc, acc_sep) = match open.take() {
            Some((acc, sep)) => (acc, sep),
            None => (String::new(), String::new()),
        };
        acc.push_str(&acc_sep);
        acc.push_str(block);
        if is_balanced(&acc) {
            out.push((acc, separator.to_string()));
        } else {
            open = Some((acc, separator.to_string()));
        }
    }
    if let Some(unclosed) = open {
        out.push(unclosed);
    }
    out
}

fn is_balanced(s: &str) -> bool {
    s.matches("```").count() % 2 == 0 && s.matches("$$").count() % 2 == 0
}

fn is_fenced(block: &str) -> bool {
    let start = block.trim_start();
    start.starts_with("```") || start.starts_with("$$")
}

fn split_sentences(block: &str) -> Vec<String> {
    block
        .split_inclusive(CJK_FULL_STOP)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
