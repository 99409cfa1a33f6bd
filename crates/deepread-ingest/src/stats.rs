//! Text statistics for extracted and analyzed bodies.

use deepread_core::AnalysisStats;

/// Reading speed used for the reading time estimate.
pub const WORDS_PER_MINUTE: usize = 300;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x20000..=0x2A6DF  // Extension B
        | 0xF900..=0xFAFF    // Compatibility Ideographs
        | 0x3040..=0x30FF    // Hiragana + Katakana
        | 0xAC00..=0xD7AF    // Hangul syllables
    )
}

/// Count words: each CJK character counts as one word, other text counts
/// whitespace-separated tokens that contain an alphanumeric character.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace()
        .map(|token| {
            let cjk = token.chars().filter(|c| is_cjk(*c)).count();
            let latin = token.chars().any(|c| !is_cjk(c) && c.is_alphanumeric());
            cjk + usize::from(latin)
        })
        .sum()
}

pub fn reading_time_minutes(words: usize) -> usize {
    words.div_ceil(WORDS_PER_MINUTE)
}

/// Blank-line separated, non-empty blocks.
pub fn paragraph_count(text: &str) -> usize {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count()
}

/// Markdown headings (`#` through `######`).
pub fn section_count(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ')
        })
        .count()
}

/// Body statistics. The key point, insight and reflection counts are left at
/// zero for the caller to fill from the analysis tree.
pub fn text_stats(text: &str) -> AnalysisStats {
    let words = word_count(text);
    AnalysisStats {
        word_count: words,
        char_count: text.chars().count(),
        paragraph_count: paragraph_count(text),
        section_count: section_count(text),
        reading_time_minutes: reading_time_minutes(words),
        ..Default::default()
    }
}
