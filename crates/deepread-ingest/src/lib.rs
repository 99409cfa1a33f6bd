//! DeepRead Ingest: PDF text extraction, translation segmentation, text statistics.

pub mod pdf;
pub mod segment;
pub mod stats;

pub use pdf::{extract_pdf, looks_like_pdf};
pub use segment::{reassemble, Segment, Segmenter};
pub use stats::{reading_time_minutes, text_stats, word_count};
