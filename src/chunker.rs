//! Document chunking for the ingestion pipeline.
//!
//! Two modes:
//!
//! - [`window_chunks`]: naive fixed-size character windows with overlap,
//!   used when text goes straight to the embedder.
//! - [`split_units`] + [`pack_units`] (combined in [`sectioned_chunks`]):
//!   split on blank lines and heading-like lines into paragraph/heading
//!   units, then greedily pack units into chunks under a size budget. Each
//!   chunk remembers the heading it sits under, and packing never crosses a
//!   heading boundary.
//!
//! A single unit larger than the budget is emitted as an oversized chunk
//! rather than split further; the trailing partial chunk is always flushed.

use std::sync::OnceLock;

use regex::Regex;

/// A line of capitalized words, letters and spaces only, 4-51 characters.
fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z][A-Za-z\s]{3,50}$").expect("valid heading regex"))
}

/// Whether a trimmed line looks like a standalone section heading.
#[must_use]
pub fn is_heading(line: &str) -> bool {
    heading_pattern().is_match(line)
}

/// Fixed-size character windows with overlap. `overlap` must be smaller
/// than `size`; both are measured in characters, and slicing never lands
/// inside a UTF-8 code point.
#[must_use]
pub fn window_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    assert!(size > 0, "window size must be positive");
    assert!(overlap < size, "overlap must be smaller than the window");

    if text.is_empty() {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the end of the string.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(offset, _)| offset).collect();
    boundaries.push(text.len());
    let char_count = boundaries.len() - 1;

    let step = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = usize::min(start + size, char_count);
        let chunk = &text[boundaries[start]..boundaries[end]];
        if !chunk.trim().is_empty() {
            chunks.push(chunk.to_string());
        }
        if end == char_count {
            break;
        }
        start += step;
    }

    chunks
}

/// Split raw text into paragraph and heading units.
///
/// Blank lines end the current paragraph; heading-like lines end it too and
/// are emitted as standalone units. Lines inside a paragraph are joined with
/// single spaces.
#[must_use]
pub fn split_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();

        if line.is_empty() || is_heading(line) {
            if !current.is_empty() {
                units.push(std::mem::take(&mut current));
            }
            if is_heading(line) {
                units.push(line.to_string());
            }
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(line);
        }
    }

    if !current.is_empty() {
        units.push(current);
    }

    units
}

/// Greedily pack units into chunks not exceeding `budget` characters.
///
/// Units within a chunk are separated by blank lines. A unit that alone
/// exceeds the budget still becomes its own (oversized) chunk.
#[must_use]
pub fn pack_units(units: Vec<String>, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for unit in units {
        if !current.is_empty() && current.len() + unit.len() > budget {
            chunks.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current = unit;
        } else {
            current.push_str("\n\n");
            current.push_str(&unit);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// A packed chunk labeled with the heading it was found under, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionedChunk {
    pub heading: Option<String>,
    pub content: String,
}

/// Heading-aware chunking: [`split_units`] then [`pack_units`], with each
/// chunk attributed to the most recent heading above it. Prose before the
/// first heading carries no label. Chunks never span a heading boundary.
#[must_use]
pub fn sectioned_chunks(text: &str, budget: usize) -> Vec<SectionedChunk> {
    let mut chunks = Vec::new();
    let mut heading: Option<String> = None;
    let mut pending: Vec<String> = Vec::new();

    for unit in split_units(text) {
        if is_heading(&unit) {
            for content in pack_units(std::mem::take(&mut pending), budget) {
                chunks.push(SectionedChunk {
                    heading: heading.clone(),
                    content,
                });
            }
            heading = Some(unit);
        } else {
            pending.push(unit);
        }
    }
    for content in pack_units(pending, budget) {
        chunks.push(SectionedChunk {
            heading: heading.clone(),
            content,
        });
    }

    chunks
}
