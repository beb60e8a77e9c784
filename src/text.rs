// src/text.rs
//! Character-offset helpers shared by the extractor and the splitter.

use serde::{Deserialize, Serialize};

/// Half-open `[start, end)` range in **character** offsets of the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Byte <-> char offset translation for one string.
#[derive(Debug, Clone)]
pub struct CharIndex {
    /// Byte offset of every char start, plus `text.len()` as a sentinel.
    starts: Vec<usize>,
}

impl CharIndex {
    pub fn new(text: &str) -> Self {
        let mut starts: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        starts.push(text.len());
        Self { starts }
    }

    /// Number of chars in the indexed text.
    pub fn char_len(&self) -> usize {
        self.starts.len() - 1
    }

    /// Char offset of a byte offset that sits on a char boundary.
    pub fn to_char(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
    }

    /// Byte offset of a char offset (clamped to the text end).
    pub fn to_byte(&self, ch: usize) -> usize {
        self.starts[ch.min(self.starts.len() - 1)]
    }

    pub fn span_of(&self, byte_start: usize, byte_end: usize) -> Span {
        Span::new(self.to_char(byte_start), self.to_char(byte_end))
    }
}
