// src/splitter.rs
//! Splitter: deterministic partition of long message text into ordered chunks.
//!
//! Cuts only ever land on whitespace, so no token (and therefore no ticker
//! symbol) is split. Within the budget window the cut prefers, in order:
//! a paragraph break, a sentence end, any whitespace; the first two only count
//! when they leave the chunk at least half full. A single token longer than the
//! budget becomes an oversized chunk rather than being cut.

use serde::{Deserialize, Serialize};

use crate::message::MessageId;
use crate::text::{CharIndex, Span};

/// One slice of the source text; `index` is 0-based and stable for a given
/// `(text, budget)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk<'a> {
    pub index: u32,
    pub text: &'a str,
    pub span: Span,
}

/// A chunk bound to its owning message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub message_id: MessageId,
    pub index: u32,
    pub text: String,
    pub span: Span,
}

/// Lazy chunk sequence. Cloning restarts from the clone point.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    chars: Vec<char>,
    idx: CharIndex,
    max: usize,
    pos: usize,
    next_index: u32,
    done: bool,
}

pub fn split(text: &str, max_chunk_chars: usize) -> Chunks<'_> {
    Chunks {
        text,
        chars: text.chars().collect(),
        idx: CharIndex::new(text),
        max: max_chunk_chars.max(1),
        pos: 0,
        next_index: 0,
        done: false,
    }
}

/// Split a message's text into owned chunks carrying the message id.
pub fn split_message(message_id: &MessageId, text: &str, max_chunk_chars: usize) -> Vec<Chunk> {
    split(text, max_chunk_chars)
        .map(|c| Chunk {
            message_id: message_id.clone(),
            index: c.index,
            text: c.text.to_string(),
            span: c.span,
        })
        .collect()
}

impl<'a> Chunks<'a> {
    fn emit(&mut self, start: usize, end: usize) -> TextChunk<'a> {
        let chunk = TextChunk {
            index: self.next_index,
            text: &self.text[self.idx.to_byte(start)..self.idx.to_byte(end)],
            span: Span::new(start, end),
        };
        self.next_index += 1;
        chunk
    }

    fn trim_end(&self, start: usize, mut end: usize) -> usize {
        while end > start && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        end
    }

    /// Best cut position in `(start, start + max]`; the chunk is `[start, cut)`.
    fn find_cut(&self, start: usize) -> usize {
        let n = self.chars.len();
        let window_end = (start + self.max).min(n - 1);
        let half = start + self.max / 2;

        let is_ws = |c: usize| self.chars[c].is_whitespace();
        let paragraph = |c: usize| self.chars[c] == '\n' && self.chars.get(c + 1) == Some(&'\n');
        let sentence = |c: usize| {
            is_ws(c) && (self.chars[c] == '\n' || matches!(self.chars[c - 1], '.' | '!' | '?'))
        };

        let last_in = |lo: usize, pred: &dyn Fn(usize) -> bool| {
            (lo..=window_end).rev().find(|&c| c > start && pred(c))
        };

        if let Some(c) = last_in(half, &paragraph) {
            return c;
        }
        if let Some(c) = last_in(half, &sentence) {
            return c;
        }
        if let Some(c) = last_in(start + 1, &is_ws) {
            return c;
        }
        // oversized token: run to the next whitespace
        (window_end..n).find(|&c| is_ws(c)).unwrap_or(n)
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = TextChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let n = self.chars.len();

        // Short text: exactly one chunk covering everything, index 0.
        if self.next_index == 0 && n <= self.max {
            self.done = true;
            return Some(self.emit(0, n));
        }

        while self.pos < n && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
        if self.pos >= n {
            self.done = true;
            return None;
        }

        let start = self.pos;
        if n - start <= self.max {
            let end = self.trim_end(start, n);
            self.pos = n;
            self.done = true;
            return Some(self.emit(start, end));
        }

        let cut = self.find_cut(start);
        let end = self.trim_end(start, cut);
        self.pos = cut;
        Some(self.emit(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk_zero() {
        let chunks: Vec<_> = split("  $AAPL calls  ", 100).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "  $AAPL calls  ");
        assert_eq!(chunks[0].span, Span::new(0, 15));
    }

    #[test]
    fn empty_text_still_yields_chunk_zero() {
        let chunks: Vec<_> = split("", 100).collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn prefers_paragraph_break() {
        let text = "first paragraph about $AAPL here.\n\nsecond paragraph about $TSLA.";
        let chunks: Vec<_> = split(text, 40).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "first paragraph about $AAPL here.");
        assert_eq!(chunks[1].text, "second paragraph about $TSLA.");
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn never_cuts_inside_a_token() {
        let text = "aaaa bbbb $BRK.B cccc dddd eeee ffff";
        for budget in 3..text.len() {
            for c in split(text, budget) {
                assert_eq!(c.text, c.text.trim(), "budget {budget}");
                assert!(!c.text.is_empty());
                assert!(!c.text.contains("BRK") || c.text.contains("$BRK.B"));
            }
        }
    }

    #[test]
    fn oversized_token_becomes_its_own_chunk() {
        let text = "hi https://example.com/a/very/long/path/that/keeps/going ok";
        let chunks: Vec<_> = split(text, 10).collect();
        assert!(chunks
            .iter()
            .any(|c| c.text == "https://example.com/a/very/long/path/that/keeps/going"));
    }

    #[test]
    fn spans_address_the_original_text() {
        let text = "héllo wörld. $NVDA to the moon. more words follow here.";
        let chars: Vec<char> = text.chars().collect();
        for c in split(text, 16) {
            let from_span: String = chars[c.span.start..c.span.end].iter().collect();
            assert_eq!(from_span, c.text);
        }
    }
}
