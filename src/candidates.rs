// src/candidates.rs
//! Candidate Extractor: deterministic ticker evidence from raw text.
//!
//! Three sources feed the set:
//! - cashtags (`$AAPL`, `$brk.b`), 1–6 letters plus an optional share-class suffix
//! - bare uppercase tokens (`NVDA`, `BRK.B`), 2–6 letters; single capitals are too
//!   ambiguous in chat ("I", "A") to count without a `$`
//! - company names resolved through the lexicon alias table (`nvidia` -> NVDA)
//!
//! Tokens that exactly match a reserved word are rejected from every source.
//! Text inside code blocks or quoted bot commands is scanned like anything else;
//! filtering non-trading content is the ingestion side's job.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Lexicon;
use crate::text::{CharIndex, Span};

static RE_CASHTAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([A-Za-z]{1,6}(?:\.[A-Za-z]{1,2})?)\b").expect("cashtag regex")
});

static RE_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2,6}(?:\.[A-Z]{1,2})?)\b").expect("bare ticker regex"));

/// Uppercase ticker-like symbols with every offset they were seen at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    entries: BTreeMap<String, Vec<Span>>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &str, span: Span) {
        let offsets = self.entries.entry(symbol.to_ascii_uppercase()).or_default();
        if !offsets.contains(&span) {
            offsets.push(span);
            offsets.sort();
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries
            .contains_key(symbol.trim().trim_start_matches('$').to_ascii_uppercase().as_str())
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn offsets(&self, symbol: &str) -> Option<&[Span]> {
        self.entries
            .get(symbol.to_ascii_uppercase().as_str())
            .map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidates whose evidence lies wholly inside `span` (offsets stay
    /// message-relative). A company name cut by a chunk boundary counts for
    /// neither side.
    pub fn within(&self, span: Span) -> CandidateSet {
        let mut out = CandidateSet::new();
        for (sym, offsets) in &self.entries {
            for o in offsets {
                if span.contains(o) {
                    out.insert(sym, *o);
                }
            }
        }
        out
    }

    /// Comma-separated symbol list used as a prompt hint.
    pub fn hint(&self) -> String {
        self.symbols().collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone)]
pub struct CandidateExtractor {
    lexicon: Arc<Lexicon>,
}

impl CandidateExtractor {
    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// Scan `text` for ticker evidence. Offsets are char offsets into `text`.
    pub fn extract_candidates(&self, text: &str) -> CandidateSet {
        let mut set = CandidateSet::new();
        if text.trim().is_empty() {
            return set;
        }
        let idx = CharIndex::new(text);

        let mut cashtag_spans: Vec<Span> = Vec::new();
        for caps in RE_CASHTAG.captures_iter(text) {
            let (Some(whole), Some(sym)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let span = idx.span_of(whole.start(), whole.end());
            cashtag_spans.push(span);
            let symbol = sym.as_str().to_ascii_uppercase();
            if self.lexicon.is_reserved(&symbol) {
                continue;
            }
            set.insert(&symbol, span);
        }

        for caps in RE_BARE.captures_iter(text) {
            let Some(m) = caps.get(1) else {
                continue;
            };
            let span = idx.span_of(m.start(), m.end());
            // already seen as a cashtag
            if cashtag_spans.iter().any(|c| c.overlaps(&span)) {
                continue;
            }
            if self.lexicon.is_reserved(m.as_str()) {
                continue;
            }
            set.insert(m.as_str(), span);
        }

        if let Some(re) = self.lexicon.alias_regex() {
            for m in re.find_iter(text) {
                let Some(ticker) = self.lexicon.resolve_alias(m.as_str()) else {
                    continue;
                };
                if self.lexicon.is_reserved(ticker) {
                    continue;
                }
                set.insert(ticker, idx.span_of(m.start(), m.end()));
            }
        }

        set
    }

    /// `!price AAPL`, `/chart tsla` and friends. The word after the prefix
    /// must be on the lexicon's command list, so `/ES` and `?NVDA` stay chat.
    pub fn is_bot_command(&self, text: &str) -> bool {
        let t = text.trim_start();
        self.lexicon.bot_prefixes().iter().any(|prefix| {
            let Some(rest) = t.strip_prefix(prefix.as_str()) else {
                return false;
            };
            let word: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            let after = rest[word.len()..].chars().next();
            after.map_or(true, char::is_whitespace) && self.lexicon.is_bot_command_word(&word)
        })
    }

    pub fn is_reserved_signal_word(&self, token: &str) -> bool {
        self.lexicon.is_reserved(token)
    }
}
