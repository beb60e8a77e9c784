// src/validator.rs
//! Validator: reconcile model-proposed tickers with the chunk's evidence.
//!
//! It can only remove or flag what the model proposed; it never adds tickers.
//! Per proposed symbol:
//! - reserved word -> rejected
//! - in the candidate set -> kept
//! - resolves through the alias table to a candidate -> kept as that ticker
//! - resolves through the alias table to a non-candidate -> kept as model-only
//! - anything else -> dropped
//!
//! Every removal lowers the idea's confidence. An idea left with no ticker is
//! discarded unless it is labelled as a portfolio or market view.

use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use crate::candidates::CandidateSet;
use crate::config::pipeline::ValidatorSection;
use crate::config::Lexicon;
use crate::model::schema::RawIdea;

/// A model idea that survived validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedIdea {
    pub idea: RawIdea,
    pub model_only_symbols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub dropped_symbols: Vec<String>,
    pub reserved_rejected: Vec<String>,
    pub model_only_symbols: Vec<String>,
    pub discarded_ideas: usize,
}

enum Verdict {
    Keep(String),
    ModelOnly(String),
    Reserved,
    Drop,
}

#[derive(Debug, Clone)]
pub struct Validator {
    lexicon: Arc<Lexicon>,
    penalties: ValidatorSection,
}

fn normalize(symbol: &str) -> String {
    symbol.trim().trim_start_matches('$').to_ascii_uppercase()
}

impl Validator {
    pub fn new(lexicon: Arc<Lexicon>, penalties: ValidatorSection) -> Self {
        Self { lexicon, penalties }
    }

    fn judge(&self, proposed: &str, candidates: &CandidateSet) -> Verdict {
        let norm = normalize(proposed);
        if norm.is_empty() {
            return Verdict::Drop;
        }
        if self.lexicon.is_reserved(&norm) {
            return Verdict::Reserved;
        }
        if candidates.contains(&norm) {
            return Verdict::Keep(norm);
        }
        match self.lexicon.resolve_alias(proposed.trim()) {
            Some(t) if self.lexicon.is_reserved(t) => Verdict::Reserved,
            Some(t) if candidates.contains(t) => Verdict::Keep(t.to_string()),
            Some(t) => Verdict::ModelOnly(t.to_string()),
            None => Verdict::Drop,
        }
    }

    /// Validate one chunk's ideas against that chunk's candidate set.
    pub fn validate(
        &self,
        ideas: Vec<RawIdea>,
        candidates: &CandidateSet,
    ) -> (Vec<ValidatedIdea>, ValidationReport) {
        let mut report = ValidationReport::default();
        let kept: Vec<ValidatedIdea> = ideas
            .into_iter()
            .filter_map(|idea| self.validate_idea(idea, candidates, &mut report))
            .collect();

        if !report.dropped_symbols.is_empty() || !report.reserved_rejected.is_empty() {
            counter!("validator_dropped_symbols_total")
                .increment((report.dropped_symbols.len() + report.reserved_rejected.len()) as u64);
        }
        if !report.model_only_symbols.is_empty() {
            counter!("validator_model_only_symbols_total")
                .increment(report.model_only_symbols.len() as u64);
        }
        if report.discarded_ideas > 0 {
            counter!("validator_discarded_ideas_total").increment(report.discarded_ideas as u64);
        }
        (kept, report)
    }

    fn validate_idea(
        &self,
        mut idea: RawIdea,
        candidates: &CandidateSet,
        report: &mut ValidationReport,
    ) -> Option<ValidatedIdea> {
        let mut proposed: Vec<String> = Vec::new();
        for s in idea.primary_symbol.iter().chain(idea.symbols.iter()) {
            if !proposed.iter().any(|p| normalize(p) == normalize(s)) {
                proposed.push(s.clone());
            }
        }

        let mut symbols: Vec<String> = Vec::new();
        let mut model_only: Vec<String> = Vec::new();
        let mut removed = 0usize;
        // resolved form of the proposed primary, if it survived
        let mut primary: Option<String> = None;
        let proposed_primary = idea.primary_symbol.as_deref().map(normalize);

        for p in &proposed {
            let is_primary = proposed_primary.as_deref() == Some(normalize(p).as_str());
            match self.judge(p, candidates) {
                Verdict::Keep(t) => {
                    if is_primary {
                        primary = Some(t.clone());
                    }
                    if !symbols.contains(&t) {
                        symbols.push(t);
                    }
                }
                Verdict::ModelOnly(t) => {
                    if !model_only.contains(&t) {
                        report.model_only_symbols.push(t.clone());
                        model_only.push(t);
                    }
                }
                Verdict::Reserved => {
                    removed += 1;
                    report.reserved_rejected.push(p.clone());
                }
                Verdict::Drop => {
                    removed += 1;
                    report.dropped_symbols.push(p.clone());
                }
            }
        }

        let tickerless_ok = idea.labels.iter().any(|l| l.label.allows_tickerless());
        if symbols.is_empty() && model_only.is_empty() && !tickerless_ok {
            debug!(dropped = removed, "discarding tickerless idea");
            report.discarded_ideas += 1;
            return None;
        }

        let penalty = removed as f32 * self.penalties.dropped_ticker_penalty
            + model_only.len() as f32 * self.penalties.model_only_penalty;
        idea.confidence = (idea.confidence - penalty).clamp(0.0, 1.0);
        idea.primary_symbol = primary.or_else(|| symbols.first().cloned());
        idea.symbols = symbols;

        Some(ValidatedIdea {
            idea,
            model_only_symbols: model_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idea::{Direction, IdeaLabel, InstrumentKind, LabelScore, TimeHorizon};
    use crate::text::Span;

    fn validator() -> Validator {
        Validator::new(Arc::new(Lexicon::embedded().unwrap()), ValidatorSection::default())
    }

    fn cands(symbols: &[&str]) -> CandidateSet {
        let mut set = CandidateSet::new();
        for (i, s) in symbols.iter().enumerate() {
            set.insert(s, Span::new(i * 10, i * 10 + 4));
        }
        set
    }

    fn idea(primary: Option<&str>, symbols: &[&str], labels: &[IdeaLabel]) -> RawIdea {
        RawIdea {
            text: "x".into(),
            summary: None,
            primary_symbol: primary.map(str::to_string),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            instrument: InstrumentKind::Equity,
            direction: Direction::Bullish,
            action: None,
            time_horizon: TimeHorizon::Unknown,
            trigger_condition: None,
            levels: vec![],
            labels: labels
                .iter()
                .map(|&label| LabelScore { label, confidence: 0.8 })
                .collect(),
            confidence: 0.9,
        }
    }

    #[test]
    fn keeps_evidenced_and_drops_hallucinated() {
        let (kept, report) = validator().validate(
            vec![idea(Some("AAPL"), &["AAPL", "ZZZQ"], &[IdeaLabel::TradePlan])],
            &cands(&["AAPL"]),
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].idea.symbols, vec!["AAPL"]);
        assert_eq!(report.dropped_symbols, vec!["ZZZQ"]);
        assert!((kept[0].idea.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn reserved_words_never_survive() {
        let (kept, report) = validator().validate(
            vec![idea(Some("CEO"), &["CEO", "NVDA"], &[IdeaLabel::Fundamental])],
            &cands(&["NVDA"]),
        );
        assert_eq!(kept[0].idea.primary_symbol.as_deref(), Some("NVDA"));
        assert_eq!(report.reserved_rejected, vec!["CEO"]);
    }

    #[test]
    fn alias_resolution_marks_model_only() {
        let (kept, report) = validator().validate(
            vec![idea(Some("nvidia"), &[], &[IdeaLabel::TradePlan])],
            &cands(&["AMD"]),
        );
        assert_eq!(kept.len(), 1);
        assert!(kept[0].idea.symbols.is_empty());
        assert_eq!(kept[0].model_only_symbols, vec!["NVDA"]);
        assert_eq!(report.model_only_symbols, vec!["NVDA"]);
    }

    #[test]
    fn alias_to_candidate_is_kept_normally() {
        let (kept, _) = validator().validate(
            vec![idea(Some("nvidia"), &[], &[IdeaLabel::TradePlan])],
            &cands(&["NVDA"]),
        );
        assert_eq!(kept[0].idea.symbols, vec!["NVDA"]);
        assert_eq!(kept[0].idea.primary_symbol.as_deref(), Some("NVDA"));
        assert!(kept[0].model_only_symbols.is_empty());
    }

    #[test]
    fn tickerless_idea_discarded_unless_market_or_portfolio() {
        let (kept, report) = validator().validate(
            vec![
                idea(Some("ZZZQ"), &[], &[IdeaLabel::TradePlan]),
                idea(None, &[], &[IdeaLabel::MarketView]),
            ],
            &cands(&[]),
        );
        assert_eq!(kept.len(), 1);
        assert!(kept[0].idea.primary_symbol.is_none());
        assert_eq!(report.discarded_ideas, 1);
    }
}
