// src/model/mock.rs
//! Local tiers that never leave the process.
//!
//! `HeuristicTier` is a deterministic keyword model used for `AI_TEST_MODE=mock`
//! and local runs. `ScriptedTier` replays queued responses and is what tests use
//! to drive the router through specific failure paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TierError;
use crate::idea::{
    Action, Direction, IdeaLabel, InstrumentKind, LabelScore, LevelKind, PriceLevel, TimeHorizon,
};
use crate::model::schema::{ParseOutput, RawIdea, TriageOutput};
use crate::model::{ModelTier, TierKind, TierRequest, TierResponse, TierSet};

static RE_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        \b(target|tgt|pt|tp|stop|sl|entry|support|resistance)s?\b
        \s*(?:at|@|:|of|is|around)?
        \s*\$?(\d+(?:\.\d+)?)
        (?:\s*-\s*\$?(\d+(?:\.\d+)?))?",
    )
    .expect("level regex")
});

static RE_TRIGGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:if|once|when)\s+([^.,;!?\n]+)").expect("trigger regex"));

static RE_SENTENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^.!?\n]+[.!?]*").expect("sentence regex"));

const CRYPTO: &[&str] = &["BTC", "ETH", "SOL", "DOGE", "XRP", "ADA"];
const ETFS: &[&str] = &["SPY", "QQQ", "IWM", "DIA", "TLT", "GLD", "SLV", "XLF", "XLE", "SMH"];

const BULL_WORDS: &[&str] = &[
    "calls", "long", "buy", "bought", "buying", "loading", "loaded", "bullish", "moon", "breakout",
    "rip", "ripping", "adding", "added", "higher",
];
const BEAR_WORDS: &[&str] = &[
    "puts", "short", "shorting", "sell", "sold", "selling", "bearish", "dump", "dumping", "fade",
    "lower", "breakdown",
];
const EXECUTION_WORDS: &[&str] = &[
    "loading", "loaded", "bought", "sold", "entered", "added", "trimmed", "filled", "opened",
    "closed",
];
const PLAN_WORDS: &[&str] = &[
    "target", "stop", "entry", "if", "plan", "setup", "watch", "watching", "pt", "tp",
];
const TA_WORDS: &[&str] = &[
    "support", "resistance", "breakout", "chart", "ema", "sma", "rsi", "trendline", "vwap",
];
const CATALYST_WORDS: &[&str] = &["earnings", "er", "fda", "fomc", "cpi", "guidance", "merger"];
const MARKET_WORDS: &[&str] = &["market", "markets", "indices", "futures", "macro", "recession"];
const PORTFOLIO_WORDS: &[&str] = &["portfolio", "positions", "cash", "allocation"];

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '$' || c == '.' || c == '-'))
        .map(|w| w.trim_matches(|c: char| c == '.' || c == '-').to_ascii_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn has_any(ws: &[String], vocab: &[&str]) -> bool {
    ws.iter().any(|w| vocab.contains(&w.trim_start_matches('$')))
}

fn count_any(ws: &[String], vocab: &[&str]) -> usize {
    ws.iter().filter(|w| vocab.contains(&w.as_str())).count()
}

fn mentions(text: &str, symbol: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '$')).any(|tok| {
        let tok = tok.trim_start_matches('$').trim_end_matches('.');
        tok == symbol
    })
}

fn instrument_for(ws: &[String], symbol: Option<&str>) -> InstrumentKind {
    let optionish = ws.iter().any(|w| {
        matches!(w.as_str(), "calls" | "call" | "puts" | "put" | "options" | "strike" | "0dte")
            || (w.len() > 1
                && (w.ends_with('c') || w.ends_with('p'))
                && w[..w.len() - 1].chars().all(|c| c.is_ascii_digit()))
    });
    if optionish {
        return InstrumentKind::Option;
    }
    match symbol {
        Some(s) if CRYPTO.contains(&s) => InstrumentKind::Crypto,
        Some(s) if ETFS.contains(&s) => InstrumentKind::Etf,
        Some(_) => InstrumentKind::Equity,
        None => InstrumentKind::Index,
    }
}

fn direction_for(ws: &[String]) -> Direction {
    let bull = count_any(ws, BULL_WORDS);
    let bear = count_any(ws, BEAR_WORDS);
    match (bull, bear) {
        (0, 0) => Direction::Neutral,
        (b, s) if b > s => Direction::Bullish,
        (b, s) if s > b => Direction::Bearish,
        _ => Direction::Mixed,
    }
}

fn action_for(ws: &[String]) -> Option<Action> {
    if has_any(ws, &["short", "shorting", "shorted"]) {
        Some(Action::Short)
    } else if has_any(ws, &["cover", "covered", "covering"]) {
        Some(Action::Cover)
    } else if has_any(ws, &["trim", "trimmed", "trimming"]) {
        Some(Action::Trim)
    } else if has_any(ws, &["sell", "sold", "selling"]) {
        Some(Action::Sell)
    } else if has_any(ws, &["add", "added", "adding"]) {
        Some(Action::Add)
    } else if has_any(ws, &["buy", "bought", "buying", "loading", "loaded", "entered", "long"]) {
        Some(Action::Buy)
    } else if has_any(ws, &["watch", "watching", "eyeing"]) {
        Some(Action::Watch)
    } else if has_any(ws, &["hold", "holding"]) {
        Some(Action::Hold)
    } else {
        None
    }
}

fn horizon_for(text: &str) -> TimeHorizon {
    let t = text.to_ascii_lowercase();
    if t.contains("scalp") {
        TimeHorizon::Scalp
    } else if ["0dte", "today", "intraday", "day trade"]
        .iter()
        .any(|w| t.contains(w))
    {
        TimeHorizon::Day
    } else if t.contains("swing") || t.contains("this week") || t.contains("few weeks") {
        TimeHorizon::Swing
    } else if t.contains("long term") || t.contains("long-term") || t.contains("years") {
        TimeHorizon::LongTerm
    } else if t.contains("months") || t.contains("position") {
        TimeHorizon::Position
    } else {
        TimeHorizon::Unknown
    }
}

fn levels_for(text: &str) -> Vec<PriceLevel> {
    let mut out = Vec::new();
    for caps in RE_LEVEL.captures_iter(text) {
        let kind = match caps[1].to_ascii_lowercase().as_str() {
            "target" | "tgt" | "pt" | "tp" => LevelKind::Target,
            "stop" | "sl" => LevelKind::Stop,
            "entry" => LevelKind::Entry,
            "support" => LevelKind::Support,
            _ => LevelKind::Resistance,
        };
        let Ok(first) = caps[2].parse::<f64>() else {
            continue;
        };
        if first <= 0.0 {
            continue;
        }
        let second = caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok());
        let level = match second {
            Some(hi) if hi >= first => PriceLevel {
                kind,
                value: None,
                range: Some((first, hi)),
                qualifier: None,
            },
            _ => PriceLevel {
                kind,
                value: Some(first),
                range: None,
                qualifier: None,
            },
        };
        out.push(level);
    }
    out
}

fn score(label: IdeaLabel, confidence: f32) -> LabelScore {
    LabelScore { label, confidence }
}

fn labels_for(ws: &[String], instrument: InstrumentKind, tickerless: bool) -> Vec<LabelScore> {
    let mut labels = Vec::new();
    if has_any(ws, EXECUTION_WORDS) {
        labels.push(score(IdeaLabel::TradeExecution, 0.85));
    }
    if has_any(ws, PLAN_WORDS) {
        labels.push(score(IdeaLabel::TradePlan, 0.8));
    }
    if instrument == InstrumentKind::Option {
        labels.push(score(IdeaLabel::OptionsFlow, 0.7));
    }
    if has_any(ws, TA_WORDS) {
        labels.push(score(IdeaLabel::TechnicalAnalysis, 0.7));
    }
    if has_any(ws, CATALYST_WORDS) {
        labels.push(score(IdeaLabel::Catalyst, 0.7));
    }
    if tickerless {
        if has_any(ws, PORTFOLIO_WORDS) {
            labels.push(score(IdeaLabel::PortfolioUpdate, 0.75));
        } else {
            labels.push(score(IdeaLabel::MarketView, 0.75));
        }
    }
    if labels.is_empty() {
        labels.push(score(IdeaLabel::TradePlan, 0.5));
    }
    labels
}

/// Deterministic keyword model. Same request in, same output out.
#[derive(Debug, Clone)]
pub struct HeuristicTier {
    model: String,
}

impl HeuristicTier {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self { model: model.into() }
    }

    fn triage(&self, request: &TierRequest) -> TriageOutput {
        let ws = words(&request.chunk_text);
        let trading = has_any(&ws, BULL_WORDS)
            || has_any(&ws, BEAR_WORDS)
            || has_any(&ws, PLAN_WORDS)
            || has_any(&ws, MARKET_WORDS)
            || has_any(&ws, PORTFOLIO_WORDS);
        let actionable = !request.candidates.is_empty() || trading;
        TriageOutput {
            actionable,
            confidence: if request.candidates.is_empty() { 0.6 } else { 0.9 },
            reason: None,
        }
    }

    fn idea(&self, text: &str, symbols: Vec<String>, confidence: f32) -> RawIdea {
        let ws = words(text);
        let primary = symbols.first().cloned();
        let instrument = instrument_for(&ws, primary.as_deref());
        RawIdea {
            text: text.trim().to_string(),
            summary: None,
            primary_symbol: primary,
            labels: labels_for(&ws, instrument, symbols.is_empty()),
            symbols,
            instrument,
            direction: direction_for(&ws),
            action: action_for(&ws),
            time_horizon: horizon_for(text),
            trigger_condition: RE_TRIGGER
                .captures(text)
                .and_then(|c| c.get(0))
                .map(|m| m.as_str().trim().to_string()),
            levels: levels_for(text),
            confidence,
        }
    }

    fn parse(&self, request: &TierRequest) -> ParseOutput {
        let confidence = match request.kind {
            TierKind::Escalation => 0.92,
            _ => 0.85,
        };
        let text = request.chunk_text.as_str();

        // group consecutive sentences by the first candidate they mention
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for m in RE_SENTENCE.find_iter(text) {
            let sentence = m.as_str();
            if sentence.trim().is_empty() {
                continue;
            }
            let found: Vec<String> = request
                .candidates
                .iter()
                .filter(|s| mentions(sentence, s))
                .cloned()
                .collect();
            let extends_last = matches!(
                groups.last(),
                Some((_, syms)) if found.is_empty() || found.first() == syms.first()
            );
            if extends_last {
                if let Some((buf, syms)) = groups.last_mut() {
                    buf.push(' ');
                    buf.push_str(sentence.trim());
                    for s in found {
                        if !syms.contains(&s) {
                            syms.push(s);
                        }
                    }
                }
            } else if !found.is_empty() {
                groups.push((sentence.trim().to_string(), found));
            }
        }

        let mut ideas: Vec<RawIdea> = groups
            .into_iter()
            .map(|(buf, syms)| self.idea(&buf, syms, confidence))
            .collect();

        if ideas.is_empty() && !request.candidates.is_empty() {
            // evidence only via aliases; attribute the whole chunk
            ideas.push(self.idea(text, request.candidates.clone(), confidence - 0.1));
        }
        if ideas.is_empty() {
            let ws = words(text);
            if has_any(&ws, MARKET_WORDS) || has_any(&ws, PORTFOLIO_WORDS) {
                ideas.push(self.idea(text, Vec::new(), confidence - 0.1));
            }
        }

        let aggregate = ideas
            .iter()
            .map(|i| i.confidence)
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.min(c))))
            .unwrap_or(0.9);
        ParseOutput {
            ideas,
            confidence: aggregate,
            ambiguous: false,
        }
    }
}

#[async_trait::async_trait]
impl ModelTier for HeuristicTier {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        let raw = match request.kind {
            TierKind::Triage => serde_json::to_string(&self.triage(request)),
            TierKind::Parse | TierKind::Escalation => serde_json::to_string(&self.parse(request)),
        }
        .map_err(|e| TierError::schema(e.to_string()))?;
        Ok(TierResponse {
            model: self.model.clone(),
            raw,
        })
    }
}

/// Tier set backed by `HeuristicTier`s.
pub fn heuristic_tiers() -> TierSet {
    TierSet {
        triage: Arc::new(HeuristicTier::new("mock-triage")),
        parse: Arc::new(HeuristicTier::new("mock-parse")),
        escalation: Arc::new(HeuristicTier::new("mock-escalation")),
    }
}

/// Replays a queue of canned results, one per call.
pub struct ScriptedTier {
    model: String,
    script: Mutex<VecDeque<Result<String, TierError>>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<TierRequest>>,
}

impl ScriptedTier {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then_ok<S: Into<String>>(self, raw: S) -> Self {
        self.push(Ok(raw.into()));
        self
    }

    pub fn then_err(self, err: TierError) -> Self {
        self.push(Err(err));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push(&self, item: Result<String, TierError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<TierRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl ModelTier for ScriptedTier {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(raw)) => Ok(TierResponse {
                model: self.model.clone(),
                raw,
            }),
            Some(Err(e)) => Err(e),
            None => Err(TierError::Rejected {
                status: 0,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateSet;
    use crate::model::schema::{decode_parse, decode_triage};
    use crate::text::Span;

    fn request(kind: TierKind, text: &str, symbols: &[&str]) -> TierRequest {
        let mut set = CandidateSet::new();
        for (i, s) in symbols.iter().enumerate() {
            set.insert(s, Span::new(i, i + 1));
        }
        TierRequest::new(kind, text, &set, "v1")
    }

    #[tokio::test]
    async fn heuristic_parses_option_trade_with_target() {
        let tier = HeuristicTier::new("mock-parse");
        let req = request(TierKind::Parse, "I'm loading $AAPL calls, target 220", &["AAPL"]);
        let out = decode_parse(&tier.complete(&req).await.unwrap().raw).unwrap();
        assert_eq!(out.ideas.len(), 1);
        let idea = &out.ideas[0];
        assert_eq!(idea.primary_symbol.as_deref(), Some("AAPL"));
        assert_eq!(idea.instrument, InstrumentKind::Option);
        assert_eq!(idea.direction, Direction::Bullish);
        assert_eq!(idea.action, Some(Action::Buy));
        assert_eq!(idea.levels[0].kind, LevelKind::Target);
        assert_eq!(idea.levels[0].value, Some(220.0));
    }

    #[tokio::test]
    async fn heuristic_triage_flags_chatter_as_noise() {
        let tier = HeuristicTier::new("mock-triage");
        let req = request(TierKind::Triage, "lol good morning everyone", &[]);
        let out = decode_triage(&tier.complete(&req).await.unwrap().raw).unwrap();
        assert!(!out.actionable);
    }

    #[tokio::test]
    async fn heuristic_splits_ideas_per_ticker() {
        let tier = HeuristicTier::new("mock-parse");
        let req = request(
            TierKind::Parse,
            "Bought NVDA at the open. Still like it. Shorting TSLA into earnings.",
            &["NVDA", "TSLA"],
        );
        let out = decode_parse(&tier.complete(&req).await.unwrap().raw).unwrap();
        let primaries: Vec<_> = out.ideas.iter().map(|i| i.primary_symbol.clone()).collect();
        assert_eq!(primaries, vec![Some("NVDA".to_string()), Some("TSLA".to_string())]);
        assert_eq!(out.ideas[1].action, Some(Action::Short));
        assert_eq!(out.ideas[1].direction, Direction::Bearish);
    }

    #[tokio::test]
    async fn scripted_tier_replays_in_order() {
        let tier = ScriptedTier::new("s")
            .then_ok("one")
            .then_err(TierError::Unavailable("x".into()));
        let req = request(TierKind::Parse, "x", &[]);
        assert_eq!(tier.complete(&req).await.unwrap().raw, "one");
        assert!(tier.complete(&req).await.is_err());
        assert!(matches!(
            tier.complete(&req).await,
            Err(TierError::Rejected { .. })
        ));
        assert_eq!(tier.calls(), 3);
        assert_eq!(tier.requests().len(), 3);
    }
}
