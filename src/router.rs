// src/router.rs
//! Model Router: triage -> main parse -> optional escalation for one chunk.
//!
//! Every tier call goes through the retry boundary. A chunk ends in exactly one
//! of `Ideas`, `Noise` or `Error`; nothing here touches the store.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::candidates::CandidateSet;
use crate::config::pipeline::EscalationSection;
use crate::config::PipelineConfig;
use crate::error::TierError;
use crate::idea::Direction;
use crate::model::schema::{decode_parse, decode_triage, ParseOutput, RawIdea};
use crate::model::{RetryPolicy, TierKind, TierRequest, TierResponse, TierSet};

/// Ideas from the tier that produced the accepted output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub ideas: Vec<RawIdea>,
    pub model: String,
    pub tier: TierKind,
    pub confidence: f32,
    pub raw_output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Ideas(ParsedChunk),
    Noise,
    Error(String),
}

/// Why a main parse was handed to the escalation tier.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationReason {
    Malformed(String),
    LowConfidence(f32),
    Ambiguous,
    TooManyTickers(usize),
    ConflictingDirections(String),
}

impl EscalationReason {
    pub fn label(&self) -> &'static str {
        match self {
            EscalationReason::Malformed(_) => "malformed",
            EscalationReason::LowConfidence(_) => "low_confidence",
            EscalationReason::Ambiguous => "ambiguous",
            EscalationReason::TooManyTickers(_) => "too_many_tickers",
            EscalationReason::ConflictingDirections(_) => "conflicting_directions",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::Malformed(e) => write!(f, "malformed main output ({e})"),
            EscalationReason::LowConfidence(c) => write!(f, "low confidence {c:.2}"),
            EscalationReason::Ambiguous => f.write_str("flagged ambiguous"),
            EscalationReason::TooManyTickers(n) => write!(f, "{n} tickers in one chunk"),
            EscalationReason::ConflictingDirections(s) => {
                write!(f, "conflicting directions on {s}")
            }
        }
    }
}

pub struct ModelRouter {
    tiers: TierSet,
    retry: RetryPolicy,
    escalation: EscalationSection,
    prompt_version: String,
}

impl ModelRouter {
    pub fn new(
        tiers: TierSet,
        retry: RetryPolicy,
        escalation: EscalationSection,
        prompt_version: impl Into<String>,
    ) -> Self {
        Self {
            tiers,
            retry,
            escalation,
            prompt_version: prompt_version.into(),
        }
    }

    pub fn from_config(cfg: &PipelineConfig, tiers: TierSet) -> Self {
        Self::new(
            tiers,
            RetryPolicy::from_config(&cfg.retry, &cfg.tiers),
            cfg.escalation.clone(),
            cfg.pipeline.prompt_version.clone(),
        )
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    pub fn request(
        &self,
        kind: TierKind,
        chunk_text: &str,
        candidates: &CandidateSet,
    ) -> TierRequest {
        TierRequest::new(kind, chunk_text, candidates, &self.prompt_version)
    }

    async fn call(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        let tier = self.tiers.get(request.kind);
        let started = Instant::now();
        let result = self.retry.call(tier.as_ref(), request).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!("tier_calls_total", "tier" => request.kind.as_str(), "outcome" => outcome)
            .increment(1);
        histogram!("tier_call_ms", "tier" => request.kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        if let Err(e) = &result {
            counter!("tier_failures_total", "tier" => request.kind.as_str(), "kind" => e.kind())
                .increment(1);
        }
        result
    }

    /// Full route for one chunk: triage, main parse, escalation when needed.
    pub async fn route_chunk(&self, chunk_text: &str, candidates: &CandidateSet) -> ParseOutcome {
        let triage_req = self.request(TierKind::Triage, chunk_text, candidates);
        let triage = self
            .call(&triage_req)
            .await
            .and_then(|resp| decode_triage(&resp.raw));
        match triage {
            Ok(t) if !t.actionable => {
                debug!(confidence = t.confidence, "triage: noise");
                return ParseOutcome::Noise;
            }
            Ok(_) => {}
            Err(e) => return ParseOutcome::Error(format!("triage: {e}")),
        }

        let main_req = self.request(TierKind::Parse, chunk_text, candidates);
        let main = self.call(&main_req).await;
        self.resolve_parse(chunk_text, candidates, main).await
    }

    /// Turn a main-parse result into an outcome, escalating when the output is
    /// malformed, unsure or inconsistent. Shared with batch ingestion, where the
    /// main parse came back from the batch facility.
    pub async fn resolve_parse(
        &self,
        chunk_text: &str,
        candidates: &CandidateSet,
        main: Result<TierResponse, TierError>,
    ) -> ParseOutcome {
        let main = match main {
            Ok(resp) => resp,
            Err(e) => return ParseOutcome::Error(format!("parse: {e}")),
        };
        let decoded = decode_parse(&main.raw);

        let reason = match &decoded {
            Ok(out) => self.escalation_reason(out),
            Err(e) => Some(EscalationReason::Malformed(e.to_string())),
        };
        let Some(reason) = reason else {
            return match decoded {
                Ok(out) => ParseOutcome::Ideas(parsed(out, main, TierKind::Parse)),
                Err(e) => ParseOutcome::Error(format!("parse: {e}")),
            };
        };

        counter!("escalations_total", "reason" => reason.label()).increment(1);
        info!(%reason, "escalating chunk");

        let req = self
            .request(TierKind::Escalation, chunk_text, candidates)
            .with_prior_attempt(Some(main.raw.clone()));
        let escalated = self.call(&req).await;
        let escalated = escalated.and_then(|resp| decode_parse(&resp.raw).map(|out| (out, resp)));

        match (escalated, decoded) {
            (Ok((out, resp)), _) => ParseOutcome::Ideas(parsed(out, resp, TierKind::Escalation)),
            (Err(e), Ok(out)) => {
                warn!(error = %e, "escalation failed, keeping main parse");
                ParseOutcome::Ideas(parsed(out, main, TierKind::Parse))
            }
            (Err(e), Err(_)) => ParseOutcome::Error(format!("escalation: {e}")),
        }
    }

    pub fn escalation_reason(&self, out: &ParseOutput) -> Option<EscalationReason> {
        if out.confidence < self.escalation.confidence_threshold {
            return Some(EscalationReason::LowConfidence(out.confidence));
        }
        if out.ambiguous {
            return Some(EscalationReason::Ambiguous);
        }

        let tickers: BTreeSet<String> = out
            .ideas
            .iter()
            .flat_map(|i| i.primary_symbol.iter().chain(i.symbols.iter()))
            .map(|s| s.trim().trim_start_matches('$').to_ascii_uppercase())
            .collect();
        if tickers.len() > self.escalation.max_tickers {
            return Some(EscalationReason::TooManyTickers(tickers.len()));
        }

        if self.escalation.on_conflicting_directions {
            let mut seen: HashMap<String, (bool, bool)> = HashMap::new();
            for idea in &out.ideas {
                let Some(sym) = idea.primary_symbol.as_deref() else {
                    continue;
                };
                let entry = seen
                    .entry(sym.trim().trim_start_matches('$').to_ascii_uppercase())
                    .or_default();
                match idea.direction {
                    Direction::Bullish => entry.0 = true,
                    Direction::Bearish => entry.1 = true,
                    _ => {}
                }
            }
            let mut conflicting: Vec<_> = seen
                .into_iter()
                .filter(|(_, (bull, bear))| *bull && *bear)
                .map(|(s, _)| s)
                .collect();
            conflicting.sort();
            if let Some(sym) = conflicting.into_iter().next() {
                return Some(EscalationReason::ConflictingDirections(sym));
            }
        }
        None
    }
}

fn parsed(out: ParseOutput, resp: TierResponse, tier: TierKind) -> ParsedChunk {
    ParsedChunk {
        ideas: out.ideas,
        model: resp.model,
        tier,
        confidence: out.confidence,
        raw_output: resp.raw,
    }
}
