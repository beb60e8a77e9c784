// src/model/schema.rs
//! Strict decoding of tier output.
//!
//! Output that does not match the schema is rejected with `TierError::Schema`,
//! never coerced. The JSON Schema documents sent to the provider mirror the
//! structs here (strict mode wants every property listed as required, so
//! optional fields are nullable there and `#[serde(default)]` here).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TierError;
use crate::idea::{Action, Direction, InstrumentKind, LabelScore, PriceLevel, TimeHorizon};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriageOutput {
    pub actionable: bool,
    pub confidence: f32,
    #[serde(default)]
    pub reason: Option<String>,
}

/// One idea as proposed by a model, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawIdea {
    pub text: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub primary_symbol: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    pub instrument: InstrumentKind,
    pub direction: Direction,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default = "unknown_horizon")]
    pub time_horizon: TimeHorizon,
    #[serde(default)]
    pub trigger_condition: Option<String>,
    #[serde(default)]
    pub levels: Vec<PriceLevel>,
    #[serde(default)]
    pub labels: Vec<LabelScore>,
    pub confidence: f32,
}

fn unknown_horizon() -> TimeHorizon {
    TimeHorizon::Unknown
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParseOutput {
    pub ideas: Vec<RawIdea>,
    /// Aggregate confidence over the whole chunk.
    pub confidence: f32,
    /// Model flags the chunk as ambiguous (sarcasm, unclear referent, ...).
    #[serde(default)]
    pub ambiguous: bool,
}

/// Models occasionally wrap JSON in a markdown fence even in structured mode.
fn strip_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn check_unit(what: &str, v: f32) -> Result<(), TierError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(TierError::schema(format!("{what} out of range: {v}")))
    }
}

fn check_price(what: &str, v: f64) -> Result<(), TierError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(TierError::schema(format!("{what} is not a positive price: {v}")))
    }
}

pub fn decode_triage(raw: &str) -> Result<TriageOutput, TierError> {
    let out: TriageOutput = serde_json::from_str(strip_fence(raw))
        .map_err(|e| TierError::schema(format!("triage: {e}")))?;
    check_unit("triage confidence", out.confidence)?;
    Ok(out)
}

pub fn decode_parse(raw: &str) -> Result<ParseOutput, TierError> {
    let out: ParseOutput = serde_json::from_str(strip_fence(raw))
        .map_err(|e| TierError::schema(format!("parse: {e}")))?;
    check_unit("aggregate confidence", out.confidence)?;

    for (i, idea) in out.ideas.iter().enumerate() {
        if idea.text.trim().is_empty() {
            return Err(TierError::schema(format!("idea {i}: empty text")));
        }
        check_unit(&format!("idea {i} confidence"), idea.confidence)?;
        for label in &idea.labels {
            check_unit(&format!("idea {i} label confidence"), label.confidence)?;
        }
        for level in &idea.levels {
            match (level.value, level.range) {
                (None, None) => {
                    return Err(TierError::schema(format!("idea {i}: level without value or range")))
                }
                (value, range) => {
                    if let Some(v) = value {
                        check_price(&format!("idea {i} level"), v)?;
                    }
                    if let Some((lo, hi)) = range {
                        check_price(&format!("idea {i} range low"), lo)?;
                        check_price(&format!("idea {i} range high"), hi)?;
                        if lo > hi {
                            return Err(TierError::schema(format!(
                                "idea {i}: inverted range {lo}..{hi}"
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

fn vocab(words: &[&str]) -> Value {
    json!({ "type": "string", "enum": words })
}

pub fn triage_json_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["actionable", "confidence", "reason"],
        "properties": {
            "actionable": { "type": "boolean" },
            "confidence": { "type": "number" },
            "reason": nullable("string"),
        }
    })
}

pub fn parse_json_schema() -> Value {
    let level = json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["kind", "value", "range", "qualifier"],
        "properties": {
            "kind": vocab(&["entry", "target", "stop", "support", "resistance", "trigger"]),
            "value": nullable("number"),
            "range": {
                "type": ["array", "null"],
                "items": { "type": "number" },
                "minItems": 2,
                "maxItems": 2
            },
            "qualifier": nullable("string"),
        }
    });
    let label = json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["label", "confidence"],
        "properties": {
            "label": vocab(&[
                "trade_execution", "trade_plan", "technical_analysis", "fundamental",
                "catalyst", "options_flow", "portfolio_update", "market_view", "risk_warning",
            ]),
            "confidence": { "type": "number" },
        }
    });
    let action = json!({
        "type": ["string", "null"],
        "enum": ["buy", "sell", "add", "trim", "hold", "short", "cover", "watch", null]
    });
    let idea = json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "text", "summary", "primary_symbol", "symbols", "instrument", "direction",
            "action", "time_horizon", "trigger_condition", "levels", "labels", "confidence"
        ],
        "properties": {
            "text": { "type": "string" },
            "summary": nullable("string"),
            "primary_symbol": nullable("string"),
            "symbols": { "type": "array", "items": { "type": "string" } },
            "instrument": vocab(&["equity", "option", "future", "etf", "index", "crypto", "other"]),
            "direction": vocab(&["bullish", "bearish", "neutral", "mixed"]),
            "action": action,
            "time_horizon": vocab(&["scalp", "day", "swing", "position", "long_term", "unknown"]),
            "trigger_condition": nullable("string"),
            "levels": { "type": "array", "items": level },
            "labels": { "type": "array", "items": label },
            "confidence": { "type": "number" },
        }
    });
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["ideas", "confidence", "ambiguous"],
        "properties": {
            "ideas": { "type": "array", "items": idea },
            "confidence": { "type": "number" },
            "ambiguous": { "type": "boolean" },
        }
    })
}
