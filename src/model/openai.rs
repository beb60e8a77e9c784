// src/model/openai.rs
//! OpenAI chat-completions tier with strict JSON-schema output.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::TierError;
use crate::model::schema::{parse_json_schema, triage_json_schema};
use crate::model::{ModelTier, TierKind, TierRequest, TierResponse};

const TRIAGE_PROMPT: &str = "You screen messages from a trading chat. Decide whether the \
text contains an actionable trading idea (a trade taken or planned, levels, a thesis on a \
ticker, a market or portfolio view). Banter, greetings and bot output are not actionable. \
Reply with JSON only.";

const PARSE_PROMPT: &str = "You extract trading ideas from a chat message. Emit one idea per \
distinct thesis. Only use ticker symbols that appear in the provided candidate list or that \
the text names explicitly; never invent tickers. Use null for unknown optional fields. Levels \
are positive prices. Confidence values are in [0, 1]. Set `ambiguous` when sarcasm or unclear \
references make the reading uncertain. Reply with JSON only.";

const ESCALATION_PROMPT: &str = "A smaller model attempted this extraction and its output is \
attached as `prior_attempt`; it may be malformed, low-confidence or inconsistent. Re-read the \
message and produce a corrected extraction following the same rules.";

pub struct OpenAiTier {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiTier {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("trade-idea-extractor/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn body(&self, request: &TierRequest) -> Value {
        let (system, schema_name, schema) = match request.kind {
            TierKind::Triage => (TRIAGE_PROMPT.to_string(), "triage", triage_json_schema()),
            TierKind::Parse => (PARSE_PROMPT.to_string(), "ideas", parse_json_schema()),
            TierKind::Escalation => (
                format!("{PARSE_PROMPT}\n\n{ESCALATION_PROMPT}"),
                "ideas",
                parse_json_schema(),
            ),
        };
        let user = json!({
            "text": request.chunk_text,
            "candidates": request.candidates,
            "prior_attempt": request.prior_attempt,
            "prompt_version": request.prompt_version,
        });
        json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user.to_string() },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "strict": true, "schema": schema }
            }
        })
    }
}

#[derive(Deserialize)]
struct Resp {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map an HTTP failure onto the transient/terminal taxonomy.
fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TierError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TierError::Auth(snippet),
        StatusCode::TOO_MANY_REQUESTS => TierError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => TierError::Timeout { secs: 0 },
        s if s.is_server_error() => TierError::Unavailable(format!("{s}: {snippet}")),
        s => TierError::Rejected {
            status: s.as_u16(),
            message: snippet,
        },
    }
}

fn transport_error(e: reqwest::Error) -> TierError {
    if e.is_timeout() {
        TierError::Timeout { secs: 0 }
    } else {
        TierError::Unavailable(e.to_string())
    }
}

#[async_trait::async_trait]
impl ModelTier for OpenAiTier {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &TierRequest) -> Result<TierResponse, TierError> {
        if self.api_key.is_empty() {
            return Err(TierError::Auth("empty api key".to_string()));
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, after, &body));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| TierError::schema(format!("provider envelope: {e}")))?;
        read_envelope(body, status, &self.model)
    }
}

/// First choice's content, or the refusal/empty-content error it carries.
fn read_envelope(body: Resp, status: StatusCode, model: &str) -> Result<TierResponse, TierError> {
    let msg = body
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| TierError::schema("no choices in response"))?;
    if let Some(refusal) = msg.refusal {
        return Err(TierError::Rejected {
            status: status.as_u16(),
            message: format!("refused: {refusal}"),
        });
    }
    let raw = msg
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| TierError::schema("empty content"))?;

    Ok(TierResponse {
        model: body.model.unwrap_or_else(|| model.to_string()),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateSet;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, None, "nope"),
            TierError::Auth(_)
        ));
        let rl = classify(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "");
        assert_eq!(
            rl,
            TierError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(classify(StatusCode::BAD_GATEWAY, None, "").is_transient());
        assert!(!classify(StatusCode::BAD_REQUEST, None, "").is_transient());
    }

    fn envelope(raw: &str) -> Result<TierResponse, TierError> {
        let body: Resp = serde_json::from_str(raw).unwrap();
        read_envelope(body, StatusCode::OK, "gpt-x")
    }

    #[test]
    fn envelope_reads_content_refusal_and_missing_fields() {
        let ok = envelope(r#"{"model":"gpt-4.1-2025","choices":[{"message":{"content":"{}"}}]}"#)
            .unwrap();
        assert_eq!(ok.model, "gpt-4.1-2025");
        assert_eq!(ok.raw, "{}");

        let fallback = envelope(r#"{"choices":[{"message":{"content":"{}","role":"assistant"}}]}"#)
            .unwrap();
        assert_eq!(fallback.model, "gpt-x");

        let refused = envelope(r#"{"choices":[{"message":{"content":null,"refusal":"no"}}]}"#);
        assert!(matches!(refused, Err(TierError::Rejected { status: 200, .. })));

        assert!(envelope(r#"{"choices":[{"message":{"content":"  "}}]}"#).is_err());
        assert!(envelope(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn escalation_body_carries_prior_attempt_and_schema() {
        let tier = OpenAiTier::new(
            "https://example.invalid/v1/",
            "k",
            "gpt-x",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(tier.endpoint, "https://example.invalid/v1/chat/completions");
        let req = TierRequest::new(TierKind::Escalation, "$AAPL?", &CandidateSet::new(), "v2")
            .with_prior_attempt(Some("{broken".into()));
        let body = tier.body(&req);
        assert_eq!(body["response_format"]["json_schema"]["strict"], json!(true));
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("{broken"));
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("prior_attempt"));
    }
}
