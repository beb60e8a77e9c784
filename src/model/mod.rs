// src/model/mod.rs
//! Model-tier boundary.
//!
//! Every tier is a capability that either produces a structured result or
//! fails. The router only sees `ModelTier`; concrete providers live in
//! submodules and are picked by `build_tiers` from config.

pub mod mock;
pub mod openai;
pub mod retry;
pub mod schema;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::candidates::CandidateSet;
use crate::config::PipelineConfig;
use crate::error::TierError;

pub use retry::RetryPolicy;

/// The three cost-ordered tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Triage,
    Parse,
    Escalation,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Triage => "triage",
            TierKind::Parse => "parse",
            TierKind::Escalation => "escalation",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to one tier call. Also the payload of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRequest {
    pub kind: TierKind,
    pub chunk_text: String,
    /// Candidate tickers, passed as a hint to curb hallucination.
    pub candidates: Vec<String>,
    /// Raw output of the main parse when escalating.
    #[serde(default)]
    pub prior_attempt: Option<String>,
    pub prompt_version: String,
}

impl TierRequest {
    pub fn new(
        kind: TierKind,
        chunk_text: &str,
        candidates: &CandidateSet,
        prompt_version: &str,
    ) -> Self {
        Self {
            kind,
            chunk_text: chunk_text.to_string(),
            candidates: candidates.symbols().map(str::to_string).collect(),
            prior_attempt: None,
            prompt_version: prompt_version.to_string(),
        }
    }

    pub fn with_prior_attempt(mut self, raw: Option<String>) -> Self {
        self.prior_attempt = raw;
        self
    }
}

/// Raw structured output plus the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierResponse {
    pub model: String,
    pub raw: String,
}

#[async_trait::async_trait]
pub trait ModelTier: Send + Sync {
    /// Model identifier recorded on ideas for provenance.
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &TierRequest) -> Result<TierResponse, TierError>;
}

pub type DynTier = Arc<dyn ModelTier>;

#[derive(Clone)]
pub struct TierSet {
    pub triage: DynTier,
    pub parse: DynTier,
    pub escalation: DynTier,
}

impl TierSet {
    pub fn get(&self, kind: TierKind) -> &DynTier {
        match kind {
            TierKind::Triage => &self.triage,
            TierKind::Parse => &self.parse,
            TierKind::Escalation => &self.escalation,
        }
    }
}

/// Factory: build the tier set according to config and environment.
///
/// * `AI_TEST_MODE=mock` or `provider = "mock"` -> deterministic local tiers.
/// * `provider = "openai"` -> chat-completions tiers with strict JSON schema output.
pub fn build_tiers(cfg: &PipelineConfig) -> anyhow::Result<TierSet> {
    if cfg.use_mock_tiers() {
        return Ok(mock::heuristic_tiers());
    }

    match cfg.tiers.provider.as_str() {
        "openai" => {
            let api_key = cfg.resolve_api_key()?;
            let timeout = Duration::from_secs(cfg.tiers.timeout_secs);
            let make = |model: &str| -> anyhow::Result<DynTier> {
                let tier = openai::OpenAiTier::new(&cfg.tiers.base_url, &api_key, model, timeout)?;
                Ok(Arc::new(tier))
            };
            Ok(TierSet {
                triage: make(&cfg.tiers.triage_model)?,
                parse: make(&cfg.tiers.parse_model)?,
                escalation: make(&cfg.tiers.escalation_model)?,
            })
        }
        other => anyhow::bail!("Unsupported tier provider in config: {other}"),
    }
}
