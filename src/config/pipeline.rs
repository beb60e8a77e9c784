// src/config/pipeline.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf};

use anyhow::Context;

// --- env defaults & names ---
pub const DEFAULT_PIPELINE_CONFIG_PATH: &str = "config/pipeline.toml";

pub const ENV_PIPELINE_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_PROMPT_VERSION: &str = "PROMPT_VERSION";
pub const ENV_ESCALATION_CONFIDENCE: &str = "ESCALATION_CONFIDENCE";
pub const ENV_MAX_CHUNK_CHARS: &str = "MAX_CHUNK_CHARS";
pub const ENV_WORKER_COUNT: &str = "WORKER_COUNT";
pub const ENV_AI_TEST_MODE: &str = "AI_TEST_MODE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub tiers: TierSection,
    pub retry: RetrySection,
    pub escalation: EscalationSection,
    pub validator: ValidatorSection,
    pub workers: WorkerSection,
    pub batch: BatchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Recorded on every message and idea; bump to trigger reprocessing.
    pub prompt_version: String,
    pub max_chunk_chars: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            prompt_version: "v1".to_string(),
            max_chunk_chars: 1500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSection {
    /// "openai" | "mock" (case-insensitive)
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    pub api_key: String,
    pub base_url: String,
    pub triage_model: String,
    pub parse_model: String,
    pub escalation_model: String,
    pub timeout_secs: u64,
}

impl Default for TierSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            api_key: "ENV".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            triage_model: "gpt-4o-mini".to_string(),
            parse_model: "gpt-4.1-mini".to_string(),
            escalation_model: "gpt-4.1".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts including the first one.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter_pct: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSection {
    /// Main-parse aggregate confidence below this escalates.
    pub confidence_threshold: f32,
    /// More distinct tickers than this in one chunk escalates.
    pub max_tickers: usize,
    /// Same ticker called both bullish and bearish escalates.
    pub on_conflicting_directions: bool,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_tickers: 5,
            on_conflicting_directions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub dropped_ticker_penalty: f32,
    pub model_only_penalty: f32,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            dropped_ticker_penalty: 0.15,
            model_only_penalty: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub count: usize,
    pub poll_interval_ms: u64,
    pub queue_depth: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 2_000,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub page_size: usize,
    pub max_requests: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_requests: 10_000,
        }
    }
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_unit_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}

fn parse_usize_env(raw: Option<String>) -> Option<usize> {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

impl PipelineConfig {
    /// Load from `$PIPELINE_CONFIG_PATH` or `config/pipeline.toml`; a missing
    /// file means defaults. Env overrides apply last.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(ENV_PIPELINE_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PIPELINE_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config at {}", path.display()))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(toml_str)?;
        cfg.tiers.provider = cfg.tiers.provider.trim().to_lowercase();
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var(ENV_PROMPT_VERSION) {
            if !v.trim().is_empty() {
                self.pipeline.prompt_version = v.trim().to_string();
            }
        }
        if let Some(t) = parse_unit_env(env::var(ENV_ESCALATION_CONFIDENCE).ok()) {
            self.escalation.confidence_threshold = t;
        }
        if let Some(n) = parse_usize_env(env::var(ENV_MAX_CHUNK_CHARS).ok()) {
            self.pipeline.max_chunk_chars = n;
        }
        if let Some(n) = parse_usize_env(env::var(ENV_WORKER_COUNT).ok()) {
            self.workers.count = n;
        }
    }

    /// Replace nonsensical values with defaults instead of failing at runtime.
    pub fn sanitize(&mut self) {
        let defaults = PipelineConfig::default();
        if self.pipeline.prompt_version.trim().is_empty() {
            self.pipeline.prompt_version = defaults.pipeline.prompt_version;
        }
        if self.pipeline.max_chunk_chars < 64 {
            self.pipeline.max_chunk_chars = defaults.pipeline.max_chunk_chars;
        }
        if !(0.0..=1.0).contains(&self.escalation.confidence_threshold) {
            self.escalation.confidence_threshold = defaults.escalation.confidence_threshold;
        }
        self.validator.dropped_ticker_penalty =
            self.validator.dropped_ticker_penalty.clamp(0.0, 1.0);
        self.validator.model_only_penalty = self.validator.model_only_penalty.clamp(0.0, 1.0);
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            // swap to keep a valid interval
            std::mem::swap(&mut self.retry.max_delay_ms, &mut self.retry.base_delay_ms);
        }
        self.retry.jitter_pct = self.retry.jitter_pct.clamp(0.0, 1.0);
        if self.tiers.timeout_secs == 0 {
            self.tiers.timeout_secs = defaults.tiers.timeout_secs;
        }
        if self.workers.count == 0 {
            self.workers.count = 1;
        }
        if self.workers.queue_depth == 0 {
            self.workers.queue_depth = defaults.workers.queue_depth;
        }
        if self.batch.page_size == 0 {
            self.batch.page_size = defaults.batch.page_size;
        }
    }

    /// True when deterministic local tiers should stand in for the provider.
    pub fn use_mock_tiers(&self) -> bool {
        let forced = env::var(ENV_AI_TEST_MODE)
            .map(|v| v.trim().eq_ignore_ascii_case("mock"))
            .unwrap_or(false);
        forced || self.tiers.provider == "mock"
    }

    /// Resolve the provider key, following "ENV" to the environment.
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if !self.tiers.api_key.trim().eq_ignore_ascii_case("env") {
            return Ok(self.tiers.api_key.trim().to_string());
        }
        match self.tiers.provider.as_str() {
            "openai" => env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var")),
            other => anyhow::bail!("Unsupported provider in config: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
[pipeline]
prompt_version = "v7"

[escalation]
confidence_threshold = 0.45
"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.prompt_version, "v7");
        assert_eq!(cfg.pipeline.max_chunk_chars, 1500);
        assert!((cfg.escalation.confidence_threshold - 0.45).abs() < 1e-6);
        assert_eq!(cfg.retry.max_attempts, 4);
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
[pipeline]
max_chunk_chars = 3

[escalation]
confidence_threshold = 4.0

[retry]
max_attempts = 0
base_delay_ms = 900
max_delay_ms = 100
"#,
        )
        .unwrap();
        assert_eq!(cfg.pipeline.max_chunk_chars, 1500);
        assert!((cfg.escalation.confidence_threshold - 0.6).abs() < 1e-6);
        assert_eq!(cfg.retry.max_attempts, 1);
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.retry.max_delay_ms, 900);
    }

    #[test]
    fn unit_env_parser_clamps() {
        assert_eq!(parse_unit_env(Some("1.7".into())), Some(1.0));
        assert_eq!(parse_unit_env(Some("abc".into())), None);
        assert_eq!(parse_usize_env(Some("0".into())), None);
        assert_eq!(parse_usize_env(Some(" 12 ".into())), Some(12));
    }
}
