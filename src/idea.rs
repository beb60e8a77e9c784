// src/idea.rs
//! The persisted extraction unit and its vocabulary.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Equity,
    Option,
    Future,
    Etf,
    Index,
    Crypto,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    Add,
    Trim,
    Hold,
    Short,
    Cover,
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Scalp,
    Day,
    Swing,
    Position,
    LongTerm,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelKind {
    Entry,
    Target,
    Stop,
    Support,
    Resistance,
    Trigger,
}

/// Multi-label classification vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaLabel {
    TradeExecution,
    TradePlan,
    TechnicalAnalysis,
    Fundamental,
    Catalyst,
    OptionsFlow,
    PortfolioUpdate,
    MarketView,
    RiskWarning,
}

impl IdeaLabel {
    /// Labels under which an idea may legitimately carry no ticker.
    pub fn allows_tickerless(self) -> bool {
        matches!(self, IdeaLabel::PortfolioUpdate | IdeaLabel::MarketView)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub kind: LevelKind,
    #[serde(default)]
    pub value: Option<f64>,
    /// Inclusive `[low, high]` when the author gave a zone instead of a point.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    #[serde(default)]
    pub qualifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: IdeaLabel,
    pub confidence: f32,
}

/// Stable address of an idea: `(message_id, soft_chunk_index, local_idea_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdeaAddress {
    pub message_id: MessageId,
    pub soft_chunk_index: u32,
    pub local_idea_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idea {
    pub message_id: MessageId,
    pub soft_chunk_index: u32,
    pub local_idea_index: u32,
    pub idea_text: String,
    #[serde(default)]
    pub idea_summary: Option<String>,
    /// `None` for portfolio / market-wide ideas.
    pub primary_symbol: Option<String>,
    /// Validated tickers; each was present in the chunk's candidate set.
    pub symbols: Vec<String>,
    /// Tickers the model proposed that only resolved through the alias table.
    #[serde(default)]
    pub model_only_symbols: Vec<String>,
    pub instrument: InstrumentKind,
    pub direction: Direction,
    #[serde(default)]
    pub action: Option<Action>,
    pub time_horizon: TimeHorizon,
    #[serde(default)]
    pub trigger_condition: Option<String>,
    pub levels: Vec<PriceLevel>,
    pub labels: Vec<LabelScore>,
    pub confidence: f32,
    pub model: String,
    pub prompt_version: String,
    pub raw_output: String,
    /// Denormalized from the owning message for time-range queries.
    pub message_created_at: DateTime<Utc>,
}

impl Idea {
    pub fn address(&self) -> IdeaAddress {
        IdeaAddress {
            message_id: self.message_id.clone(),
            soft_chunk_index: self.soft_chunk_index,
            local_idea_index: self.local_idea_index,
        }
    }

    pub fn has_label(&self, label: IdeaLabel) -> bool {
        self.labels.iter().any(|l| l.label == label)
    }
}

/// Parse one of the snake_case vocabulary words (`"long_term"`, `"bullish"`, ...).
pub fn parse_vocab<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase())).ok()
}
