// src/error.rs
//! Error taxonomy for the extraction pipeline.
//!
//! Tier errors split into transient (retried by the retry boundary) and terminal
//! (surfaced to the message's `error_reason`). Validation never produces an
//! error; it sanitizes. Lock contention is a wait, not an error.

use std::time::Duration;

use thiserror::Error;

use crate::message::MessageId;

/// Failure of a single model-tier call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TierError {
    #[error("tier call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("model output failed schema validation: {0}")]
    Schema(String),

    #[error("request rejected by provider (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<TierError> },
}

impl TierError {
    /// Timeouts, rate limits and provider outages are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TierError::Timeout { .. } | TierError::RateLimited { .. } | TierError::Unavailable(_)
        )
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TierError::Timeout { .. } => "timeout",
            TierError::RateLimited { .. } => "rate_limited",
            TierError::Unavailable(_) => "unavailable",
            TierError::Auth(_) => "auth",
            TierError::Schema(_) => "schema",
            TierError::Rejected { .. } => "rejected",
            TierError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    pub fn schema<S: Into<String>>(message: S) -> Self {
        TierError::Schema(message.into())
    }
}

/// Failure of the backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("store state lock poisoned")]
    Poisoned,

    #[error("commit for {0} must carry a terminal status")]
    NonTerminalCommit(MessageId),

    #[error("idea addressed to {found} committed under message {expected}")]
    ForeignIdea {
        expected: MessageId,
        found: MessageId,
    },

    #[error("duplicate idea address ({message_id}, {soft_chunk_index}, {local_idea_index})")]
    DuplicateAddress {
        message_id: MessageId,
        soft_chunk_index: u32,
        local_idea_index: u32,
    },
}

/// Failure talking to the asynchronous batch facility.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("unknown batch job {0}")]
    UnknownJob(String),

    #[error("batch job {0} has not finished")]
    NotReady(String),

    #[error("batch facility error: {0}")]
    Facility(#[from] TierError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
