// src/store/mod.rs
//! Persistence Coordinator.
//!
//! The only write path for ideas is `persist`: under the message's exclusive
//! lock it deletes every existing idea of the message, inserts the new set and
//! advances the status triple, all as one atomic step. Re-running a message is
//! therefore idempotent and concurrent commits resolve last-writer-wins.

pub mod lock;
pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::idea::{Action, Direction, Idea, IdeaLabel, TimeHorizon};
use crate::message::{Message, MessageId, ParseStatus};

pub use memory::MemoryStore;

/// Everything one commit writes for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageCommit {
    pub status: ParseStatus,
    pub error_reason: Option<String>,
    pub prompt_version: String,
    pub ideas: Vec<Idea>,
}

impl MessageCommit {
    /// Reject commits the store must never apply.
    pub fn check(&self, message_id: &MessageId) -> Result<(), StoreError> {
        if !self.status.is_terminal() {
            return Err(StoreError::NonTerminalCommit(message_id.clone()));
        }
        let mut seen = HashSet::new();
        for idea in &self.ideas {
            if &idea.message_id != message_id {
                return Err(StoreError::ForeignIdea {
                    expected: message_id.clone(),
                    found: idea.message_id.clone(),
                });
            }
            if !seen.insert((idea.soft_chunk_index, idea.local_idea_index)) {
                return Err(StoreError::DuplicateAddress {
                    message_id: message_id.clone(),
                    soft_chunk_index: idea.soft_chunk_index,
                    local_idea_index: idea.local_idea_index,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub deleted: usize,
    pub inserted: usize,
}

/// Read-side filter over persisted ideas. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdeaQuery {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub action: Option<Action>,
    pub horizon: Option<TimeHorizon>,
    pub label: Option<IdeaLabel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl IdeaQuery {
    pub fn matches(&self, idea: &Idea) -> bool {
        if let Some(sym) = &self.symbol {
            let sym = sym.trim().trim_start_matches('$').to_ascii_uppercase();
            let hit = idea.symbols.iter().any(|s| *s == sym)
                || idea.model_only_symbols.iter().any(|s| *s == sym);
            if !hit {
                return false;
            }
        }
        if self.direction.is_some_and(|d| d != idea.direction) {
            return false;
        }
        if self.action.is_some() && self.action != idea.action {
            return false;
        }
        if self.horizon.is_some_and(|h| h != idea.time_horizon) {
            return false;
        }
        if self.label.is_some_and(|l| !idea.has_label(l)) {
            return false;
        }
        if self.since.is_some_and(|t| idea.message_created_at < t) {
            return false;
        }
        if self.until.is_some_and(|t| idea.message_created_at >= t) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait IdeaStore: Send + Sync {
    /// Intake: insert a new message as pending, or update an existing one.
    /// Unchanged text is a no-op; edited text resets the message to pending.
    /// Returns whether anything changed.
    async fn upsert_message(&self, message: Message) -> Result<bool, StoreError>;

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, StoreError>;

    /// Messages in `status`, oldest id first.
    async fn messages_by_status(
        &self,
        status: ParseStatus,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Atomic replace-set commit under the message's exclusive lock.
    async fn persist(
        &self,
        message_id: &MessageId,
        commit: MessageCommit,
    ) -> Result<PersistReport, StoreError>;

    /// Force a message back to pending; its ideas stay until the next commit.
    async fn reset_to_pending(&self, id: &MessageId) -> Result<(), StoreError>;

    /// Reset every terminal message whose prompt version differs from `current`.
    async fn reset_stale(&self, current_prompt_version: &str) -> Result<usize, StoreError>;

    async fn ideas_for_message(&self, id: &MessageId) -> Result<Vec<Idea>, StoreError>;

    /// Newest messages first; within a message, address order.
    async fn query_ideas(&self, query: &IdeaQuery) -> Result<Vec<Idea>, StoreError>;
}
