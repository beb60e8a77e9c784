// src/store/memory.rs
//! In-process `IdeaStore`.
//!
//! Messages and ideas live in two ordered maps behind `RwLock`s. A commit takes
//! the message's keyed lock, then both write guards (messages before ideas,
//! always in that order), and applies delete + insert + status in one critical
//! section, so readers see either the old set or the new one.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::idea::{Idea, IdeaAddress};
use crate::message::{fingerprint, Message, MessageId, ParseStatus};
use crate::store::lock::KeyedLocks;
use crate::store::{IdeaQuery, IdeaStore, MessageCommit, PersistReport};

#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: RwLock<BTreeMap<MessageId, Message>>,
    ideas: RwLock<BTreeMap<IdeaAddress, Idea>>,
    locks: KeyedLocks,
}

fn first_address(id: &MessageId) -> IdeaAddress {
    IdeaAddress {
        message_id: id.clone(),
        soft_chunk_index: 0,
        local_idea_index: 0,
    }
}

fn last_address(id: &MessageId) -> IdeaAddress {
    IdeaAddress {
        message_id: id.clone(),
        soft_chunk_index: u32::MAX,
        local_idea_index: u32::MAX,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_messages(
        &self,
    ) -> Result<RwLockReadGuard<'_, BTreeMap<MessageId, Message>>, StoreError> {
        self.messages.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_messages(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<MessageId, Message>>, StoreError> {
        self.messages.write().map_err(|_| StoreError::Poisoned)
    }

    fn read_ideas(&self) -> Result<RwLockReadGuard<'_, BTreeMap<IdeaAddress, Idea>>, StoreError> {
        self.ideas.read().map_err(|_| StoreError::Poisoned)
    }

    fn write_ideas(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<IdeaAddress, Idea>>, StoreError> {
        self.ideas.write().map_err(|_| StoreError::Poisoned)
    }

    pub fn idea_count(&self) -> usize {
        self.read_ideas().map(|m| m.len()).unwrap_or(0)
    }

    fn reset_locked(&self, id: &MessageId) -> Result<bool, StoreError> {
        let mut messages = self.write_messages()?;
        let msg = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMessage(id.clone()))?;
        let was_terminal = msg.parse_status.is_terminal();
        msg.parse_status = ParseStatus::Pending;
        msg.error_reason = None;
        Ok(was_terminal)
    }
}

#[async_trait]
impl IdeaStore for MemoryStore {
    async fn upsert_message(&self, message: Message) -> Result<bool, StoreError> {
        let _guard = self.locks.acquire(message.id.lock_key()).await;
        let mut messages = self.write_messages()?;
        match messages.get_mut(&message.id) {
            Some(existing) if existing.text == message.text => Ok(false),
            Some(existing) => {
                debug!(
                    message_id = %message.id,
                    fp = %fingerprint(&message.text),
                    "message edited, back to pending"
                );
                existing.text = message.text;
                existing.channel = message.channel;
                existing.author = message.author;
                existing.parse_status = ParseStatus::Pending;
                existing.error_reason = None;
                Ok(true)
            }
            None => {
                let mut message = message;
                message.parse_status = ParseStatus::Pending;
                message.error_reason = None;
                message.prompt_version = None;
                messages.insert(message.id.clone(), message);
                Ok(true)
            }
        }
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.read_messages()?.get(id).cloned())
    }

    async fn messages_by_status(
        &self,
        status: ParseStatus,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read_messages()?
            .values()
            .filter(|m| m.parse_status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn persist(
        &self,
        message_id: &MessageId,
        commit: MessageCommit,
    ) -> Result<PersistReport, StoreError> {
        commit.check(message_id)?;
        let _guard = self.locks.acquire(message_id.lock_key()).await;

        let mut messages = self.write_messages()?;
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.clone()))?;
        let mut ideas = self.write_ideas()?;

        let stale: Vec<IdeaAddress> = ideas
            .range(first_address(message_id)..=last_address(message_id))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &stale {
            ideas.remove(addr);
        }

        let inserted = commit.ideas.len();
        for idea in commit.ideas {
            ideas.insert(idea.address(), idea);
        }

        message.parse_status = commit.status;
        message.error_reason = commit.error_reason;
        message.prompt_version = Some(commit.prompt_version);

        counter!("ideas_persisted_total").increment(inserted as u64);
        counter!("messages_processed_total", "status" => commit.status.as_str()).increment(1);
        info!(
            message_id = %message_id,
            status = %commit.status,
            deleted = stale.len(),
            inserted,
            "replace-set committed"
        );
        Ok(PersistReport {
            deleted: stale.len(),
            inserted,
        })
    }

    async fn reset_to_pending(&self, id: &MessageId) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(id.lock_key()).await;
        self.reset_locked(id)?;
        Ok(())
    }

    async fn reset_stale(&self, current_prompt_version: &str) -> Result<usize, StoreError> {
        let stale: Vec<MessageId> = self
            .read_messages()?
            .values()
            .filter(|m| {
                m.parse_status.is_terminal()
                    && m.prompt_version.as_deref() != Some(current_prompt_version)
            })
            .map(|m| m.id.clone())
            .collect();

        let mut reset = 0;
        for id in stale {
            let _guard = self.locks.acquire(id.lock_key()).await;
            // re-check under the lock; a commit may have landed meanwhile
            let still_stale = self.read_messages()?.get(&id).is_some_and(|m| {
                m.parse_status.is_terminal()
                    && m.prompt_version.as_deref() != Some(current_prompt_version)
            });
            if still_stale && self.reset_locked(&id)? {
                reset += 1;
            }
        }
        info!(reset, prompt_version = current_prompt_version, "stale messages reset");
        Ok(reset)
    }

    async fn ideas_for_message(&self, id: &MessageId) -> Result<Vec<Idea>, StoreError> {
        Ok(self
            .read_ideas()?
            .range(first_address(id)..=last_address(id))
            .map(|(_, idea)| idea.clone())
            .collect())
    }

    async fn query_ideas(&self, query: &IdeaQuery) -> Result<Vec<Idea>, StoreError> {
        let mut out: Vec<Idea> = self
            .read_ideas()?
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        // newest message first, address order within a message
        out.sort_by(|a, b| {
            b.message_created_at
                .cmp(&a.message_created_at)
                .then_with(|| b.message_id.cmp(&a.message_id))
                .then_with(|| a.address().cmp(&b.address()))
        });
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
