// src/pipeline.rs
//! Per-message orchestration: skip check, split, route every chunk, validate,
//! assemble the replace-set and commit it.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::candidates::{CandidateExtractor, CandidateSet};
use crate::config::{Lexicon, PipelineConfig};
use crate::error::StoreError;
use crate::idea::Idea;
use crate::message::{fingerprint, Message, MessageId, ParseStatus};
use crate::model::TierSet;
use crate::router::{ModelRouter, ParseOutcome};
use crate::splitter::{split_message, Chunk};
use crate::store::{IdeaStore, MessageCommit};
use crate::validator::Validator;

/// Work prepared for one message before any model is called.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    /// Terminal without model calls (empty text, bot command).
    Skip { reason: &'static str },
    Work(Vec<(Chunk, CandidateSet)>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageReport {
    pub message_id: MessageId,
    pub status: ParseStatus,
    pub chunks: usize,
    pub ideas: usize,
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Committed(MessageReport),
    /// Shutdown observed between chunks; nothing was written.
    Cancelled,
}

pub struct Pipeline {
    extractor: CandidateExtractor,
    validator: Validator,
    router: ModelRouter,
    store: Arc<dyn IdeaStore>,
    prompt_version: String,
    max_chunk_chars: usize,
}

impl Pipeline {
    pub fn new(
        cfg: &PipelineConfig,
        lexicon: Arc<Lexicon>,
        tiers: TierSet,
        store: Arc<dyn IdeaStore>,
    ) -> Self {
        Self {
            extractor: CandidateExtractor::new(lexicon.clone()),
            validator: Validator::new(lexicon, cfg.validator.clone()),
            router: ModelRouter::from_config(cfg, tiers),
            store,
            prompt_version: cfg.pipeline.prompt_version.clone(),
            max_chunk_chars: cfg.pipeline.max_chunk_chars,
        }
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    pub fn store(&self) -> &Arc<dyn IdeaStore> {
        &self.store
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn prepare(&self, message: &Message) -> Prepared {
        if message.text.trim().is_empty() {
            return Prepared::Skip {
                reason: "empty text",
            };
        }
        if self.extractor.is_bot_command(&message.text) {
            return Prepared::Skip {
                reason: "bot command",
            };
        }
        let candidates = self.extractor.extract_candidates(&message.text);
        let chunks = split_message(&message.id, &message.text, self.max_chunk_chars)
            .into_iter()
            .map(|chunk| {
                let local = candidates.within(chunk.span);
                (chunk, local)
            })
            .collect();
        Prepared::Work(chunks)
    }

    /// Validate every chunk outcome and fold them into one commit.
    ///
    /// Any chunk error makes the message `Error` (the other chunks' ideas are
    /// still kept); otherwise no surviving idea means `Noise`.
    pub fn assemble(
        &self,
        message: &Message,
        outcomes: Vec<(Chunk, CandidateSet, ParseOutcome)>,
    ) -> MessageCommit {
        let mut outcomes = outcomes;
        outcomes.sort_by_key(|(chunk, _, _)| chunk.index);

        let mut ideas: Vec<Idea> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for (chunk, candidates, outcome) in outcomes {
            match outcome {
                ParseOutcome::Noise => {}
                ParseOutcome::Error(reason) => {
                    errors.push(format!("chunk {}: {reason}", chunk.index))
                }
                ParseOutcome::Ideas(parsed) => {
                    let (valid, report) = self.validator.validate(parsed.ideas, &candidates);
                    if report != Default::default() {
                        debug!(
                            message_id = %message.id,
                            chunk = chunk.index,
                            dropped = ?report.dropped_symbols,
                            reserved = ?report.reserved_rejected,
                            model_only = ?report.model_only_symbols,
                            discarded = report.discarded_ideas,
                            "validator adjusted chunk"
                        );
                    }
                    for (local_idx, v) in valid.into_iter().enumerate() {
                        let raw = v.idea;
                        ideas.push(Idea {
                            message_id: message.id.clone(),
                            soft_chunk_index: chunk.index,
                            local_idea_index: local_idx as u32,
                            idea_text: raw.text,
                            idea_summary: raw.summary,
                            primary_symbol: raw.primary_symbol,
                            symbols: raw.symbols,
                            model_only_symbols: v.model_only_symbols,
                            instrument: raw.instrument,
                            direction: raw.direction,
                            action: raw.action,
                            time_horizon: raw.time_horizon,
                            trigger_condition: raw.trigger_condition,
                            levels: raw.levels,
                            labels: raw.labels,
                            confidence: raw.confidence,
                            model: parsed.model.clone(),
                            prompt_version: self.prompt_version.clone(),
                            raw_output: parsed.raw_output.clone(),
                            message_created_at: message.created_at,
                        });
                    }
                }
            }
        }

        let (status, error_reason) = if !errors.is_empty() {
            (ParseStatus::Error, Some(errors.join("; ")))
        } else if ideas.is_empty() {
            (ParseStatus::Noise, None)
        } else {
            (ParseStatus::Ok, None)
        };
        MessageCommit {
            status,
            error_reason,
            prompt_version: self.prompt_version.clone(),
            ideas,
        }
    }

    pub fn skip_commit(&self) -> MessageCommit {
        MessageCommit {
            status: ParseStatus::Skipped,
            error_reason: None,
            prompt_version: self.prompt_version.clone(),
            ideas: Vec::new(),
        }
    }

    pub async fn commit(
        &self,
        message: &Message,
        chunks: usize,
        commit: MessageCommit,
    ) -> Result<MessageReport, StoreError> {
        let status = commit.status;
        let error_reason = commit.error_reason.clone();
        let report = self.store.persist(&message.id, commit).await?;
        Ok(MessageReport {
            message_id: message.id.clone(),
            status,
            chunks,
            ideas: report.inserted,
            error_reason,
        })
    }

    /// Process one message to a terminal status.
    pub async fn process_message(&self, message: &Message) -> Result<MessageReport, StoreError> {
        let started = Instant::now();
        let chunks = match self.prepare(message) {
            Prepared::Skip { reason } => return self.commit_skip(message, reason).await,
            Prepared::Work(chunks) => chunks,
        };
        let mut outcomes = Vec::with_capacity(chunks.len());
        for (chunk, candidates) in chunks {
            let outcome = self.route(message, &chunk, &candidates).await;
            outcomes.push((chunk, candidates, outcome));
        }
        self.finish(message, outcomes, started).await
    }

    /// Like `process_message`, but checks `shutdown` between chunks. A cancelled
    /// message is left untouched (still pending) for the next run.
    pub async fn process_message_with_cancel(
        &self,
        message: &Message,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ProcessOutcome, StoreError> {
        let started = Instant::now();
        let chunks = match self.prepare(message) {
            Prepared::Skip { reason } => {
                let report = self.commit_skip(message, reason).await?;
                return Ok(ProcessOutcome::Committed(report));
            }
            Prepared::Work(chunks) => chunks,
        };

        let total = chunks.len();
        let mut outcomes = Vec::with_capacity(total);
        for (chunk, candidates) in chunks {
            if *shutdown.borrow() {
                info!(
                    message_id = %message.id,
                    done = outcomes.len(),
                    total,
                    "cancelled between chunks"
                );
                return Ok(ProcessOutcome::Cancelled);
            }
            let outcome = self.route(message, &chunk, &candidates).await;
            outcomes.push((chunk, candidates, outcome));
        }
        let report = self.finish(message, outcomes, started).await?;
        Ok(ProcessOutcome::Committed(report))
    }

    async fn route(
        &self,
        message: &Message,
        chunk: &Chunk,
        candidates: &CandidateSet,
    ) -> ParseOutcome {
        let outcome = self.router.route_chunk(&chunk.text, candidates).await;
        if let ParseOutcome::Error(reason) = &outcome {
            warn!(message_id = %message.id, chunk = chunk.index, %reason, "chunk failed");
        }
        outcome
    }

    async fn commit_skip(
        &self,
        message: &Message,
        reason: &str,
    ) -> Result<MessageReport, StoreError> {
        debug!(
            message_id = %message.id,
            fp = %fingerprint(&message.text),
            reason,
            "skipping message"
        );
        self.commit(message, 0, self.skip_commit()).await
    }

    async fn finish(
        &self,
        message: &Message,
        outcomes: Vec<(Chunk, CandidateSet, ParseOutcome)>,
        started: Instant,
    ) -> Result<MessageReport, StoreError> {
        let total = outcomes.len();
        let commit = self.assemble(message, outcomes);
        let report = self.commit(message, total, commit).await?;
        info!(
            message_id = %message.id,
            fp = %fingerprint(&message.text),
            status = %report.status,
            chunks = total,
            ideas = report.ideas,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "message processed"
        );
        Ok(report)
    }

    /// Forced reprocessing: back to pending, then a fresh run whose replace-set
    /// supersedes the previous one.
    pub async fn reprocess(&self, id: &MessageId) -> Result<MessageReport, StoreError> {
        self.store.reset_to_pending(id).await?;
        let message = self
            .store
            .message(id)
            .await?
            .ok_or_else(|| StoreError::UnknownMessage(id.clone()))?;
        self.process_message(&message).await
    }

    /// Drain up to `limit` pending messages sequentially.
    pub async fn process_pending(&self, limit: usize) -> Result<Vec<MessageReport>, StoreError> {
        let pending = self.store.messages_by_status(ParseStatus::Pending, limit).await?;
        let mut reports = Vec::with_capacity(pending.len());
        for message in &pending {
            reports.push(self.process_message(message).await?);
        }
        Ok(reports)
    }
}
