// src/batch.rs
//! Batch Orchestrator: submit main-parse work for many chunks to an
//! asynchronous batch facility and ingest the results whenever they come back.
//!
//! Every request carries a correlation id `"{message_id}#{chunk_index}"`. The
//! facility may return results in any order, split over pages, duplicated or
//! with garbage ids; ingestion groups by message and produces the same
//! replace-sets no matter how the results arrive.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::candidates::CandidateSet;
use crate::error::{BatchError, TierError};
use crate::message::{Message, MessageId, ParseStatus};
use crate::model::{DynTier, RetryPolicy, TierKind, TierRequest, TierResponse};
use crate::pipeline::{MessageReport, Pipeline, Prepared};
use crate::router::ParseOutcome;
use crate::splitter::Chunk;

/// `(message_id, chunk_index)` encoded as `"{message_id}#{chunk_index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId {
    pub message_id: MessageId,
    pub chunk_index: u32,
}

impl CorrelationId {
    pub fn new(message_id: MessageId, chunk_index: u32) -> Self {
        Self {
            message_id,
            chunk_index,
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Split on the last `#`, so ids that themselves contain `#` survive.
    pub fn decode(raw: &str) -> Option<Self> {
        let (id, idx) = raw.trim().rsplit_once('#')?;
        if id.trim().is_empty() {
            return None;
        }
        let chunk_index = idx.parse::<u32>().ok()?;
        Some(Self::new(MessageId::new(id), chunk_index))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.message_id, self.chunk_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub request: TierRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchResultOutcome {
    Succeeded { model: String, raw: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub custom_id: String,
    pub outcome: BatchResultOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPage {
    pub results: Vec<BatchResult>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    InProgress,
    Ended,
}

#[async_trait]
pub trait BatchFacility: Send + Sync {
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<String, BatchError>;

    async fn status(&self, job_id: &str) -> Result<BatchJobStatus, BatchError>;

    /// One page of results; `cursor` comes from the previous page.
    async fn results_page(
        &self,
        job_id: &str,
        cursor: Option<&str>,
    ) -> Result<ResultPage, BatchError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Snapshot taken at submit time.
    pub message: Message,
    pub chunks: Vec<(Chunk, CandidateSet)>,
}

/// What was submitted, enough to ingest results without re-deriving anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub prompt_version: String,
    pub created_at: DateTime<Utc>,
    pub entries: BTreeMap<MessageId, ManifestEntry>,
}

impl BatchManifest {
    pub fn request_count(&self) -> usize {
        self.entries.values().map(|e| e.chunks.len()).sum()
    }

    fn chunk(&self, id: &CorrelationId) -> Option<&(Chunk, CandidateSet)> {
        self.entries
            .get(&id.message_id)?
            .chunks
            .iter()
            .find(|(c, _)| c.index == id.chunk_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub manifest: BatchManifest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub results_seen: usize,
    pub skipped_malformed: usize,
    pub skipped_unknown: usize,
    pub duplicates: usize,
    pub stale_messages: usize,
    pub committed: Vec<MessageReport>,
}

/// Deterministic pick between two results for the same correlation id:
/// success beats failure, then the greater payload wins.
fn prefer(a: BatchResultOutcome, b: BatchResultOutcome) -> BatchResultOutcome {
    use BatchResultOutcome::*;
    match (&a, &b) {
        (Succeeded { .. }, Failed { .. }) => a,
        (Failed { .. }, Succeeded { .. }) => b,
        (Succeeded { raw: ra, model: ma }, Succeeded { raw: rb, model: mb }) => {
            if (ra, ma) >= (rb, mb) {
                a
            } else {
                b
            }
        }
        (Failed { error: ea }, Failed { error: eb }) => {
            if ea >= eb {
                a
            } else {
                b
            }
        }
    }
}

pub struct BatchOrchestrator {
    pipeline: Arc<Pipeline>,
    facility: Arc<dyn BatchFacility>,
    max_requests: usize,
}

impl BatchOrchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        facility: Arc<dyn BatchFacility>,
        max_requests: usize,
    ) -> Self {
        Self {
            pipeline,
            facility,
            max_requests: max_requests.max(1),
        }
    }

    /// Collect pending messages into a manifest plus one request per chunk.
    /// Messages that need no model call are committed as skipped right away.
    /// A message is never split across batches.
    pub async fn build_manifest(
        &self,
        limit: usize,
    ) -> Result<(BatchManifest, Vec<BatchRequest>), BatchError> {
        let store = self.pipeline.store();
        let pending = store.messages_by_status(ParseStatus::Pending, limit).await?;
        let router = self.pipeline.router();

        let mut entries = BTreeMap::new();
        let mut requests = Vec::new();
        for message in pending {
            let chunks = match self.pipeline.prepare(&message) {
                Prepared::Skip { .. } => {
                    self.pipeline
                        .commit(&message, 0, self.pipeline.skip_commit())
                        .await?;
                    continue;
                }
                Prepared::Work(chunks) => chunks,
            };
            if !requests.is_empty() && requests.len() + chunks.len() > self.max_requests {
                break;
            }
            for (chunk, candidates) in &chunks {
                let id = CorrelationId::new(message.id.clone(), chunk.index);
                requests.push(BatchRequest {
                    custom_id: id.encode(),
                    request: router.request(TierKind::Parse, &chunk.text, candidates),
                });
            }
            entries.insert(message.id.clone(), ManifestEntry { message, chunks });
        }

        let manifest = BatchManifest {
            prompt_version: self.pipeline.prompt_version().to_string(),
            created_at: Utc::now(),
            entries,
        };
        Ok((manifest, requests))
    }

    /// Build and submit a batch. `None` when nothing is pending.
    pub async fn submit(&self, limit: usize) -> Result<Option<BatchJob>, BatchError> {
        let (manifest, requests) = self.build_manifest(limit).await?;
        if requests.is_empty() {
            return Ok(None);
        }
        let count = requests.len();
        let job_id = self.facility.submit(requests).await?;
        info!(
            job_id = %job_id,
            requests = count,
            messages = manifest.entries.len(),
            "batch submitted"
        );
        Ok(Some(BatchJob { job_id, manifest }))
    }

    pub async fn poll(&self, job: &BatchJob) -> Result<BatchJobStatus, BatchError> {
        self.facility.status(&job.job_id).await
    }

    /// Fetch every page of a finished job and ingest it.
    pub async fn ingest(&self, job: &BatchJob) -> Result<IngestReport, BatchError> {
        if self.poll(job).await? != BatchJobStatus::Ended {
            return Err(BatchError::NotReady(job.job_id.clone()));
        }
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .facility
                .results_page(&job.job_id, cursor.as_deref())
                .await?;
            results.extend(page.results);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        self.ingest_results(&job.manifest, results).await
    }

    /// Order-independent ingestion of raw results against a manifest.
    pub async fn ingest_results<I>(
        &self,
        manifest: &BatchManifest,
        results: I,
    ) -> Result<IngestReport, BatchError>
    where
        I: IntoIterator<Item = BatchResult>,
    {
        let mut report = IngestReport::default();
        let mut by_chunk: HashMap<CorrelationId, BatchResultOutcome> = HashMap::new();

        for result in results {
            report.results_seen += 1;
            let Some(id) = CorrelationId::decode(&result.custom_id) else {
                report.skipped_malformed += 1;
                counter!("batch_results_skipped_total", "reason" => "malformed").increment(1);
                warn!(
                    custom_id = %result.custom_id,
                    "skipping batch result with malformed correlation id"
                );
                continue;
            };
            if manifest.chunk(&id).is_none() {
                report.skipped_unknown += 1;
                counter!("batch_results_skipped_total", "reason" => "unknown").increment(1);
                warn!(custom_id = %result.custom_id, "skipping batch result for unknown chunk");
                continue;
            }
            let merged = match by_chunk.remove(&id) {
                Some(prev) => {
                    report.duplicates += 1;
                    prefer(prev, result.outcome)
                }
                None => result.outcome,
            };
            by_chunk.insert(id, merged);
        }

        let store = self.pipeline.store();
        let router = self.pipeline.router();
        for (message_id, entry) in &manifest.entries {
            // edited since submit: the snapshot no longer describes the message
            let current = store.message(message_id).await?;
            if current.as_ref().map(|m| &m.text) != Some(&entry.message.text) {
                report.stale_messages += 1;
                warn!(
                    message_id = %message_id,
                    "message changed since batch submit, not committing"
                );
                continue;
            }

            let mut outcomes = Vec::with_capacity(entry.chunks.len());
            for (chunk, candidates) in &entry.chunks {
                let id = CorrelationId::new(message_id.clone(), chunk.index);
                let outcome = match by_chunk.remove(&id) {
                    Some(BatchResultOutcome::Succeeded { model, raw }) => {
                        router
                            .resolve_parse(&chunk.text, candidates, Ok(TierResponse { model, raw }))
                            .await
                    }
                    Some(BatchResultOutcome::Failed { error }) => {
                        ParseOutcome::Error(format!("batch: {error}"))
                    }
                    None => ParseOutcome::Error("batch: no result for chunk".to_string()),
                };
                outcomes.push((chunk.clone(), candidates.clone(), outcome));
            }

            let commit = self.pipeline.assemble(&entry.message, outcomes);
            let committed = self
                .pipeline
                .commit(&entry.message, entry.chunks.len(), commit)
                .await?;
            report.committed.push(committed);
        }

        info!(
            seen = report.results_seen,
            malformed = report.skipped_malformed,
            unknown = report.skipped_unknown,
            duplicates = report.duplicates,
            committed = report.committed.len(),
            "batch ingested"
        );
        Ok(report)
    }
}

/// In-process batch facility: runs every request through a tier at submit
/// time and serves the results in shuffled pages, the way a real facility
/// returns them in no particular order.
pub struct LocalBatchFacility {
    tier: DynTier,
    retry: RetryPolicy,
    page_size: usize,
    seed: u64,
    next_job: AtomicU64,
    jobs: Mutex<HashMap<String, Vec<BatchResult>>>,
}

impl LocalBatchFacility {
    pub fn new(tier: DynTier, retry: RetryPolicy, page_size: usize, seed: u64) -> Self {
        Self {
            tier,
            retry,
            page_size: page_size.max(1),
            seed,
            next_job: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

fn poisoned() -> BatchError {
    BatchError::Facility(TierError::Unavailable("job table poisoned".into()))
}

#[async_trait]
impl BatchFacility for LocalBatchFacility {
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<String, BatchError> {
        let job_no = self.next_job.fetch_add(1, AtomicOrdering::SeqCst);
        let job_id = format!("local-batch-{job_no}");

        let mut results = Vec::with_capacity(requests.len());
        for req in requests {
            let outcome = match self.retry.call(self.tier.as_ref(), &req.request).await {
                Ok(resp) => BatchResultOutcome::Succeeded {
                    model: resp.model,
                    raw: resp.raw,
                },
                Err(e) => BatchResultOutcome::Failed {
                    error: e.to_string(),
                },
            };
            results.push(BatchResult {
                custom_id: req.custom_id,
                outcome,
            });
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ job_no);
        results.shuffle(&mut rng);

        self.jobs
            .lock()
            .map_err(|_| poisoned())?
            .insert(job_id.clone(), results);
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<BatchJobStatus, BatchError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| poisoned())?;
        if jobs.contains_key(job_id) {
            Ok(BatchJobStatus::Ended)
        } else {
            Err(BatchError::UnknownJob(job_id.to_string()))
        }
    }

    async fn results_page(
        &self,
        job_id: &str,
        cursor: Option<&str>,
    ) -> Result<ResultPage, BatchError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| poisoned())?;
        let results = jobs
            .get(job_id)
            .ok_or_else(|| BatchError::UnknownJob(job_id.to_string()))?;
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(results.len());
        let page = results.get(start..end).unwrap_or_default().to_vec();
        Ok(ResultPage {
            results: page,
            next_cursor: (end < results.len()).then(|| end.to_string()),
        })
    }
}
