// tests/worker_pool.rs
//
// Background workers drain pending messages; shutdown abandons a message
// between chunks and leaves it pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use trade_idea_extractor::config::pipeline::{PipelineConfig, WorkerSection};
use trade_idea_extractor::config::Lexicon;
use trade_idea_extractor::model::mock::{heuristic_tiers, ScriptedTier};
use trade_idea_extractor::model::TierSet;
use trade_idea_extractor::store::{IdeaStore, MemoryStore};
use trade_idea_extractor::worker::WorkerPool;
use trade_idea_extractor::{Message, MessageId, ParseStatus, Pipeline};

fn message(id: &str, text: &str) -> Message {
    Message::new(
        id,
        "general",
        "erin",
        text,
        Utc.with_ymd_and_hms(2025, 7, 4, 15, 0, 0).unwrap(),
    )
}

fn fast_workers(count: usize) -> WorkerSection {
    WorkerSection {
        count,
        poll_interval_ms: 10,
        queue_depth: 4,
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_drain_every_pending_message() {
    let store = Arc::new(MemoryStore::new());
    let texts = [
        "I'm loading $AAPL calls, target 220",
        "gm everyone, coffee time",
        "!price NVDA",
        "Shorting $TSLA into earnings, stop 260",
        "Added more $MSFT on the dip",
        "",
    ];
    for (i, text) in texts.iter().enumerate() {
        store
            .upsert_message(message(&(3000 + i).to_string(), text))
            .await
            .unwrap();
    }
    let pipeline = Arc::new(Pipeline::new(
        &PipelineConfig::default(),
        Arc::new(Lexicon::embedded().unwrap()),
        heuristic_tiers(),
        store.clone(),
    ));

    let pool = WorkerPool::spawn(pipeline, &fast_workers(3));
    let probe = store.clone();
    wait_until(|| {
        let probe = probe.clone();
        async move {
            probe
                .messages_by_status(ParseStatus::Pending, 100)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    pool.shutdown().await;

    let status = |id: &str| {
        let store = store.clone();
        let id = MessageId::from(id);
        async move { store.message(&id).await.unwrap().unwrap().parse_status }
    };
    assert_eq!(status("3000").await, ParseStatus::Ok);
    assert_eq!(status("3001").await, ParseStatus::Noise);
    assert_eq!(status("3002").await, ParseStatus::Skipped);
    assert_eq!(status("3005").await, ParseStatus::Skipped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_between_chunks_leaves_message_pending() {
    let store = Arc::new(MemoryStore::new());
    let msg = message(
        "4000",
        "Bought NVDA at the open, looking higher.\n\nShorting TSLA into earnings, stop 260.",
    );
    store.upsert_message(msg.clone()).await.unwrap();

    let not_actionable =
        json!({ "actionable": false, "confidence": 0.9, "reason": null }).to_string();
    let triage = Arc::new(
        ScriptedTier::new("slow-triage")
            .then_ok(not_actionable.clone())
            .then_ok(not_actionable)
            .with_latency(Duration::from_millis(300)),
    );
    let tiers = TierSet {
        triage: triage.clone(),
        parse: Arc::new(ScriptedTier::new("parse")),
        escalation: Arc::new(ScriptedTier::new("escalation")),
    };
    let mut cfg = PipelineConfig::default();
    cfg.pipeline.max_chunk_chars = 64;
    let pipeline = Arc::new(Pipeline::new(
        &cfg,
        Arc::new(Lexicon::embedded().unwrap()),
        tiers,
        store.clone(),
    ));

    let pool = WorkerPool::spawn(pipeline, &fast_workers(1));
    let probe = triage.clone();
    wait_until(|| {
        let probe = probe.clone();
        async move { probe.calls() >= 1 }
    })
    .await;
    pool.shutdown().await;

    assert_eq!(triage.calls(), 1, "second chunk must not start after shutdown");
    let stored = store.message(&msg.id).await.unwrap().unwrap();
    assert_eq!(stored.parse_status, ParseStatus::Pending);
    assert!(stored.prompt_version.is_none());
}
