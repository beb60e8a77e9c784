// tests/persistence.rs
//
// Replace-set semantics of the store: idempotent commits, rejection of bad
// commits, last-writer-wins under concurrency, intake and stale resets.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use trade_idea_extractor::error::StoreError;
use trade_idea_extractor::idea::{
    Direction, Idea, IdeaLabel, InstrumentKind, LabelScore, TimeHorizon,
};
use trade_idea_extractor::store::{IdeaQuery, IdeaStore, MemoryStore, MessageCommit};
use trade_idea_extractor::{Message, MessageId, ParseStatus};

fn message(id: &str, text: &str) -> Message {
    Message::new(
        id,
        "desk",
        "bob",
        text,
        Utc.with_ymd_and_hms(2025, 9, 15, 9, 0, 0).unwrap(),
    )
}

fn idea(id: &str, chunk: u32, local: u32, symbol: &str, tag: &str) -> Idea {
    Idea {
        message_id: MessageId::from(id),
        soft_chunk_index: chunk,
        local_idea_index: local,
        idea_text: format!("{symbol} {tag}"),
        idea_summary: None,
        primary_symbol: Some(symbol.to_string()),
        symbols: vec![symbol.to_string()],
        model_only_symbols: vec![],
        instrument: InstrumentKind::Equity,
        direction: Direction::Bullish,
        action: None,
        time_horizon: TimeHorizon::Unknown,
        trigger_condition: None,
        levels: vec![],
        labels: vec![LabelScore {
            label: IdeaLabel::TradePlan,
            confidence: 0.8,
        }],
        confidence: 0.8,
        model: "test".to_string(),
        prompt_version: "v1".to_string(),
        raw_output: "{}".to_string(),
        message_created_at: Utc.with_ymd_and_hms(2025, 9, 15, 9, 0, 0).unwrap(),
    }
}

fn ok_commit(ideas: Vec<Idea>) -> MessageCommit {
    MessageCommit {
        status: ParseStatus::Ok,
        error_reason: None,
        prompt_version: "v1".to_string(),
        ideas,
    }
}

async fn store_with(ids: &[&str]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in ids {
        store.upsert_message(message(id, "some text")).await.unwrap();
    }
    store
}

#[tokio::test]
async fn identical_commits_are_idempotent() {
    let store = store_with(&["10"]).await;
    let id = MessageId::from("10");
    let set = vec![idea("10", 0, 0, "AAPL", "a"), idea("10", 0, 1, "MSFT", "a")];

    let first = store.persist(&id, ok_commit(set.clone())).await.unwrap();
    assert_eq!((first.deleted, first.inserted), (0, 2));
    let second = store.persist(&id, ok_commit(set.clone())).await.unwrap();
    assert_eq!((second.deleted, second.inserted), (2, 2));

    assert_eq!(store.ideas_for_message(&id).await.unwrap(), set);
    assert_eq!(store.idea_count(), 2);
}

#[tokio::test]
async fn commit_never_touches_other_messages() {
    let store = store_with(&["10", "11"]).await;
    store
        .persist(&MessageId::from("11"), ok_commit(vec![idea("11", 0, 0, "TSLA", "x")]))
        .await
        .unwrap();
    store
        .persist(&MessageId::from("10"), ok_commit(vec![]))
        .await
        .unwrap();
    assert_eq!(
        store.ideas_for_message(&MessageId::from("11")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn bad_commits_are_rejected_without_side_effects() {
    let store = store_with(&["20"]).await;
    let id = MessageId::from("20");
    store
        .persist(&id, ok_commit(vec![idea("20", 0, 0, "AAPL", "keep")]))
        .await
        .unwrap();

    let foreign = store
        .persist(&id, ok_commit(vec![idea("21", 0, 0, "AAPL", "x")]))
        .await;
    assert!(matches!(foreign, Err(StoreError::ForeignIdea { .. })));

    let dup = store
        .persist(
            &id,
            ok_commit(vec![idea("20", 0, 0, "AAPL", "x"), idea("20", 0, 0, "MSFT", "x")]),
        )
        .await;
    assert!(matches!(dup, Err(StoreError::DuplicateAddress { .. })));

    let pending = store
        .persist(
            &id,
            MessageCommit {
                status: ParseStatus::Pending,
                error_reason: None,
                prompt_version: "v1".into(),
                ideas: vec![],
            },
        )
        .await;
    assert!(matches!(pending, Err(StoreError::NonTerminalCommit(_))));

    let unknown = store
        .persist(&MessageId::from("99"), ok_commit(vec![]))
        .await;
    assert!(matches!(unknown, Err(StoreError::UnknownMessage(_))));

    let ideas = store.ideas_for_message(&id).await.unwrap();
    assert_eq!(ideas.len(), 1);
    assert_eq!(ideas[0].idea_text, "AAPL keep");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_leave_exactly_one_complete_set() {
    let store = store_with(&["30"]).await;
    let id = MessageId::from("30");

    let mut handles = Vec::new();
    for writer in 0..16u32 {
        let store = store.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let tag = format!("w{writer}");
            let count = 1 + writer % 4;
            let set = (0..count)
                .map(|i| idea("30", i / 2, i % 2, "NVDA", &tag))
                .collect();
            store.persist(&id, ok_commit(set)).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let ideas = store.ideas_for_message(&id).await.unwrap();
    assert!(!ideas.is_empty());
    let tag = ideas[0].idea_text.clone();
    assert!(ideas.iter().all(|i| i.idea_text == tag), "mixed sets: {ideas:?}");
    let writer: u32 = tag.trim_start_matches("NVDA w").parse().unwrap();
    assert_eq!(ideas.len() as u32, 1 + writer % 4);
}

#[tokio::test]
async fn upsert_distinguishes_noop_from_edit() {
    let store = MemoryStore::new();
    let id = MessageId::from("40");
    assert!(store.upsert_message(message("40", "first")).await.unwrap());
    store.persist(&id, ok_commit(vec![])).await.unwrap();

    assert!(!store.upsert_message(message("40", "first")).await.unwrap());
    assert_eq!(
        store.message(&id).await.unwrap().unwrap().parse_status,
        ParseStatus::Ok
    );

    assert!(store.upsert_message(message("40", "first, edited")).await.unwrap());
    let m = store.message(&id).await.unwrap().unwrap();
    assert_eq!(m.parse_status, ParseStatus::Pending);
    assert_eq!(m.text, "first, edited");
}

#[tokio::test]
async fn reset_stale_only_touches_old_prompt_versions() {
    let store = store_with(&["50", "51", "52"]).await;
    let mut old = ok_commit(vec![idea("50", 0, 0, "AMD", "old")]);
    old.prompt_version = "v0".into();
    old.ideas[0].prompt_version = "v0".into();
    store.persist(&MessageId::from("50"), old).await.unwrap();
    store
        .persist(&MessageId::from("51"), ok_commit(vec![]))
        .await
        .unwrap();

    assert_eq!(store.reset_stale("v1").await.unwrap(), 1);
    let statuses: Vec<_> = ["50", "51", "52"]
        .iter()
        .map(|id| MessageId::from(*id))
        .collect();
    let mut got = Vec::new();
    for id in &statuses {
        got.push(store.message(id).await.unwrap().unwrap().parse_status);
    }
    assert_eq!(
        got,
        vec![ParseStatus::Pending, ParseStatus::Ok, ParseStatus::Pending]
    );
    // ideas survive until the next commit replaces them
    assert_eq!(
        store.ideas_for_message(&MessageId::from("50")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn query_filters_by_symbol_and_label() {
    let store = store_with(&["60", "61"]).await;
    let mut tickerless = idea("61", 0, 0, "SPY", "macro");
    tickerless.primary_symbol = None;
    tickerless.symbols = vec![];
    tickerless.labels = vec![LabelScore {
        label: IdeaLabel::MarketView,
        confidence: 0.7,
    }];
    store
        .persist(&MessageId::from("60"), ok_commit(vec![idea("60", 0, 0, "AAPL", "a")]))
        .await
        .unwrap();
    store
        .persist(&MessageId::from("61"), ok_commit(vec![tickerless]))
        .await
        .unwrap();

    let by_symbol = store
        .query_ideas(&IdeaQuery {
            symbol: Some("$aapl".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_symbol.len(), 1);
    assert_eq!(by_symbol[0].message_id, MessageId::from("60"));

    let macro_views = store
        .query_ideas(&IdeaQuery {
            label: Some(IdeaLabel::MarketView),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(macro_views.len(), 1);
    assert!(macro_views[0].symbols.is_empty());
}
