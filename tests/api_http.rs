// tests/api_http.rs
//
// HTTP-level tests for the public Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health, GET /metrics
// - POST /messages (new vs unchanged)
// - POST /messages/{id}/reprocess, GET /messages/{id}/ideas
// - GET /ideas filters and vocabulary errors
// - 404s for unknown messages
// - POST /admin/batch, GET /admin/batch, POST /admin/batch/{job}/ingest

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use trade_idea_extractor::{build_app, IdeaStore, Lexicon, MemoryStore, PipelineConfig};

const BODY_LIMIT: usize = 1024 * 1024;

/// Build the same Router the binary uses, over a fresh memory store.
fn test_router() -> Router {
    let cfg = PipelineConfig::default();
    let lexicon = Arc::new(Lexicon::embedded().expect("embedded lexicon"));
    let store: Arc<dyn IdeaStore> = Arc::new(MemoryStore::new());
    build_app(&cfg, lexicon, store).expect("build app").router
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Json) {
    let (status, bytes) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

async fn post_json(app: &Router, uri: &str, payload: Json) -> (StatusCode, Json) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("build POST");
    let (status, bytes) = send(app, req).await;
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

async fn post_empty(app: &Router, uri: &str) -> (StatusCode, Json) {
    let req = Request::post(uri).body(Body::empty()).unwrap();
    let (status, bytes) = send(app, req).await;
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

fn intake(id: &str, text: &str) -> Json {
    json!({
        "id": id,
        "channel": "options-flow",
        "author": "dana",
        "text": text,
        "created_at": "2025-10-01T14:30:00Z"
    })
}

#[tokio::test]
async fn health_returns_200_and_ok_body() {
    let app = test_router();
    let (status, bytes) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).unwrap().trim(), "OK");
}

#[tokio::test]
async fn intake_then_reprocess_exposes_ideas() {
    let app = test_router();

    let body = intake("5001", "I'm loading $AAPL calls, target 220");
    let (status, v) = post_json(&app, "/messages", body.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(v["changed"], json!(true));

    let (status, v) = post_json(&app, "/messages", body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["changed"], json!(false));

    let (status, pending) = get_json(&app, "/messages?status=pending").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().map(|a| a.len()), Some(1));

    let (status, report) = post_empty(&app, "/messages/5001/reprocess").await;
    assert_eq!(status, StatusCode::OK, "reprocess body: {report}");
    assert_eq!(report["status"], json!("ok"));
    assert_eq!(report["ideas"], json!(1));

    let (status, msg) = get_json(&app, "/messages/5001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(msg["parse_status"], json!("ok"));
    assert_eq!(msg["prompt_version"], json!("v1"));

    let (status, ideas) = get_json(&app, "/messages/5001/ideas").await;
    assert_eq!(status, StatusCode::OK);
    let ideas = ideas.as_array().expect("ideas array");
    assert_eq!(ideas.len(), 1);
    assert_eq!(ideas[0]["primary_symbol"], json!("AAPL"));
    assert_eq!(ideas[0]["soft_chunk_index"], json!(0));
    assert_eq!(ideas[0]["local_idea_index"], json!(0));

    let (status, found) = get_json(&app, "/ideas?symbol=aapl&direction=bullish").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().map(|a| a.len()), Some(1));

    let (status, none) = get_json(&app, "/ideas?symbol=TSLA").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(none, json!([]));
}

#[tokio::test]
async fn unknown_vocabulary_is_a_bad_request() {
    let app = test_router();
    let (status, v) = get_json(&app, "/ideas?direction=moon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v["error"].as_str().unwrap_or_default().contains("direction"));

    let (status, _) = get_json(&app, "/messages?status=done").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&app, "/messages", intake("  ", "hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_messages_are_404() {
    let app = test_router();
    for uri in ["/messages/404404", "/messages/404404/ideas"] {
        let (status, v) = get_json(&app, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(v.get("error").is_some());
    }
    let (status, _) = post_empty(&app, "/messages/404404/reprocess").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reset_stale_reports_prompt_version() {
    let app = test_router();
    let (status, v) = post_empty(&app, "/admin/reset-stale").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["reset"], json!(0));
    assert_eq!(v["prompt_version"], json!("v1"));
}

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let app = test_router();
    post_json(&app, "/messages", intake("5002", "Shorting $TSLA into earnings, stop 260")).await;
    let (status, _) = post_empty(&app, "/messages/5002/reprocess").await;
    assert_eq!(status, StatusCode::OK);

    let (status, bytes) = send(&app, Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    for needle in [
        "ideas_persisted_total",
        "messages_processed_total",
        "tier_calls_total",
        "pipeline_prompt_version_info",
    ] {
        assert!(text.contains(needle), "missing {needle} in /metrics");
    }
}

#[tokio::test]
async fn batch_submit_then_ingest_commits_pending_messages() {
    let app = test_router();
    post_json(&app, "/messages", intake("5101", "I'm loading $AAPL calls, target 220")).await;
    post_json(&app, "/messages", intake("5102", "!price NVDA")).await;

    let (status, job) = post_empty(&app, "/admin/batch").await;
    assert_eq!(status, StatusCode::ACCEPTED, "submit body: {job}");
    assert_eq!(job["messages"], json!(1));
    assert_eq!(job["requests"], json!(1));
    let job_id = job["job_id"].as_str().expect("job id").to_string();

    // the bot command never needed a model call
    let (_, skipped) = get_json(&app, "/messages/5102").await;
    assert_eq!(skipped["parse_status"], json!("skipped"));
    let (_, waiting) = get_json(&app, "/messages/5101").await;
    assert_eq!(waiting["parse_status"], json!("pending"));

    let (status, jobs) = get_json(&app, "/admin/batch").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().map(|a| a.len()), Some(1));

    let uri = format!("/admin/batch/{job_id}/ingest");
    let (status, report) = post_empty(&app, &uri).await;
    assert_eq!(status, StatusCode::OK, "ingest body: {report}");
    assert_eq!(report["results_seen"], json!(1));
    assert_eq!(report["committed"][0]["status"], json!("ok"));

    let (_, ideas) = get_json(&app, "/messages/5101/ideas").await;
    assert_eq!(ideas.as_array().map(|a| a.len()), Some(1));
    assert_eq!(ideas[0]["primary_symbol"], json!("AAPL"));

    let (status, _) = post_empty(&app, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_empty(&app, "/admin/batch").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, jobs) = get_json(&app, "/admin/batch").await;
    assert_eq!(jobs, json!([]));
}

#[tokio::test]
async fn ingesting_an_unknown_batch_job_is_404() {
    let app = test_router();
    let (status, v) = post_empty(&app, "/admin/batch/local-batch-999/ingest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(v["error"].as_str().unwrap_or_default().contains("local-batch-999"));
}
