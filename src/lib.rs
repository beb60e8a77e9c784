// src/lib.rs
// Public library surface for the service binary and integration tests.

pub mod api;
pub mod batch;
pub mod candidates;
pub mod config;
pub mod error;
pub mod idea;
pub mod message;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod router;
pub mod splitter;
pub mod store;
pub mod text;
pub mod validator;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::batch::{BatchOrchestrator, LocalBatchFacility};
use crate::model::{build_tiers, RetryPolicy};

pub use crate::config::{Lexicon, PipelineConfig};
pub use crate::idea::Idea;
pub use crate::message::{Message, MessageId, ParseStatus};
pub use crate::pipeline::Pipeline;
pub use crate::store::{IdeaStore, MemoryStore};

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// `RUST_LOG` overrides the default filter. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("trade_idea_extractor=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

/// Assembled service: HTTP router plus the pipeline behind it.
pub struct App {
    pub router: Router,
    pub pipeline: Arc<Pipeline>,
}

/// Wire config, lexicon and store into a pipeline, its batch orchestrator and
/// the HTTP surface (including `/metrics`). Workers are started separately.
pub fn build_app(
    cfg: &PipelineConfig,
    lexicon: Arc<Lexicon>,
    store: Arc<dyn IdeaStore>,
) -> anyhow::Result<App> {
    let metrics = crate::metrics::Metrics::init(&cfg.pipeline.prompt_version)?;
    let tiers = build_tiers(cfg)?;
    let parse_tier = tiers.parse.clone();
    let pipeline = Arc::new(Pipeline::new(cfg, lexicon.clone(), tiers, store));

    let facility = LocalBatchFacility::new(
        parse_tier,
        RetryPolicy::from_config(&cfg.retry, &cfg.tiers),
        cfg.batch.page_size,
        rand::random(),
    );
    let batch = BatchOrchestrator::new(
        pipeline.clone(),
        Arc::new(facility),
        cfg.batch.max_requests,
    );
    info!(
        prompt_version = %cfg.pipeline.prompt_version,
        lexicon_version = lexicon.version(),
        reserved = lexicon.reserved_len(),
        aliases = lexicon.alias_len(),
        provider = %cfg.tiers.provider,
        batch_max_requests = cfg.batch.max_requests,
        "pipeline ready"
    );
    let router = api::create_router(api::AppState {
        pipeline: pipeline.clone(),
        batch: Arc::new(batch),
        batch_jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    })
    .merge(metrics.router());
    Ok(App { router, pipeline })
}

/// Default in-process app: config and lexicon from disk/env, memory store.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = PipelineConfig::load()?;
    let lexicon = Arc::new(Lexicon::load()?);
    let store: Arc<dyn IdeaStore> = Arc::new(MemoryStore::new());
    Ok(build_app(&cfg, lexicon, store)?.router)
}
