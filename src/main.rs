//! Trade-idea extraction service: binary entrypoint.
//! Boots the Axum HTTP surface and the background worker pool.

use std::sync::Arc;

use shuttle_axum::ShuttleAxum;
use tracing::info;

use trade_idea_extractor::worker::WorkerPool;
use trade_idea_extractor::{
    build_app, init_tracing, IdeaStore, Lexicon, MemoryStore, PipelineConfig,
};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::load()?;
    let lexicon = Arc::new(Lexicon::load()?);
    let store: Arc<dyn IdeaStore> = Arc::new(MemoryStore::new());
    let app = build_app(&cfg, lexicon, store)?;

    let pool = WorkerPool::spawn(app.pipeline.clone(), &cfg.workers);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        pool.shutdown().await;
    });

    Ok(app.router.into())
}
