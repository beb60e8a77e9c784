// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("tier_calls_total", "Model tier calls by tier and outcome.");
        describe_counter!(
            "tier_failures_total",
            "Terminal model tier failures by tier and error kind."
        );
        describe_histogram!(
            "tier_call_ms",
            "Model tier call latency in milliseconds, retries included."
        );
        describe_counter!(
            "escalations_total",
            "Chunks escalated to the strongest tier, by reason."
        );
        describe_counter!(
            "validator_dropped_symbols_total",
            "Model-proposed tickers dropped for lack of evidence or as reserved words."
        );
        describe_counter!(
            "validator_model_only_symbols_total",
            "Model-proposed tickers kept only through the alias table."
        );
        describe_counter!(
            "validator_discarded_ideas_total",
            "Ideas discarded because they ended up tickerless."
        );
        describe_counter!("ideas_persisted_total", "Ideas written by replace-set commits.");
        describe_counter!("messages_processed_total", "Messages committed, by final parse status.");
        describe_counter!(
            "message_lock_waits_total",
            "Commits that had to wait on a message lock."
        );
        describe_counter!(
            "batch_results_skipped_total",
            "Batch results skipped for malformed or unknown correlation ids."
        );
        describe_gauge!("worker_in_flight", "Messages currently claimed by the worker pool.");
        describe_gauge!(
            "pipeline_prompt_version_info",
            "Set to 1; the label carries the active prompt version."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder once per process and describe all series.
    pub fn init(prompt_version: &str) -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())?
            .clone();
        ensure_metrics_described();
        gauge!("pipeline_prompt_version_info", "prompt_version" => prompt_version.to_string())
            .set(1.0);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
