//! Prometheus metrics helpers for the Skysieve pipeline.
//!
//! Centralizes recorder installation and the metric descriptions used across
//! components, and serves the `/metrics` endpoint.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `filter_`, `resolver_`, `store_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used only where cardinality is small and bounded (e.g. reject
//!   reason, resolver error kind)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus metrics recorder.
///
/// Must be called once at startup, before any metrics are recorded. Returns a
/// handle for [`start_metrics_server`].
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already
/// installed instead of panicking. Useful in tests.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Serve the `/metrics` endpoint on the given port.
///
/// Spawns a background task and returns immediately.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server exited: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the pipeline's metrics.
fn register_metrics() {
    // Stream ingestion
    describe_counter!("ingest_events_total", "Commit events consumed from the stream");
    describe_counter!(
        "ingest_events_malformed_total",
        "Stream frames that failed to decode"
    );
    describe_gauge!("ingest_running", "Whether ingestion is running (1=yes, 0=no)");
    describe_gauge!("ingest_cursor", "Last acknowledged stream cursor");
    describe_counter!(
        "ingest_reconnects_total",
        "Stream reconnection attempts after connection loss"
    );

    // Event filter
    describe_counter!("filter_posts_accepted_total", "Post creates accepted by policy");
    describe_counter!(
        "filter_posts_rejected_total",
        "Post creates rejected (label: reason)"
    );
    describe_counter!("filter_posts_deleted_total", "Post deletes passed through");

    // Identity resolution
    describe_counter!(
        "resolver_lookups_total",
        "Identity directory lookups performed"
    );
    describe_counter!(
        "resolver_errors_total",
        "Identity directory lookups that failed (label: kind)"
    );
    describe_counter!(
        "identity_cache_hits_total",
        "Verdicts served from the identity cache"
    );
    describe_counter!(
        "identity_cache_stale_served_total",
        "Stale verdicts served while a background refresh ran"
    );
    describe_gauge!("identity_cache_entries", "Verdicts in the identity cache");

    // Post store
    describe_counter!("store_posts_upserted_total", "Rows inserted into the post index");
    describe_counter!("store_posts_deleted_total", "Rows deleted from the post index");
    describe_counter!(
        "store_apply_retries_total",
        "Write-set applications retried after a storage failure"
    );
}
