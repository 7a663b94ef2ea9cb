//! Skysieve live ingestion daemon.
//!
//! Consumes the Jetstream commit firehose, filters post creates through the
//! handle policy, and maintains the SQLite feed index.
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings (public Jetstream + PLC directory)
//! skysieve-ingest
//!
//! # Run with custom paths and a flipped policy
//! skysieve-ingest \
//!     --db-path /data/skysieve.db \
//!     --jetstream-url wss://jetstream1.us-west.bsky.network \
//!     --select-default-handles
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM stop the pump after the in-flight event
//! completes; the cursor checkpoint already reflects every applied event, so
//! the next start resumes where this one left off.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use metrics::gauge;
use skysieve_core::metrics::{init_metrics, start_metrics_server};
use skysieve_ingest::{
    CacheConfig, CommitSource, DEFAULT_JETSTREAM_URL, DEFAULT_PLC_DIRECTORY_URL, EventFilter,
    FilterConfig, HandleSelection, JetstreamConfig, JetstreamSource, PlcDirectoryResolver,
    PolicyConfig, PostPolicy, PostStore, PumpConfig, StreamPump,
};
use tracing_subscriber::EnvFilter;

/// Skysieve live ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "skysieve-ingest")]
#[command(about = "Jetstream post-filtering ingestion daemon")]
#[command(version)]
struct Args {
    /// SQLite path for the post index
    #[arg(long, default_value = "./data/skysieve.db")]
    db_path: PathBuf,

    /// Jetstream endpoint base URL
    #[arg(long, default_value = DEFAULT_JETSTREAM_URL)]
    jetstream_url: String,

    /// PLC directory base URL
    #[arg(long, default_value = DEFAULT_PLC_DIRECTORY_URL)]
    plc_directory_url: String,

    /// Override the saved stream cursor (time_us)
    #[arg(long)]
    cursor: Option<u64>,

    /// Identity lookup timeout in seconds
    #[arg(long, default_value = "10")]
    resolve_timeout_secs: u64,

    /// Seconds before a cached verdict is re-resolved
    #[arg(long, default_value = "86400")]
    refresh_after_secs: u64,

    /// Maximum number of cached author verdicts
    #[arg(long, default_value = "1000000")]
    cache_capacity: u64,

    /// Reject posts whose createdAt is older than this many hours
    #[arg(long, default_value = "24")]
    freshness_hours: i64,

    /// Handle suffixes counted as "default" (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = ".bsky.social,.brid.gy")]
    default_suffixes: Vec<String>,

    /// Select default-handle/bridged accounts instead of custom-handle ones
    #[arg(long)]
    select_default_handles: bool,

    /// Maximum identity lookups in flight per event
    #[arg(long, default_value = "8")]
    max_concurrent_resolves: usize,

    /// Write-set application attempts before giving up
    #[arg(long, default_value = "3")]
    store_retry_attempts: u32,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("skysieve_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Skysieve ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("ingest_running").set(1.0);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping after the in-flight event...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Open the post index and work out where to resume
    let store = Arc::new(
        PostStore::open(&args.db_path)
            .with_context(|| format!("Failed to open post index at {:?}", args.db_path))?,
    );
    let cursor = match args.cursor {
        Some(cursor) => Some(cursor),
        None => store.cursor().context("Failed to read saved cursor")?,
    };

    let selection = if args.select_default_handles {
        HandleSelection::DefaultHandles
    } else {
        HandleSelection::CustomHandles
    };

    tracing::info!("Configuration:");
    tracing::info!("  Index: {}", args.db_path.display());
    tracing::info!("  Jetstream: {}", args.jetstream_url);
    tracing::info!("  PLC directory: {}", args.plc_directory_url);
    tracing::info!(
        "  Cursor: {}",
        cursor.map_or("live".to_string(), |c| c.to_string())
    );
    tracing::info!("  Selection: {:?}", selection);
    tracing::info!("  Default suffixes: {:?}", args.default_suffixes);
    tracing::info!("  Freshness window: {}h", args.freshness_hours);

    // Assemble the pipeline
    let resolver = Arc::new(
        PlcDirectoryResolver::new(
            args.plc_directory_url,
            Duration::from_secs(args.resolve_timeout_secs),
        )
        .context("Failed to build PLC resolver")?,
    );

    let policy = PostPolicy::new(PolicyConfig {
        default_suffixes: args.default_suffixes,
        freshness_window: TimeDelta::hours(args.freshness_hours),
        selection,
    });

    let filter = EventFilter::new(
        policy,
        resolver,
        CacheConfig {
            refresh_after: Duration::from_secs(args.refresh_after_secs),
            max_capacity: args.cache_capacity,
        },
        FilterConfig {
            max_concurrent_resolves: args.max_concurrent_resolves,
        },
    );

    let pump = StreamPump::new(
        filter,
        Arc::clone(&store),
        PumpConfig {
            store_retry_attempts: args.store_retry_attempts,
            ..PumpConfig::default()
        },
        Arc::clone(&running),
    );

    let mut source = JetstreamSource::new(JetstreamConfig {
        endpoint: args.jetstream_url,
        cursor,
        ..JetstreamConfig::default()
    });

    // Run the ingestion loop
    tracing::info!("Starting live ingestion...");
    let result = pump.run(&mut source).await;

    // Shutdown sequence
    gauge!("ingest_running").set(0.0);
    let source_stats = source.stats();

    match result {
        Ok(stats) => {
            tracing::info!("═══════════════════════════════════════════════════════");
            tracing::info!("SHUTDOWN COMPLETE");
            tracing::info!("═══════════════════════════════════════════════════════");
            tracing::info!("Events processed:     {}", stats.events_processed);
            tracing::info!("Posts indexed:        {}", stats.posts_upserted);
            tracing::info!("Posts deleted:        {}", stats.posts_deleted);
            tracing::info!("Frames received:      {}", source_stats.total_frames);
            tracing::info!("Frames malformed:     {}", source_stats.malformed_frames);
            tracing::info!("Reconnects:           {}", source_stats.reconnects);
            tracing::info!(
                "Indexed rows total:   {}",
                store.post_count().unwrap_or_default()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Ingestion stopped on error: {}", e);
            Err(e.into())
        }
    }
}
