//! The pipeline drive loop.
//!
//! One event at a time: pull the next envelope from the source, filter it
//! into a write-set, apply the write-set (with bounded retry), then advance
//! the persisted cursor. The cursor only moves after a successful apply, so
//! a crash or exhausted retry replays the event on restart — safe, because
//! the store's deletes and upserts are idempotent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use skysieve_core::WriteSet;

use crate::error::Result;
use crate::filter::EventFilter;
use crate::resolve::DidResolver;
use crate::source::CommitSource;
use crate::store::PostStore;

/// Pump configuration.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Write-set application attempts before the event fails.
    pub store_retry_attempts: u32,

    /// Backoff before the first retry; doubles per attempt.
    pub store_retry_backoff: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Statistics from a pump run.
#[derive(Debug, Clone, Copy, Default)]
pub struct PumpStats {
    /// Events pulled from the source.
    pub events_processed: u64,

    /// Rows handed to the store for insertion.
    pub posts_upserted: u64,

    /// Deletions handed to the store.
    pub posts_deleted: u64,
}

/// Drives the source → filter → store loop.
pub struct StreamPump<R> {
    filter: EventFilter<R>,
    store: Arc<PostStore>,
    config: PumpConfig,
    running: Arc<AtomicBool>,
}

impl<R: DidResolver + 'static> StreamPump<R> {
    /// Create a pump. Clearing `running` stops the loop after the in-flight
    /// event completes.
    pub fn new(
        filter: EventFilter<R>,
        store: Arc<PostStore>,
        config: PumpConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            filter,
            store,
            config,
            running,
        }
    }

    /// Run until the source ends, the running flag clears, or a write-set
    /// exhausts its retries.
    ///
    /// On a retry-exhausted store failure the error is returned WITHOUT
    /// advancing the cursor: the failed event replays on restart.
    pub async fn run<S: CommitSource>(&self, source: &mut S) -> Result<PumpStats> {
        let mut stats = PumpStats::default();
        tracing::info!(source = source.name(), "pump started");

        while self.running.load(Ordering::SeqCst) {
            let Some(envelope) = source.next_event().await? else {
                tracing::info!(source = source.name(), "source exhausted");
                break;
            };
            counter!("ingest_events_total").increment(1);

            let write_set = self.filter.process(&envelope.event).await;
            if !write_set.is_empty() {
                self.apply_with_retry(&write_set).await?;
                stats.posts_upserted += write_set.to_upsert.len() as u64;
                stats.posts_deleted += write_set.to_delete.len() as u64;
            }

            self.store.set_cursor(envelope.cursor)?;
            gauge!("ingest_cursor").set(envelope.cursor as f64);

            stats.events_processed += 1;
            if stats.events_processed.is_multiple_of(1000) {
                gauge!("identity_cache_entries").set(self.filter.cached_verdicts().await as f64);
            }
        }

        gauge!("identity_cache_entries").set(self.filter.cached_verdicts().await as f64);
        Ok(stats)
    }

    async fn apply_with_retry(&self, write_set: &WriteSet) -> Result<()> {
        let mut backoff = self.config.store_retry_backoff;
        let mut attempt = 1u32;

        loop {
            match self.store.apply(write_set) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.store_retry_attempts => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "write-set apply failed, retrying"
                    );
                    counter!("store_apply_retries_total").increment(1);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        attempts = attempt,
                        error = %e,
                        "write-set apply failed, giving up without advancing cursor"
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::filter::FilterConfig;
    use crate::policy::{PolicyConfig, PostPolicy};
    use crate::resolve::{DidDocument, ResolveError};
    use crate::source::SourceStats;
    use chrono::{TimeDelta, Utc};
    use skysieve_core::{CommitEnvelope, CommitEvent, CreateOp, PostOp};
    use std::collections::VecDeque;

    struct StaticResolver;

    impl DidResolver for StaticResolver {
        async fn resolve(&self, did: &str) -> std::result::Result<DidDocument, ResolveError> {
            match did {
                "did:plc:custom" => Ok(DidDocument {
                    also_known_as: vec!["at://alice.example.com".to_string()],
                }),
                "did:plc:default" => Ok(DidDocument {
                    also_known_as: vec!["at://bob.bsky.social".to_string()],
                }),
                _ => Err(ResolveError::NotFound {
                    did: did.to_string(),
                }),
            }
        }
    }

    /// Source that drains a fixed queue of envelopes, then ends.
    struct QueueSource {
        queue: VecDeque<CommitEnvelope>,
        stats: SourceStats,
    }

    impl QueueSource {
        fn new(envelopes: Vec<CommitEnvelope>) -> Self {
            Self {
                queue: envelopes.into(),
                stats: SourceStats::default(),
            }
        }
    }

    impl CommitSource for QueueSource {
        fn name(&self) -> &'static str {
            "queue"
        }

        async fn next_event(&mut self) -> Result<Option<CommitEnvelope>> {
            let envelope = self.queue.pop_front();
            if envelope.is_some() {
                self.stats.total_frames += 1;
                self.stats.decoded_events += 1;
            }
            Ok(envelope)
        }

        fn stats(&self) -> SourceStats {
            self.stats
        }
    }

    fn pump() -> (StreamPump<StaticResolver>, Arc<PostStore>) {
        let filter = EventFilter::new(
            PostPolicy::new(PolicyConfig::default()),
            Arc::new(StaticResolver),
            CacheConfig::default(),
            FilterConfig::default(),
        );
        let store = Arc::new(PostStore::open_in_memory().unwrap());
        let pump = StreamPump::new(
            filter,
            Arc::clone(&store),
            PumpConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );
        (pump, store)
    }

    fn create_envelope(cursor: u64, did: &str, rkey: &str) -> CommitEnvelope {
        let uri = format!("at://{did}/app.bsky.feed.post/{rkey}");
        CommitEnvelope {
            event: CommitEvent {
                repo: did.to_string(),
                ops: vec![PostOp::Create(CreateOp {
                    uri: uri.clone(),
                    cid: format!("cid-{rkey}"),
                    author_did: did.to_string(),
                    created_at: Utc::now() - TimeDelta::minutes(1),
                    is_reply: false,
                })],
            },
            cursor,
        }
    }

    fn delete_envelope(cursor: u64, did: &str, rkey: &str) -> CommitEnvelope {
        CommitEnvelope {
            event: CommitEvent {
                repo: did.to_string(),
                ops: vec![PostOp::Delete {
                    uri: format!("at://{did}/app.bsky.feed.post/{rkey}"),
                }],
            },
            cursor,
        }
    }

    // =========================================================================
    // End-to-end pump runs
    // =========================================================================

    #[tokio::test]
    async fn test_accepted_posts_indexed_and_cursor_advanced() {
        let (pump, store) = pump();
        let mut source = QueueSource::new(vec![
            create_envelope(10, "did:plc:custom", "1"),
            create_envelope(20, "did:plc:default", "1"),
            create_envelope(30, "did:plc:custom", "2"),
        ]);

        let stats = pump.run(&mut source).await.unwrap();

        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.posts_upserted, 2);
        assert_eq!(store.post_count().unwrap(), 2);
        assert!(
            store
                .get_post("at://did:plc:custom/app.bsky.feed.post/1")
                .unwrap()
                .is_some()
        );
        // Denied author's post is absent
        assert!(
            store
                .get_post("at://did:plc:default/app.bsky.feed.post/1")
                .unwrap()
                .is_none()
        );
        // Cursor reflects the last event even though it produced no writes
        assert_eq!(store.cursor().unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_cursor_advances_past_rejected_events() {
        let (pump, store) = pump();
        let mut source = QueueSource::new(vec![create_envelope(42, "did:plc:default", "1")]);

        pump.run(&mut source).await.unwrap();

        assert_eq!(store.post_count().unwrap(), 0);
        assert_eq!(store.cursor().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_delete_then_later_event_removes_row() {
        let (pump, store) = pump();
        let mut source = QueueSource::new(vec![
            create_envelope(1, "did:plc:custom", "1"),
            delete_envelope(2, "did:plc:custom", "1"),
        ]);

        let stats = pump.run(&mut source).await.unwrap();

        assert_eq!(stats.posts_deleted, 1);
        assert_eq!(store.post_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replayed_events_are_idempotent() {
        let (pump, store) = pump();

        let mut first = QueueSource::new(vec![create_envelope(1, "did:plc:custom", "1")]);
        pump.run(&mut first).await.unwrap();

        // The same event delivered again (e.g. restart before cursor write)
        let mut replay = QueueSource::new(vec![create_envelope(1, "did:plc:custom", "1")]);
        pump.run(&mut replay).await.unwrap();

        assert_eq!(store.post_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stopped_pump_processes_nothing() {
        let filter = EventFilter::new(
            PostPolicy::new(PolicyConfig::default()),
            Arc::new(StaticResolver),
            CacheConfig::default(),
            FilterConfig::default(),
        );
        let store = Arc::new(PostStore::open_in_memory().unwrap());
        let pump = StreamPump::new(
            filter,
            Arc::clone(&store),
            PumpConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );

        let mut source = QueueSource::new(vec![create_envelope(1, "did:plc:custom", "1")]);
        let stats = pump.run(&mut source).await.unwrap();

        assert_eq!(stats.events_processed, 0);
        assert_eq!(store.cursor().unwrap(), None);
    }
}
