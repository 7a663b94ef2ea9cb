//! Per-event filtering: commit event in, write-set out.
//!
//! Deletes pass straight through (no policy applies to a deletion). Creates
//! are evaluated concurrently — each needs the author's verdict, which may
//! cost a directory round-trip — under a semaphore so one busy event cannot
//! saturate the resolver. Every create settles independently: a slow or
//! failed lookup for one author rejects only that author's creates and never
//! aborts siblings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use skysieve_core::{CommitEvent, CreateOp, IndexedPost, PostOp, WriteSet};
use tokio::sync::Semaphore;

use crate::cache::{CacheConfig, IdentityCache};
use crate::policy::{Decision, PostPolicy};
use crate::resolve::DidResolver;

/// Filter configuration.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Maximum identity lookups in flight for one event's creates.
    pub max_concurrent_resolves: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_resolves: 8,
        }
    }
}

/// Turns commit events into write-sets using the policy and identity cache.
pub struct EventFilter<R> {
    cache: IdentityCache<R>,
    policy: Arc<PostPolicy>,
    resolve_slots: Semaphore,
}

impl<R: DidResolver + 'static> EventFilter<R> {
    /// Create a filter owning its identity cache.
    pub fn new(
        policy: PostPolicy,
        resolver: Arc<R>,
        cache_config: CacheConfig,
        config: FilterConfig,
    ) -> Self {
        let policy = Arc::new(policy);
        Self {
            cache: IdentityCache::new(cache_config, resolver, Arc::clone(&policy)),
            policy,
            resolve_slots: Semaphore::new(config.max_concurrent_resolves),
        }
    }

    /// Process one commit event into its write-set.
    ///
    /// Never fails: per-author resolution errors reject that author's creates
    /// for this event (they retry on the author's next event) and are logged.
    pub async fn process(&self, event: &CommitEvent) -> WriteSet {
        let mut to_delete = Vec::new();
        let mut creates: Vec<&CreateOp> = Vec::new();

        for op in &event.ops {
            match op {
                PostOp::Delete { uri } => to_delete.push(uri.clone()),
                PostOp::Create(create) => creates.push(create),
            }
        }

        if !to_delete.is_empty() {
            counter!("filter_posts_deleted_total").increment(to_delete.len() as u64);
        }

        let now = Utc::now();
        let evaluations = creates
            .into_iter()
            .map(|create| self.evaluate_create(create, now));
        let to_upsert = join_all(evaluations).await.into_iter().flatten().collect();

        WriteSet {
            to_upsert,
            to_delete,
        }
    }

    /// Number of verdicts currently cached.
    pub async fn cached_verdicts(&self) -> u64 {
        self.cache.entry_count().await
    }

    async fn evaluate_create(&self, op: &CreateOp, now: DateTime<Utc>) -> Option<IndexedPost> {
        // The semaphore is never closed, so acquire only fails at shutdown
        let _permit = self.resolve_slots.acquire().await.ok()?;

        let verdict = match self.cache.get_or_resolve(&op.author_did).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(
                    did = %op.author_did,
                    uri = %op.uri,
                    error = %e,
                    "identity resolution failed, rejecting create for this event"
                );
                counter!("filter_posts_rejected_total", "reason" => "resolve_failed").increment(1);
                return None;
            }
        };

        match self.policy.evaluate(op, &verdict, now) {
            Decision::Accept => {
                tracing::debug!(uri = %op.uri, did = %op.author_did, "post accepted");
                counter!("filter_posts_accepted_total").increment(1);
                Some(IndexedPost {
                    uri: op.uri.clone(),
                    cid: op.cid.clone(),
                    indexed_at: now,
                })
            }
            Decision::Reject(reason) => {
                tracing::trace!(uri = %op.uri, did = %op.author_did, reason = reason.as_str(), "post rejected");
                counter!("filter_posts_rejected_total", "reason" => reason.as_str()).increment(1);
                None
            }
        }
    }
}
