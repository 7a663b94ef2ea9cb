//! Per-author verdict cache with single-flight resolution.
//!
//! The cache answers one question — is this author accepted? — while holding
//! two invariants the pipeline depends on:
//!
//! - **At most one lookup in flight per DID.** A burst of creates by one
//!   author (within an event or across adjacent events) coalesces onto a
//!   single directory round-trip; every caller gets the same verdict. Cold
//!   misses coalesce through moka's `try_get_with`; background refreshes are
//!   deduplicated by a refreshing-set guard.
//! - **Transient failures cache nothing.** A timeout or outage rejects the
//!   author's creates for the current event only; the next event mentioning
//!   the author retries. Only `NotFound` is definitive and caches a deny, so
//!   authors without an identity record don't hammer the directory.
//!
//! Verdicts older than `refresh_after` are served immediately while a
//! background re-resolution replaces them (stale-while-revalidate); entries
//! that outlive twice that interval are evicted outright by the cache TTL, so
//! a refresh that keeps failing eventually forces a cold lookup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use moka::future::Cache;
use parking_lot::Mutex;

use crate::policy::PostPolicy;
use crate::resolve::{DidResolver, ResolveError};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Verdicts older than this are stale and re-resolved on next access.
    pub refresh_after: Duration,
    /// Maximum number of cached verdicts. Authors beyond the cap cost extra
    /// directory lookups, never unbounded memory.
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_after: Duration::from_secs(24 * 60 * 60),
            max_capacity: 1_000_000,
        }
    }
}

/// A cached accept/deny decision for one author.
#[derive(Debug, Clone)]
pub struct IdentityVerdict {
    /// The author this verdict is for.
    pub did: String,
    /// Whether the author's posts are accepted.
    pub accepted: bool,
    /// When the verdict was produced.
    pub resolved_at: Instant,
}

impl IdentityVerdict {
    /// Produce a verdict stamped now.
    pub fn new(did: &str, accepted: bool) -> Self {
        Self {
            did: did.to_string(),
            accepted,
            resolved_at: Instant::now(),
        }
    }
}

/// Author-verdict cache in front of a [`DidResolver`].
pub struct IdentityCache<R> {
    verdicts: Cache<String, IdentityVerdict>,
    /// DIDs with a background refresh in flight.
    refreshing: Arc<Mutex<HashSet<String>>>,
    resolver: Arc<R>,
    policy: Arc<PostPolicy>,
    refresh_after: Duration,
}

impl<R: DidResolver + 'static> IdentityCache<R> {
    /// Create a cache over the given resolver and policy.
    pub fn new(config: CacheConfig, resolver: Arc<R>, policy: Arc<PostPolicy>) -> Self {
        let verdicts = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.refresh_after.saturating_mul(2))
            .build();

        Self {
            verdicts,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            resolver,
            policy,
            refresh_after: config.refresh_after,
        }
    }

    /// Get the author's verdict, resolving if necessary.
    ///
    /// Returns immediately on a cached verdict (stale ones are served while a
    /// background refresh runs). A miss performs one coalesced resolution;
    /// transient resolver errors propagate without caching anything.
    pub async fn get_or_resolve(&self, did: &str) -> Result<IdentityVerdict, ResolveError> {
        if let Some(verdict) = self.verdicts.get(did).await {
            if verdict.resolved_at.elapsed() < self.refresh_after {
                counter!("identity_cache_hits_total").increment(1);
                return Ok(verdict);
            }
            self.spawn_refresh(did);
            counter!("identity_cache_stale_served_total").increment(1);
            return Ok(verdict);
        }

        self.resolve_and_cache(did).await
    }

    /// Number of cached verdicts.
    pub async fn entry_count(&self) -> u64 {
        self.verdicts.run_pending_tasks().await;
        self.verdicts.entry_count()
    }

    /// Coalesced cold-path resolution: one resolver call no matter how many
    /// concurrent callers ask for the same DID.
    async fn resolve_and_cache(&self, did: &str) -> Result<IdentityVerdict, ResolveError> {
        let resolver = Arc::clone(&self.resolver);
        let policy = Arc::clone(&self.policy);
        let owned_did = did.to_string();

        self.verdicts
            .try_get_with(
                did.to_string(),
                async move { resolve_verdict(&*resolver, &policy, &owned_did).await },
            )
            .await
            .map_err(|e: Arc<ResolveError>| (*e).clone())
    }

    /// Start a background re-resolution for a stale DID, at most one at a
    /// time per DID. A failed refresh keeps the stale verdict.
    fn spawn_refresh(&self, did: &str) {
        if !self.refreshing.lock().insert(did.to_string()) {
            return;
        }

        let verdicts = self.verdicts.clone();
        let refreshing = Arc::clone(&self.refreshing);
        let resolver = Arc::clone(&self.resolver);
        let policy = Arc::clone(&self.policy);
        let did = did.to_string();

        tokio::spawn(async move {
            match resolve_verdict(&*resolver, &policy, &did).await {
                Ok(verdict) => {
                    tracing::debug!(did = %did, accepted = verdict.accepted, "identity verdict refreshed");
                    verdicts.insert(did.clone(), verdict).await;
                }
                Err(e) => {
                    tracing::warn!(did = %did, error = %e, "identity refresh failed, keeping stale verdict");
                }
            }
            refreshing.lock().remove(&did);
        });
    }
}

/// One resolver round-trip mapped to a verdict. `NotFound` is a deny verdict,
/// not an error; transient failures pass through.
async fn resolve_verdict<R: DidResolver>(
    resolver: &R,
    policy: &PostPolicy,
    did: &str,
) -> Result<IdentityVerdict, ResolveError> {
    match resolver.resolve(did).await {
        Ok(doc) => {
            let accepted = policy.verdict_for(&doc);
            tracing::debug!(did = %did, accepted, aliases = ?doc.also_known_as, "identity resolved");
            Ok(IdentityVerdict::new(did, accepted))
        }
        Err(e) if e.is_definitive() => {
            tracing::debug!(did = %did, "no identity record, caching deny");
            Ok(IdentityVerdict::new(did, false))
        }
        Err(e) => {
            counter!("resolver_errors_total", "kind" => e.kind()).increment(1);
            Err(e)
        }
    }
}
