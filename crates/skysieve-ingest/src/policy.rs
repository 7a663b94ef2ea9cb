//! Acceptance policy for post creates.
//!
//! Two layers, both pure:
//!
//! - [`PostPolicy::verdict_for`] decides per *author*, from the resolved DID
//!   document: does the primary alias sit on one of the default-handle
//!   suffixes, and which side of that line does the feed select? This is the
//!   predicate the identity cache memoizes.
//! - [`PostPolicy::evaluate`] decides per *post*: replies and posts older than
//!   the freshness window are rejected outright; everything else follows the
//!   author verdict.

use chrono::{DateTime, TimeDelta, Utc};
use skysieve_core::CreateOp;

use crate::cache::IdentityVerdict;
use crate::resolve::DidDocument;

/// Which side of the default-suffix line the feed selects.
///
/// The suffix match itself is fixed; this flips its interpretation without a
/// code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleSelection {
    /// Accept authors whose primary alias does NOT end in a default suffix,
    /// i.e. accounts that customized their handle. Excludes default-handle
    /// and bridged accounts.
    #[default]
    CustomHandles,
    /// The inverse: accept only default-handle and bridged accounts.
    DefaultHandles,
}

/// Policy configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Handle suffixes counted as "default" (e.g. `.bsky.social`, `.brid.gy`).
    pub default_suffixes: Vec<String>,
    /// Posts whose claimed `createdAt` is older than this are rejected.
    pub freshness_window: TimeDelta,
    /// Acceptance polarity for the suffix predicate.
    pub selection: HandleSelection,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_suffixes: vec![".bsky.social".to_string(), ".brid.gy".to_string()],
            freshness_window: TimeDelta::hours(24),
            selection: HandleSelection::default(),
        }
    }
}

/// Why a create was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The post is a reply.
    Reply,
    /// The post's claimed creation time is outside the freshness window.
    Expired,
    /// The author's cached verdict denies.
    AuthorDenied,
}

impl RejectReason {
    /// Metric label for this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Expired => "expired",
            Self::AuthorDenied => "author_denied",
        }
    }
}

/// Outcome of evaluating one create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Index the post.
    Accept,
    /// Skip the post.
    Reject(RejectReason),
}

/// The acceptance policy. Pure; no I/O, no clock of its own.
#[derive(Debug, Clone)]
pub struct PostPolicy {
    config: PolicyConfig,
}

impl PostPolicy {
    /// Create a policy from configuration.
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// The author-level predicate: accept or deny from the resolved aliases.
    ///
    /// An empty alias list always denies; an author the directory cannot name
    /// is never accepted.
    pub fn verdict_for(&self, doc: &DidDocument) -> bool {
        let Some(primary) = doc.primary_alias() else {
            return false;
        };
        let on_default_suffix = self
            .config
            .default_suffixes
            .iter()
            .any(|suffix| primary.ends_with(suffix.as_str()));

        match self.config.selection {
            HandleSelection::CustomHandles => !on_default_suffix,
            HandleSelection::DefaultHandles => on_default_suffix,
        }
    }

    /// The post-level decision, given the author's cached verdict.
    pub fn evaluate(
        &self,
        op: &CreateOp,
        verdict: &IdentityVerdict,
        now: DateTime<Utc>,
    ) -> Decision {
        if op.is_reply {
            return Decision::Reject(RejectReason::Reply);
        }
        if op.created_at < now - self.config.freshness_window {
            return Decision::Reject(RejectReason::Expired);
        }
        if verdict.accepted {
            Decision::Accept
        } else {
            Decision::Reject(RejectReason::AuthorDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(aliases: &[&str]) -> DidDocument {
        DidDocument {
            also_known_as: aliases.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn create_op(created_at: DateTime<Utc>, is_reply: bool) -> CreateOp {
        CreateOp {
            uri: "at://did:plc:a1/app.bsky.feed.post/3kab".to_string(),
            cid: "bafyreia".to_string(),
            author_did: "did:plc:a1".to_string(),
            created_at,
            is_reply,
        }
    }

    fn verdict(accepted: bool) -> IdentityVerdict {
        IdentityVerdict::new("did:plc:a1", accepted)
    }

    // =========================================================================
    // Author predicate
    // =========================================================================

    #[test]
    fn test_custom_handle_accepted() {
        let policy = PostPolicy::new(PolicyConfig::default());
        assert!(policy.verdict_for(&doc(&["at://alice.example.com"])));
    }

    #[test]
    fn test_default_handle_denied() {
        let policy = PostPolicy::new(PolicyConfig::default());
        assert!(!policy.verdict_for(&doc(&["at://bob.bsky.social"])));
    }

    #[test]
    fn test_bridged_handle_denied() {
        let policy = PostPolicy::new(PolicyConfig::default());
        assert!(!policy.verdict_for(&doc(&["at://carol.example.com.ap.brid.gy"])));
    }

    #[test]
    fn test_only_primary_alias_considered() {
        // A default-suffix alias in a later position does not deny.
        let policy = PostPolicy::new(PolicyConfig::default());
        assert!(policy.verdict_for(&doc(&["at://alice.example.com", "at://alice.bsky.social"])));
        // And a custom alias in a later position does not rescue.
        assert!(!policy.verdict_for(&doc(&["at://alice.bsky.social", "at://alice.example.com"])));
    }

    #[test]
    fn test_empty_alias_list_denies() {
        let policy = PostPolicy::new(PolicyConfig::default());
        assert!(!policy.verdict_for(&doc(&[])));
    }

    #[test]
    fn test_empty_alias_list_denies_under_either_polarity() {
        let policy = PostPolicy::new(PolicyConfig {
            selection: HandleSelection::DefaultHandles,
            ..PolicyConfig::default()
        });
        assert!(!policy.verdict_for(&doc(&[])));
    }

    #[test]
    fn test_polarity_flip() {
        let policy = PostPolicy::new(PolicyConfig {
            selection: HandleSelection::DefaultHandles,
            ..PolicyConfig::default()
        });
        assert!(!policy.verdict_for(&doc(&["at://alice.example.com"])));
        assert!(policy.verdict_for(&doc(&["at://bob.bsky.social"])));
    }

    // =========================================================================
    // Post decision
    // =========================================================================

    #[test]
    fn test_fresh_post_accepted_author_follows_verdict() {
        let policy = PostPolicy::new(PolicyConfig::default());
        let now = Utc::now();
        let op = create_op(now - TimeDelta::minutes(5), false);

        assert_eq!(policy.evaluate(&op, &verdict(true), now), Decision::Accept);
        assert_eq!(
            policy.evaluate(&op, &verdict(false), now),
            Decision::Reject(RejectReason::AuthorDenied)
        );
    }

    #[test]
    fn test_reply_rejected_regardless_of_verdict() {
        let policy = PostPolicy::new(PolicyConfig::default());
        let now = Utc::now();
        let op = create_op(now - TimeDelta::minutes(5), true);
        assert_eq!(
            policy.evaluate(&op, &verdict(true), now),
            Decision::Reject(RejectReason::Reply)
        );
    }

    #[test]
    fn test_expired_post_rejected_regardless_of_verdict() {
        let policy = PostPolicy::new(PolicyConfig::default());
        let now = Utc::now();
        let op = create_op(now - TimeDelta::hours(25), false);
        assert_eq!(
            policy.evaluate(&op, &verdict(true), now),
            Decision::Reject(RejectReason::Expired)
        );
    }

    #[test]
    fn test_post_just_inside_freshness_window_accepted() {
        let policy = PostPolicy::new(PolicyConfig::default());
        let now = Utc::now();
        let op = create_op(now - TimeDelta::hours(23), false);
        assert_eq!(policy.evaluate(&op, &verdict(true), now), Decision::Accept);
    }
}
