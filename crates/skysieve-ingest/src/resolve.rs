//! DID document resolution against the PLC directory.
//!
//! An author's DID resolves to a DID document whose `alsoKnownAs` field lists
//! the handles the author claims, primary first (as `at://` URIs). The policy
//! only needs that list, so [`DidDocument`] carries nothing else.
//!
//! [`DidResolver`] is the seam the identity cache works through: production
//! uses [`PlcDirectoryResolver`] (one HTTP round-trip per lookup, bounded by a
//! client-level timeout), tests use in-memory doubles.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::Deserialize;
use thiserror::Error;

use crate::error;

/// Default public PLC directory endpoint.
pub const DEFAULT_PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// Errors from a single identity lookup.
///
/// Only [`NotFound`](ResolveError::NotFound) is a definitive answer about the
/// author; the rest are transient and must not be cached, so the next event
/// mentioning the author retries the lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The directory has no record for this DID.
    #[error("no identity record for {did}")]
    NotFound {
        /// The DID that was looked up.
        did: String,
    },

    /// The lookup did not complete within the configured timeout.
    #[error("identity lookup timed out for {did}")]
    Timeout {
        /// The DID that was looked up.
        did: String,
    },

    /// The response body was not a decodable DID document.
    #[error("malformed identity record for {did}: {reason}")]
    Malformed {
        /// The DID that was looked up.
        did: String,
        /// Decode failure detail.
        reason: String,
    },

    /// Transport or server failure.
    #[error("identity directory unavailable for {did}: {reason}")]
    Unavailable {
        /// The DID that was looked up.
        did: String,
        /// Failure detail.
        reason: String,
    },
}

impl ResolveError {
    /// Metric label for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::Malformed { .. } => "malformed",
            Self::Unavailable { .. } => "unavailable",
        }
    }

    /// True if this error is a definitive answer about the author rather than
    /// a transient failure. Definitive errors cache a deny verdict.
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The subset of a DID document the policy consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// Claimed handles as `at://` URIs, primary first.
    #[serde(default)]
    pub also_known_as: Vec<String>,
}

impl DidDocument {
    /// The author's primary alias, if any.
    pub fn primary_alias(&self) -> Option<&str> {
        self.also_known_as.first().map(String::as_str)
    }
}

/// A resolver of author DIDs to their DID documents.
pub trait DidResolver: Send + Sync {
    /// Resolve one DID. A single lookup; retries are the caller's concern.
    fn resolve(
        &self,
        did: &str,
    ) -> impl Future<Output = Result<DidDocument, ResolveError>> + Send;
}

/// Resolver backed by a PLC directory over HTTP.
pub struct PlcDirectoryResolver {
    client: reqwest::Client,
    base_url: String,
}

impl PlcDirectoryResolver {
    /// Create a resolver for the directory at `base_url` with a per-request
    /// timeout. The timeout covers the whole round-trip including body read.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("skysieve/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| error::Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl DidResolver for PlcDirectoryResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolveError> {
        counter!("resolver_lookups_total").increment(1);

        let url = format!("{}/{}", self.base_url, did);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ResolveError::Timeout {
                    did: did.to_string(),
                }
            } else {
                ResolveError::Unavailable {
                    did: did.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound {
                did: did.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ResolveError::Unavailable {
                did: did.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        response.json::<DidDocument>().await.map_err(|e| {
            if e.is_timeout() {
                ResolveError::Timeout {
                    did: did.to_string(),
                }
            } else {
                ResolveError::Malformed {
                    did: did.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // DID document parsing
    // =========================================================================

    #[test]
    fn test_did_document_parse() {
        let json = r#"{
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "alsoKnownAs": ["at://alice.example.com", "at://alice.bsky.social"],
            "verificationMethod": [],
            "service": []
        }"#;
        let doc: DidDocument = serde_json::from_str(json).unwrap();
        assert_eq!(
            doc.also_known_as,
            vec!["at://alice.example.com", "at://alice.bsky.social"]
        );
        assert_eq!(doc.primary_alias(), Some("at://alice.example.com"));
    }

    #[test]
    fn test_did_document_missing_aliases() {
        let doc: DidDocument = serde_json::from_str(r#"{"id":"did:plc:abc"}"#).unwrap();
        assert!(doc.also_known_as.is_empty());
        assert_eq!(doc.primary_alias(), None);
    }

    #[test]
    fn test_did_document_not_an_object_fails() {
        assert!(serde_json::from_str::<DidDocument>("[1,2,3]").is_err());
    }

    // =========================================================================
    // Error taxonomy
    // =========================================================================

    #[test]
    fn test_only_not_found_is_definitive() {
        let did = "did:plc:abc".to_string();
        assert!(ResolveError::NotFound { did: did.clone() }.is_definitive());
        assert!(!ResolveError::Timeout { did: did.clone() }.is_definitive());
        assert!(
            !ResolveError::Malformed {
                did: did.clone(),
                reason: "bad".to_string()
            }
            .is_definitive()
        );
        assert!(
            !ResolveError::Unavailable {
                did,
                reason: "connection refused".to_string()
            }
            .is_definitive()
        );
    }

    #[test]
    fn test_error_kinds() {
        let did = "did:plc:abc".to_string();
        assert_eq!(ResolveError::NotFound { did: did.clone() }.kind(), "not_found");
        assert_eq!(ResolveError::Timeout { did }.kind(), "timeout");
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let resolver =
            PlcDirectoryResolver::new("https://plc.directory/", Duration::from_secs(5)).unwrap();
        assert_eq!(resolver.base_url, "https://plc.directory");
    }
}
