//! Commit-event data model and Jetstream frame decoding.
//!
//! A [`CommitEvent`] is one ordered unit from the repository event stream: a
//! batch of create/delete operations against post records in a single
//! repository. Jetstream delivers one operation per wire frame; the model
//! still carries a `Vec` of operations so the filter handles multi-op events
//! uniformly.
//!
//! Frames for other event kinds (`identity`, `account`), other collections,
//! and record updates decode to `None` — they carry nothing this pipeline
//! indexes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::POST_COLLECTION;

/// A commit event together with the stream cursor that acknowledges it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEnvelope {
    /// The decoded commit event.
    pub event: CommitEvent,
    /// Opaque stream position (Jetstream `time_us`). Persisting it after the
    /// event is applied makes restarts resume without loss.
    pub cursor: u64,
}

/// An atomic batch of post-record operations from one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// DID of the repository the commit belongs to.
    pub repo: String,
    /// Operations in arrival order.
    pub ops: Vec<PostOp>,
}

/// A single operation on a post record.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOp {
    /// A post record was created.
    Create(CreateOp),
    /// A post record was deleted.
    Delete {
        /// Record URI of the deleted post.
        uri: String,
    },
}

/// A post-record creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOp {
    /// Globally unique `at://` record URI.
    pub uri: String,
    /// Content hash of the record body.
    pub cid: String,
    /// DID of the post author.
    pub author_did: String,
    /// Author-claimed creation time from the record body.
    pub created_at: DateTime<Utc>,
    /// Whether the record is a reply to another post.
    pub is_reply: bool,
}

/// A post row as persisted in the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPost {
    /// Record URI, the natural key.
    pub uri: String,
    /// Record CID.
    pub cid: String,
    /// When this pipeline indexed the post.
    pub indexed_at: DateTime<Utc>,
}

/// The storage mutations derived from one commit event.
///
/// Deletes are applied before upserts, so a delete and re-create of the same
/// URI within one event leaves the row present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    /// Rows to insert (insert-if-absent on `uri`).
    pub to_upsert: Vec<IndexedPost>,
    /// Record URIs to delete (no-op if absent).
    pub to_delete: Vec<String>,
}

impl WriteSet {
    /// True if the write-set mutates nothing.
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_delete.is_empty()
    }
}

/// Construct an `at://` record URI from its components.
pub fn record_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{did}/{collection}/{rkey}")
}

// ═══════════════════════════════════════════════════════════════════════════
// Jetstream wire format
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct Frame {
    did: String,
    time_us: u64,
    kind: String,
    #[serde(default)]
    commit: Option<FrameCommit>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
enum FrameCommit {
    Create {
        collection: String,
        rkey: String,
        cid: Option<String>,
        record: Option<PostRecord>,
    },
    Update {
        #[allow(dead_code)]
        collection: String,
    },
    Delete {
        collection: String,
        rkey: String,
    },
}

/// The subset of `app.bsky.feed.post` record fields the policy needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    created_at: String,
    #[serde(default)]
    reply: Option<serde_json::Value>,
}

/// Decode one Jetstream frame into a commit envelope.
///
/// Returns `Ok(None)` for frames that are well-formed but carry nothing to
/// index: non-commit kinds, collections other than [`POST_COLLECTION`], and
/// record updates (the index keys on URI; an update changes neither URI nor
/// acceptance).
///
/// # Errors
///
/// Returns an error if the frame is not valid JSON, or if a post create is
/// missing its record body, CID, or a parsable `createdAt` timestamp.
pub fn decode_frame(json: &str) -> Result<Option<CommitEnvelope>> {
    let frame: Frame = serde_json::from_str(json)?;

    if frame.kind != "commit" {
        return Ok(None);
    }
    let Some(commit) = frame.commit else {
        return Ok(None);
    };

    let op = match commit {
        FrameCommit::Create {
            collection,
            rkey,
            cid,
            record,
        } => {
            if collection != POST_COLLECTION {
                return Ok(None);
            }
            let record = record.ok_or(Error::InvalidField {
                field: "record",
                reason: "missing on create".to_string(),
            })?;
            let cid = cid.ok_or(Error::InvalidField {
                field: "cid",
                reason: "missing on create".to_string(),
            })?;
            let created_at = DateTime::parse_from_rfc3339(&record.created_at)
                .map_err(|e| Error::InvalidField {
                    field: "createdAt",
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc);

            PostOp::Create(CreateOp {
                uri: record_uri(&frame.did, &collection, &rkey),
                cid,
                author_did: frame.did.clone(),
                created_at,
                is_reply: record.reply.is_some(),
            })
        }
        FrameCommit::Update { .. } => return Ok(None),
        FrameCommit::Delete { collection, rkey } => {
            if collection != POST_COLLECTION {
                return Ok(None);
            }
            PostOp::Delete {
                uri: record_uri(&frame.did, &collection, &rkey),
            }
        }
    };

    Ok(Some(CommitEnvelope {
        event: CommitEvent {
            repo: frame.did,
            ops: vec![op],
        },
        cursor: frame.time_us,
    }))
}
