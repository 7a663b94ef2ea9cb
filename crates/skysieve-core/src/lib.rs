//! Core types and shared utilities for the Skysieve ingestion pipeline.
//!
//! This crate provides:
//! - The commit-event data model (create/delete operations on post records)
//! - Decoding of Jetstream wire frames into [`CommitEnvelope`]s
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// The record collection this pipeline indexes.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

pub use error::{Error, Result};
pub use event::{
    CommitEnvelope, CommitEvent, CreateOp, IndexedPost, PostOp, WriteSet, decode_frame,
    record_uri,
};
