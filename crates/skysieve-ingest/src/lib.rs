//! Skysieve ingestion pipeline.
//!
//! This crate consumes the Jetstream commit firehose, keeps posts whose
//! authors pass the handle policy, and maintains the SQLite index that the
//! feed is served from.
//!
//! # Modules
//!
//! - [`source`] - Commit event sources (live Jetstream, test doubles)
//! - [`resolve`] - DID document resolution against the PLC directory
//! - [`cache`] - Per-author verdict cache with single-flight resolution
//! - [`policy`] - Pure accept/reject policy for post creates
//! - [`filter`] - Per-event write-set production
//! - [`store`] - SQLite post index and cursor checkpoint
//! - [`pump`] - The drive loop tying the above together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ JetstreamSource │  WebSocket frames → commit events + cursor
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌───────────────┐      ┌─────────────┐
//! │   EventFilter   │ ───► │ IdentityCache │ ───► │ DidResolver │
//! └────────┬────────┘      └───────────────┘      └─────────────┘
//!          │   creates await their author's verdict;
//!          │   deletes pass straight through
//!          ▼
//! ┌─────────────────┐
//! │    PostStore    │  SQLite - idempotent deletes-then-upserts,
//! └─────────────────┘  cursor advanced only after a successful apply
//! ```
//!
//! The cursor checkpoint makes delivery at-least-once; the store's
//! idempotence makes replays invisible.

pub mod cache;
pub mod error;
pub mod filter;
pub mod policy;
pub mod pump;
pub mod resolve;
pub mod source;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use cache::{CacheConfig, IdentityCache, IdentityVerdict};
pub use filter::{EventFilter, FilterConfig};
pub use policy::{Decision, HandleSelection, PolicyConfig, PostPolicy, RejectReason};
pub use pump::{PumpConfig, PumpStats, StreamPump};
pub use resolve::{
    DEFAULT_PLC_DIRECTORY_URL, DidDocument, DidResolver, PlcDirectoryResolver, ResolveError,
};
pub use source::{
    CommitSource, DEFAULT_JETSTREAM_URL, JetstreamConfig, JetstreamSource, SourceStats,
};
pub use store::PostStore;
