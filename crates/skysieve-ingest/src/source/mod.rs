//! Commit event sources.
//!
//! A source yields decoded [`CommitEnvelope`]s in commit order, each carrying
//! the opaque cursor that acknowledges it. The pump consumes envelopes one at
//! a time and persists the cursor only after the event's write-set has been
//! applied, which is what makes restarts lossless.
//!
//! Production uses [`JetstreamSource`]; tests use in-memory sources.

mod jetstream;

pub use jetstream::{DEFAULT_JETSTREAM_URL, JetstreamConfig, JetstreamSource};

use std::future::Future;

use skysieve_core::CommitEnvelope;

use crate::error::Result;

/// A source of ordered commit events.
pub trait CommitSource: Send {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// The next commit envelope, or `None` when the stream is exhausted.
    ///
    /// Sources backed by a live connection reconnect internally and only
    /// surface errors that are not recoverable by retrying.
    fn next_event(&mut self) -> impl Future<Output = Result<Option<CommitEnvelope>>> + Send;

    /// Statistics about frames consumed so far.
    fn stats(&self) -> SourceStats;
}

/// Statistics from consuming a source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStats {
    /// Frames received from the wire.
    pub total_frames: usize,

    /// Frames that decoded to a commit event.
    pub decoded_events: usize,

    /// Well-formed frames carrying nothing to index.
    pub skipped_frames: usize,

    /// Frames that failed to decode.
    pub malformed_frames: usize,

    /// Reconnections after connection loss.
    pub reconnects: usize,
}
