//! Live Jetstream event source.
//!
//! Connects to a Jetstream endpoint over WebSocket and streams post-collection
//! commits as JSON frames. The subscription is server-side filtered via
//! `wantedCollections`, so almost every frame decodes to an event.
//!
//! # Reconnection
//!
//! Connection loss is handled internally: the source reconnects with
//! exponential backoff and resumes from the last *emitted* cursor, so the
//! pump's position is preserved across drops. A frame the pump never saw is
//! re-delivered after reconnect; downstream idempotence absorbs the overlap.

use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use skysieve_core::{CommitEnvelope, decode_frame};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{CommitSource, SourceStats};
use crate::error::{Error, Result};

/// Default public Jetstream endpoint.
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the Jetstream source.
#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    /// Endpoint base URL (the source appends `/subscribe`).
    pub endpoint: String,

    /// Collections to subscribe to.
    pub collections: Vec<String>,

    /// Cursor to resume from on the first connect. `None` starts live.
    pub cursor: Option<u64>,

    /// Initial reconnect backoff; doubles per failed attempt.
    pub reconnect_backoff: Duration,

    /// Backoff ceiling.
    pub max_reconnect_backoff: Duration,
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_JETSTREAM_URL.to_string(),
            collections: vec![skysieve_core::POST_COLLECTION.to_string()],
            cursor: None,
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(60),
        }
    }
}

/// Live Jetstream commit source.
pub struct JetstreamSource {
    config: JetstreamConfig,
    ws: Option<WsStream>,
    stats: SourceStats,
    backoff: Duration,
    /// Cursor of the last envelope handed to the pump; reconnects resume here.
    last_cursor: Option<u64>,
}

impl JetstreamSource {
    /// Create a source with the given configuration.
    pub fn new(config: JetstreamConfig) -> Self {
        let backoff = config.reconnect_backoff;
        Self {
            config,
            ws: None,
            stats: SourceStats::default(),
            backoff,
            last_cursor: None,
        }
    }

    /// Build the subscription URL for the current resume position.
    fn subscribe_url(&self) -> Result<Url> {
        let base = format!("{}/subscribe", self.config.endpoint.trim_end_matches('/'));
        let mut url = Url::parse(&base)
            .map_err(|e| Error::Config(format!("invalid Jetstream endpoint: {e}")))?;

        {
            let mut query = url.query_pairs_mut();
            for collection in &self.config.collections {
                query.append_pair("wantedCollections", collection);
            }
            if let Some(cursor) = self.last_cursor.or(self.config.cursor) {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        Ok(url)
    }

    async fn connect(&mut self) -> Result<()> {
        let url = self.subscribe_url()?;
        tracing::info!(url = %url, "connecting to Jetstream");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        tracing::info!("Jetstream connected");
        self.backoff = self.config.reconnect_backoff;
        self.ws = Some(ws);
        Ok(())
    }

    /// Drop the connection and wait out the current backoff.
    async fn await_reconnect(&mut self) {
        self.ws = None;
        self.stats.reconnects += 1;
        counter!("ingest_reconnects_total").increment(1);

        tracing::warn!(
            backoff_secs = self.backoff.as_secs_f64(),
            "Jetstream connection lost, reconnecting"
        );
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(self.config.max_reconnect_backoff);
    }
}

impl CommitSource for JetstreamSource {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    async fn next_event(&mut self) -> Result<Option<CommitEnvelope>> {
        loop {
            if self.ws.is_none()
                && let Err(e) = self.connect().await
            {
                tracing::warn!(error = %e, "Jetstream connect failed");
                self.await_reconnect().await;
                continue;
            }
            let Some(ws) = self.ws.as_mut() else {
                continue;
            };

            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.stats.total_frames += 1;
                    match decode_frame(&text) {
                        Ok(Some(envelope)) => {
                            self.last_cursor = Some(envelope.cursor);
                            self.stats.decoded_events += 1;
                            return Ok(Some(envelope));
                        }
                        Ok(None) => {
                            self.stats.skipped_frames += 1;
                        }
                        Err(e) => {
                            self.stats.malformed_frames += 1;
                            counter!("ingest_events_malformed_total").increment(1);
                            tracing::debug!(error = %e, "malformed Jetstream frame skipped");
                        }
                    }
                }
                // Pings are answered by the library on the next flush
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    tracing::trace!(?other, "ignoring non-text Jetstream message");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Jetstream read error");
                    self.await_reconnect().await;
                }
                None => {
                    self.await_reconnect().await;
                }
            }
        }
    }

    fn stats(&self) -> SourceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Subscription URL
    // =========================================================================

    #[test]
    fn test_subscribe_url_defaults() {
        let source = JetstreamSource::new(JetstreamConfig::default());
        let url = source.subscribe_url().unwrap();

        assert_eq!(url.host_str(), Some("jetstream2.us-east.bsky.network"));
        assert_eq!(url.path(), "/subscribe");
        assert_eq!(
            url.query(),
            Some("wantedCollections=app.bsky.feed.post")
        );
    }

    #[test]
    fn test_subscribe_url_with_cursor() {
        let source = JetstreamSource::new(JetstreamConfig {
            cursor: Some(1725911162329308),
            ..JetstreamConfig::default()
        });
        let url = source.subscribe_url().unwrap();

        assert!(
            url.query()
                .unwrap()
                .contains("cursor=1725911162329308")
        );
    }

    #[test]
    fn test_subscribe_url_resumes_from_last_emitted_cursor() {
        let mut source = JetstreamSource::new(JetstreamConfig {
            cursor: Some(100),
            ..JetstreamConfig::default()
        });
        source.last_cursor = Some(250);

        let url = source.subscribe_url().unwrap();
        assert!(url.query().unwrap().contains("cursor=250"));
    }

    #[test]
    fn test_subscribe_url_trailing_slash() {
        let source = JetstreamSource::new(JetstreamConfig {
            endpoint: "wss://example.test/".to_string(),
            ..JetstreamConfig::default()
        });
        let url = source.subscribe_url().unwrap();
        assert_eq!(url.as_str(), "wss://example.test/subscribe?wantedCollections=app.bsky.feed.post");
    }

    #[test]
    fn test_subscribe_url_multiple_collections() {
        let source = JetstreamSource::new(JetstreamConfig {
            collections: vec![
                "app.bsky.feed.post".to_string(),
                "app.bsky.feed.repost".to_string(),
            ],
            ..JetstreamConfig::default()
        });
        let url = source.subscribe_url().unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("wantedCollections=app.bsky.feed.post"));
        assert!(query.contains("wantedCollections=app.bsky.feed.repost"));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let source = JetstreamSource::new(JetstreamConfig {
            endpoint: "not a url".to_string(),
            ..JetstreamConfig::default()
        });
        assert!(matches!(source.subscribe_url(), Err(Error::Config(_))));
    }
}
