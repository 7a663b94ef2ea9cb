//! SQLite-backed post index.
//!
//! The index holds one row per accepted post, keyed by record URI, plus the
//! stream cursor checkpoint used to resume after a restart.
//!
//! Both mutation primitives are idempotent: deletes are no-ops for absent
//! URIs, and upserts are insert-if-absent. Replaying an event after a crash
//! mid-write-set is therefore always safe; the pipeline relies on this for
//! its at-least-once delivery contract. Deletes are applied before upserts
//! within a write-set, so a delete and re-create of the same URI in one event
//! leaves the row present.

use std::path::Path;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rusqlite::Connection;
use skysieve_core::{IndexedPost, WriteSet};

use crate::error::{Error, Result};

/// Current schema version. Increment when making breaking changes.
const SCHEMA_VERSION: i32 = 1;

/// Cursor checkpoint key for the commit stream.
const CURSOR_KEY: &str = "commit_stream";

/// SQLite-backed post index and cursor checkpoint.
///
/// Thread-safe: the connection sits behind a mutex, and every statement is
/// individually atomic.
pub struct PostStore {
    conn: Mutex<Connection>,
}

impl PostStore {
    /// Open or create the index at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // WAL for concurrent readers (the feed API reads this same file)
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;

        tracing::info!("Post index opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory index (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply one write-set: deletes first, then upserts.
    pub fn apply(&self, write_set: &WriteSet) -> Result<()> {
        self.delete_where_uri_in(&write_set.to_delete)?;
        self.upsert_ignoring_conflicts(&write_set.to_upsert)?;
        Ok(())
    }

    /// Delete rows by URI. URIs without a row are skipped silently.
    pub fn delete_where_uri_in(&self, uris: &[String]) -> Result<()> {
        if uris.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let placeholders = vec!["?"; uris.len()].join(", ");
        let sql = format!("DELETE FROM posts WHERE uri IN ({placeholders})");
        let deleted = conn.execute(&sql, rusqlite::params_from_iter(uris.iter()))?;

        if deleted > 0 {
            counter!("store_posts_deleted_total").increment(deleted as u64);
            tracing::debug!(requested = uris.len(), deleted, "posts deleted");
        }
        Ok(())
    }

    /// Insert rows, ignoring ones whose URI is already present.
    pub fn upsert_ignoring_conflicts(&self, rows: &[IndexedPost]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO posts (uri, cid, indexed_at) VALUES (?1, ?2, ?3)",
        )?;

        let mut inserted = 0usize;
        for row in rows {
            inserted += stmt.execute(rusqlite::params![
                row.uri,
                row.cid,
                row.indexed_at.to_rfc3339(),
            ])?;
        }

        if inserted > 0 {
            counter!("store_posts_upserted_total").increment(inserted as u64);
        }
        tracing::debug!(requested = rows.len(), inserted, "posts upserted");
        Ok(())
    }

    /// Last acknowledged stream cursor, if any.
    pub fn cursor(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let cursor: Option<i64> = conn
            .query_row(
                "SELECT value FROM ingest_cursor WHERE key = ?1",
                [CURSOR_KEY],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(cursor.map(|c| c as u64))
    }

    /// Persist the stream cursor after an event has been fully applied.
    pub fn set_cursor(&self, cursor: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ingest_cursor (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![CURSOR_KEY, cursor as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Number of indexed posts.
    pub fn post_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch one indexed post by URI.
    pub fn get_post(&self, uri: &str) -> Result<Option<IndexedPost>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT uri, cid, indexed_at FROM posts WHERE uri = ?1",
                [uri],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        row.map(|(uri, cid, indexed_at)| {
            let indexed_at = DateTime::parse_from_rfc3339(&indexed_at)
                .map_err(|e| Error::Database(format!("bad indexed_at for {uri}: {e}")))?
                .with_timezone(&Utc);
            Ok(IndexedPost {
                uri,
                cid,
                indexed_at,
            })
        })
        .transpose()
    }
}

/// Initialize the database schema, creating tables on first open.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    if version == 0 {
        conn.execute_batch(
            r#"
            -- The filtered feed index
            CREATE TABLE IF NOT EXISTS posts (
                uri TEXT PRIMARY KEY,
                cid TEXT NOT NULL,
                indexed_at TEXT NOT NULL
            );

            -- The feed API reads newest-first
            CREATE INDEX IF NOT EXISTS idx_posts_indexed_at ON posts(indexed_at DESC);

            -- Stream position checkpoint
            CREATE TABLE IF NOT EXISTS ingest_cursor (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [SCHEMA_VERSION],
        )?;
    }

    Ok(())
}
