// ── Memory Store ───────────────────────────────────────────────────────────
// Single-file WAL-mode SQLite store for all persistent memory state.
// One writer, many readers: every access goes through a `parking_lot::Mutex`
// around the connection — the store's serial lane. The guard is never held
// across an await.
//
// Module layout:
//   schema        — versioned migrations (PRAGMA user_version → v3)
//   entries       — working-memory entry CRUD, supersession, archiving
//   conversations — conversations, chunks, pending signals, summaries
//   profile       — user profile, contributions, user edits
//   graph         — entities + relationships with deterministic ids
//   agents        — configured agent rows
//   maintenance   — processing log, memory events, embedding index,
//                   optimize/vacuum/purge

use std::path::Path;

use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::atoms::error::{StorageError, StorageResult};

mod agents;
mod conversations;
mod entries;
mod graph;
mod maintenance;
mod profile;
mod schema;

pub use schema::TARGET_SCHEMA_VERSION;

/// Capacity of rusqlite's prepared-statement cache (keyed by SQL text;
/// statements are reset and rebound between uses).
const STATEMENT_CACHE_CAPACITY: usize = 64;

/// Retry budget for transient busy/locked faults.
const BUSY_RETRY_ATTEMPTS: u32 = 5;

/// Initial busy-retry backoff in milliseconds (doubles each attempt).
const BUSY_RETRY_BASE_MS: u64 = 10;

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) the store at `path`, applying PRAGMAs and running
    /// migrations up to `TARGET_SCHEMA_VERSION`. A failed migration refuses
    /// to open.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Busy(format!("create {}: {}", parent.display(), e)))?;
        }
        info!("[store] Opening memory store at {}", path.display());
        let conn = Connection::open(path).map_err(StorageError::from)?;
        Self::init(conn)
    }

    /// In-memory store for tests. Runs the same migrations.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(StorageError::from)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        schema::run_migrations(&conn)?;

        Ok(MemoryStore {
            conn: Mutex::new(conn),
        })
    }

    /// Run a write closure against the connection, retrying transient
    /// busy/locked faults with bounded backoff. Non-retryable faults
    /// surface immediately; the closure's transaction has rolled back.
    ///
    /// Async so the backoff yields to the runtime instead of parking a
    /// worker thread. The connection guard is acquired and released inside
    /// each attempt — never held across the sleep.
    pub(crate) async fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut delay_ms = BUSY_RETRY_BASE_MS;
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock();
                op(&mut conn)
            };
            match result {
                Err(e) if e.is_retryable() && attempt < BUSY_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        "[store] Busy (attempt {}/{}) — retrying in {}ms",
                        attempt, BUSY_RETRY_ATTEMPTS, delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                other => return other,
            }
        }
    }

    /// Fast maintenance pass — safe to call at any time.
    pub fn optimize(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")
            .map_err(StorageError::from)
    }

    /// Expensive full rebuild. Infrequent use only.
    pub fn vacuum(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM;").map_err(StorageError::from)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
            warn!("[store] PRAGMA optimize on close failed: {}", e);
        }
    }
}

/// ISO-8601 timestamp for "now". All store timestamps use this format so
/// lexicographic comparison matches chronological order.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Cutoff timestamp `days` ago, same format as `now_iso`.
pub(crate) fn days_ago_iso(days: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339()
}

/// Build an FTS5 MATCH expression from free text: each token quoted and
/// OR-joined, so punctuation in the query cannot break the parser.
pub(crate) fn fts_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| format!("\"{}\"", w.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_migrates() {
        let store = MemoryStore::open_in_memory().unwrap();
        let conn = store.conn.lock();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, TARGET_SCHEMA_VERSION);
    }

    #[test]
    fn open_on_disk_is_wal_and_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = MemoryStore::open(&path).unwrap();
            let conn = store.conn.lock();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |r| r.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }
        // Second open runs migrations idempotently.
        let again = MemoryStore::open(&path);
        assert!(again.is_ok());
    }

    #[test]
    fn fts_match_query_quotes_tokens() {
        assert_eq!(fts_match_query("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(fts_match_query("don't"), "\"don't\"");
        assert_eq!(fts_match_query("say \"hi\""), "\"say\" OR \"\"\"hi\"\"\"");
    }
}
