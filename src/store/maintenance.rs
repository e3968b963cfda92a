// Operational surfaces: processing log, memory-event reads, the embedding
// index rows, and retention purges.

use rusqlite::params;

use super::{days_ago_iso, now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::{EmbeddingSource, MemoryEventRow, MemoryEventType, ProcessingLogRow};

impl MemoryStore {
    // ── Processing log ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn log_processing(
        &self,
        agent_id: &str,
        task_type: &str,
        model: Option<&str>,
        status: &str,
        details: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
        duration_ms: i64,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO processing_log (id, agent_id, task_type, model, status, details, \
                 input_tokens, output_tokens, duration_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![
                uuid::Uuid::new_v4().to_string(),
                agent_id,
                task_type,
                model,
                status,
                details,
                input_tokens,
                output_tokens,
                duration_ms,
                now_iso(),
            ])?;
            Ok(())
        })
        .await
    }

    pub fn recent_processing_log(&self, limit: usize) -> StorageResult<Vec<ProcessingLogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, agent_id, task_type, model, status, details, input_tokens, \
                 output_tokens, duration_ms, created_at \
                 FROM processing_log ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(StorageError::Prepare)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ProcessingLogRow {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    task_type: row.get(2)?,
                    model: row.get(3)?,
                    status: row.get(4)?,
                    details: row.get(5)?,
                    input_tokens: row.get(6)?,
                    output_tokens: row.get(7)?,
                    duration_ms: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Memory events (audit trail reads) ──────────────────────────────

    pub fn memory_events_for_entry(&self, entry_id: &str) -> StorageResult<Vec<MemoryEventRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, entry_id, event_type, agent_id, model, reason, created_at \
                 FROM memory_events WHERE entry_id = ?1 ORDER BY created_at, id",
            )
            .map_err(StorageError::Prepare)?;
        let rows = stmt
            .query_map(params![entry_id], |row| {
                let event_type: String = row.get(2)?;
                Ok(MemoryEventRow {
                    id: row.get(0)?,
                    entry_id: row.get(1)?,
                    event_type: match event_type.as_str() {
                        "created" => MemoryEventType::Created,
                        "superseded" => MemoryEventType::Superseded,
                        "deleted" => MemoryEventType::Deleted,
                        _ => MemoryEventType::Verification,
                    },
                    agent_id: row.get(3)?,
                    model: row.get(4)?,
                    reason: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Embedding index rows ───────────────────────────────────────────

    pub async fn upsert_embedding(
        &self,
        source: EmbeddingSource,
        source_id: &str,
        embedding: &[u8],
        model: &str,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO embedding_index (source_type, source_id, embedding, model, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![source.as_str(), source_id, embedding, model, now_iso()])?;
            Ok(())
        })
        .await
    }

    pub async fn delete_embedding(
        &self,
        source: EmbeddingSource,
        source_id: &str,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "DELETE FROM embedding_index WHERE source_type = ?1 AND source_id = ?2",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![source.as_str(), source_id])?;
            Ok(())
        })
        .await
    }

    /// Every stored vector, for rebuilding the in-memory index at startup.
    pub fn all_embeddings(&self) -> StorageResult<Vec<(EmbeddingSource, String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT source_type, source_id, embedding FROM embedding_index")
            .map_err(StorageError::Prepare)?;
        let rows = stmt
            .query_map([], |row| {
                let source: String = row.get(0)?;
                Ok((source, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(source, id, blob)| {
                EmbeddingSource::parse(&source).map(|s| (s, id, blob))
            })
            .collect();
        Ok(rows)
    }

    // ── Retention ──────────────────────────────────────────────────────

    /// Delete memory events, processing-log rows, and *processed* pending
    /// signals older than the cutoff. Returns rows removed.
    pub async fn purge_old_event_data(&self, retention_days: u32) -> StorageResult<usize> {
        let cutoff = days_ago_iso(retention_days as i64);
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            let mut removed = 0usize;
            removed += tx
                .prepare_cached("DELETE FROM memory_events WHERE created_at < ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![cutoff])?;
            removed += tx
                .prepare_cached("DELETE FROM processing_log WHERE created_at < ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![cutoff])?;
            removed += tx
                .prepare_cached(
                    "DELETE FROM pending_signals WHERE status = 'processed' AND created_at < ?1",
                )
                .map_err(StorageError::Prepare)?
                .execute(params![cutoff])?;
            tx.commit().map_err(StorageError::from)?;
            Ok(removed)
        })
        .await
    }
}
