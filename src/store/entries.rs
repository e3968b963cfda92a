// Working-memory entry CRUD. Supersession and insertion are transactional:
// callers never observe an entry superseded without its replacement, and
// audit events land in the same transaction as the mutation they describe.

use rusqlite::{params, Connection};

use super::{fts_match_query, now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::{EntryStatus, EntryType, MemoryEntry, MemoryEventType};

const ENTRY_COLUMNS: &str = "id, agent_id, entry_type, content, confidence, model, \
     source_conversation_id, tags, status, superseded_by, created_at, last_accessed, \
     access_count, valid_from, valid_until";

impl MemoryEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let entry_type: String = row.get(2)?;
        let status: String = row.get(8)?;
        let tags_json: String = row.get(7)?;
        Ok(MemoryEntry {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            entry_type: EntryType::parse(&entry_type).ok_or_else(|| bad_column(2, &entry_type))?,
            content: row.get(3)?,
            confidence: row.get(4)?,
            model: row.get(5)?,
            source_conversation_id: row.get(6)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            status: EntryStatus::parse(&status).ok_or_else(|| bad_column(8, &status))?,
            superseded_by: row.get(9)?,
            created_at: row.get(10)?,
            last_accessed: row.get(11)?,
            access_count: row.get(12)?,
            valid_from: row.get(13)?,
            valid_until: row.get(14)?,
        })
    }
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value '{}'", value).into(),
    )
}

fn insert_entry_tx(tx: &Connection, entry: &MemoryEntry) -> StorageResult<()> {
    let tags = serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".into());
    tx.prepare_cached(
        "INSERT INTO memory_entries (id, agent_id, entry_type, content, confidence, model, \
         source_conversation_id, tags, status, superseded_by, created_at, last_accessed, \
         access_count, valid_from, valid_until) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )
    .map_err(StorageError::Prepare)?
    .execute(params![
        entry.id,
        entry.agent_id,
        entry.entry_type.as_str(),
        entry.content,
        entry.confidence,
        entry.model,
        entry.source_conversation_id,
        tags,
        entry.status.as_str(),
        entry.superseded_by,
        entry.created_at,
        entry.last_accessed,
        entry.access_count,
        entry.valid_from,
        entry.valid_until,
    ])?;
    Ok(())
}

pub(super) fn write_memory_event_tx(
    tx: &Connection,
    entry_id: &str,
    event_type: MemoryEventType,
    agent_id: Option<&str>,
    model: Option<&str>,
    reason: Option<&str>,
) -> StorageResult<()> {
    tx.prepare_cached(
        "INSERT INTO memory_events (id, entry_id, event_type, agent_id, model, reason, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .map_err(StorageError::Prepare)?
    .execute(params![
        uuid::Uuid::new_v4().to_string(),
        entry_id,
        event_type.as_str(),
        agent_id,
        model,
        reason,
        now_iso(),
    ])?;
    Ok(())
}

impl MemoryStore {
    /// Insert an entry and its "created" audit event in one transaction.
    /// A primary-key collision surfaces as `StorageError::Conflict`.
    pub async fn insert_entry(&self, entry: &MemoryEntry) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            insert_entry_tx(&tx, entry)?;
            write_memory_event_tx(
                &tx,
                &entry.id,
                MemoryEventType::Created,
                Some(&entry.agent_id),
                Some(&entry.model),
                None,
            )?;
            tx.commit().map_err(StorageError::from)
        })
        .await
    }

    /// Close `old_id` (superseded, pointing at the new entry, valid_until=now),
    /// insert the new entry, and write both audit events — atomically.
    pub async fn supersede_and_insert(
        &self,
        old_id: &str,
        new_entry: &MemoryEntry,
        reason: &str,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            let now = now_iso();
            let tx = conn.transaction().map_err(StorageError::from)?;

            let changed = tx
                .prepare_cached(
                    "UPDATE memory_entries \
                     SET status = 'superseded', superseded_by = ?2, valid_until = ?3 \
                     WHERE id = ?1 AND status = 'active'",
                )
                .map_err(StorageError::Prepare)?
                .execute(params![old_id, new_entry.id, now])?;
            if changed == 0 {
                return Err(StorageError::Conflict(format!(
                    "entry {} is not active",
                    old_id
                )));
            }

            insert_entry_tx(&tx, new_entry)?;

            tx.prepare_cached("DELETE FROM embedding_index WHERE source_type = 'entry' AND source_id = ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![old_id])?;

            write_memory_event_tx(
                &tx,
                old_id,
                MemoryEventType::Superseded,
                Some(&new_entry.agent_id),
                Some(&new_entry.model),
                Some(reason),
            )?;
            write_memory_event_tx(
                &tx,
                &new_entry.id,
                MemoryEventType::Created,
                Some(&new_entry.agent_id),
                Some(&new_entry.model),
                None,
            )?;

            tx.commit().map_err(StorageError::from)
        })
        .await
    }

    /// Soft-delete an entry, drop its embedding row, write a "deleted" event.
    pub async fn delete_entry(&self, id: &str, reason: Option<&str>) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            tx.prepare_cached(
                "UPDATE memory_entries SET status = 'deleted', valid_until = ?2 WHERE id = ?1",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![id, now_iso()])?;
            tx.prepare_cached("DELETE FROM embedding_index WHERE source_type = 'entry' AND source_id = ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![id])?;
            write_memory_event_tx(&tx, id, MemoryEventType::Deleted, None, None, reason)?;
            tx.commit().map_err(StorageError::from)
        })
        .await
    }

    pub fn get_entry(&self, id: &str) -> StorageResult<Option<MemoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM memory_entries WHERE id = ?1",
                ENTRY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let mut rows = stmt
            .query_map(params![id], MemoryEntry::from_row)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    /// Active entries for an agent, newest-last-accessed first.
    pub fn load_active_entries(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<MemoryEntry>> {
        let conn = self.conn.lock();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM memory_entries \
                 WHERE agent_id = ?1 AND status = 'active' \
                 ORDER BY last_accessed DESC, created_at DESC \
                 LIMIT ?2",
                ENTRY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let entries = stmt
            .query_map(params![agent_id, limit], MemoryEntry::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    /// Time-travel read: entries valid at instant `t`.
    pub fn entries_as_of(&self, agent_id: &str, t: &str) -> StorageResult<Vec<MemoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM memory_entries \
                 WHERE agent_id = ?1 AND status != 'deleted' \
                   AND valid_from <= ?2 \
                   AND (valid_until IS NULL OR valid_until > ?2) \
                 ORDER BY valid_from",
                ENTRY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let entries = stmt
            .query_map(params![agent_id, t], MemoryEntry::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    pub fn active_entry_count(&self, agent_id: &str) -> StorageResult<i64> {
        let conn = self.conn.lock();
        let result = conn.prepare_cached(
            "SELECT COUNT(*) FROM memory_entries WHERE agent_id = ?1 AND status = 'active'",
        )
        .map_err(StorageError::Prepare)?
        .query_row(params![agent_id], |r| r.get(0))
        .map_err(StorageError::from);
        result
    }

    /// Batch access-tracking update: `last_accessed = now`,
    /// `access_count += 1` for every id, in one statement.
    pub async fn touch_entries(&self, ids: &[String]) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = (2..ids.len() + 2)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE memory_entries \
             SET last_accessed = ?1, access_count = access_count + 1 \
             WHERE id IN ({})",
            placeholders
        );
        self.with_conn(|conn| {
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
            let now = now_iso();
            values.push(&now);
            for id in ids {
                values.push(id);
            }
            conn.prepare_cached(&sql)
                .map_err(StorageError::Prepare)?
                .execute(values.as_slice())?;
            Ok(())
        })
        .await
    }

    /// If the agent's active-entry count exceeds `max`, archive the excess
    /// with the lowest (last_accessed, access_count), oldest first.
    /// Returns the archived ids so callers can drop them from the index.
    pub async fn archive_excess(&self, agent_id: &str, max: usize) -> StorageResult<Vec<String>> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;

            let count: i64 = tx
                .prepare_cached(
                    "SELECT COUNT(*) FROM memory_entries WHERE agent_id = ?1 AND status = 'active'",
                )
                .map_err(StorageError::Prepare)?
                .query_row(params![agent_id], |r| r.get(0))?;
            let excess = count - max as i64;
            if excess <= 0 {
                return Ok(Vec::new());
            }

            let ids: Vec<String> = tx
                .prepare_cached(
                    "SELECT id FROM memory_entries \
                     WHERE agent_id = ?1 AND status = 'active' \
                     ORDER BY last_accessed ASC, access_count ASC, created_at ASC \
                     LIMIT ?2",
                )
                .map_err(StorageError::Prepare)?
                .query_map(params![agent_id, excess], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();

            let now = now_iso();
            for id in &ids {
                tx.prepare_cached(
                    "UPDATE memory_entries SET status = 'archived', valid_until = ?2 WHERE id = ?1",
                )
                .map_err(StorageError::Prepare)?
                .execute(params![id, now])?;
                tx.prepare_cached(
                    "DELETE FROM embedding_index WHERE source_type = 'entry' AND source_id = ?1",
                )
                .map_err(StorageError::Prepare)?
                .execute(params![id])?;
            }

            tx.commit().map_err(StorageError::from)?;
            Ok(ids)
        })
        .await
    }

    /// BM25 lexical search over active entries. Raw FTS5 rank is negated so
    /// higher is better, matching the vector side.
    pub fn search_entries_bm25(
        &self,
        query: &str,
        agent_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<(MemoryEntry, f64)>> {
        let fts_query = fts_match_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {}, rank FROM entries_fts f \
                 JOIN memory_entries e ON e.id = f.id \
                 WHERE entries_fts MATCH ?1 AND e.agent_id = ?2 AND e.status = 'active' \
                 ORDER BY rank LIMIT ?3",
                ENTRY_COLUMNS
                    .split(", ")
                    .map(|c| format!("e.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .map_err(StorageError::Prepare)?;
        let results = stmt
            .query_map(params![fts_query, agent_id, limit as i64], |row| {
                let entry = MemoryEntry::from_row(row)?;
                let rank: f64 = row.get(15)?;
                Ok((entry, -rank))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }
}
