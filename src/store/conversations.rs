// Conversations, chunks, pending signals, and summaries.
// `message_count` on a conversation always equals its chunk count because
// both are written in the same transaction by `append_chunk`.

use rusqlite::params;

use super::{days_ago_iso, fts_match_query, now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::{
    Chunk, ChunkRole, Conversation, ConversationSummary, EntryStatus, PendingSignal, SignalStatus,
};
use crate::tokenizer::count_tokens;

impl Chunk {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let role: String = row.get(3)?;
        Ok(Chunk {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            chunk_index: row.get(2)?,
            role: ChunkRole::parse(&role).unwrap_or(ChunkRole::User),
            content: row.get(4)?,
            token_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl ConversationSummary {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(7)?;
        Ok(ConversationSummary {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            conversation_id: row.get(2)?,
            summary: row.get(3)?,
            token_count: row.get(4)?,
            model: row.get(5)?,
            conversation_at: row.get(6)?,
            status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Active),
            created_at: row.get(8)?,
        })
    }
}

impl PendingSignal {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(6)?;
        Ok(PendingSignal {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            conversation_id: row.get(2)?,
            signal_type: row.get(3)?,
            user_message: row.get(4)?,
            assistant_message: row.get(5)?,
            status: if status == "processed" {
                SignalStatus::Processed
            } else {
                SignalStatus::Pending
            },
            created_at: row.get(7)?,
        })
    }
}

const CHUNK_COLUMNS: &str =
    "id, conversation_id, chunk_index, role, content, token_count, created_at";
const SUMMARY_COLUMNS: &str = "id, agent_id, conversation_id, summary, token_count, model, \
     conversation_at, status, created_at";
const SIGNAL_COLUMNS: &str = "id, agent_id, conversation_id, signal_type, user_message, \
     assistant_message, status, created_at";

impl MemoryStore {
    /// Append one chunk to a conversation: upserts the conversation row,
    /// assigns the next chunk_index, and bumps message_count — one
    /// transaction, so the chunk-count invariant holds.
    pub async fn append_chunk(
        &self,
        agent_id: &str,
        conversation_id: &str,
        role: ChunkRole,
        content: &str,
    ) -> StorageResult<Chunk> {
        let chunk = Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            chunk_index: 0,
            role,
            content: content.to_string(),
            token_count: count_tokens(content) as i64,
            created_at: now_iso(),
        };
        self.with_conn(|conn| {
            let now = now_iso();
            let tx = conn.transaction().map_err(StorageError::from)?;

            tx.prepare_cached(
                "INSERT INTO conversations (id, agent_id, started_at, last_message_at, message_count, status) \
                 VALUES (?1, ?2, ?3, ?3, 0, 'active') \
                 ON CONFLICT(id) DO UPDATE SET last_message_at = ?3",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![conversation_id, agent_id, now])?;

            let next_index: i64 = tx
                .prepare_cached(
                    "SELECT COALESCE(MAX(chunk_index) + 1, 0) FROM chunks WHERE conversation_id = ?1",
                )
                .map_err(StorageError::Prepare)?
                .query_row(params![conversation_id], |r| r.get(0))?;

            tx.prepare_cached(
                "INSERT INTO chunks (id, conversation_id, chunk_index, role, content, token_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![
                chunk.id,
                conversation_id,
                next_index,
                chunk.role.as_str(),
                chunk.content,
                chunk.token_count,
                chunk.created_at,
            ])?;

            tx.prepare_cached(
                "UPDATE conversations SET message_count = message_count + 1 WHERE id = ?1",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![conversation_id])?;

            tx.commit().map_err(StorageError::from)?;
            Ok(Chunk {
                chunk_index: next_index,
                ..chunk.clone()
            })
        })
        .await
    }

    pub fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, agent_id, title, started_at, last_message_at, message_count, status \
                 FROM conversations WHERE id = ?1",
            )
            .map_err(StorageError::Prepare)?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                let status: String = row.get(6)?;
                Ok(Conversation {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    title: row.get(2)?,
                    started_at: row.get(3)?,
                    last_message_at: row.get(4)?,
                    message_count: row.get(5)?,
                    status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Active),
                })
            })?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    pub fn get_chunk(&self, id: &str) -> StorageResult<Option<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS))
            .map_err(StorageError::Prepare)?;
        let mut rows = stmt
            .query_map(params![id], Chunk::from_row)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    /// Delete every chunk of a conversation (wholesale, resets count).
    pub async fn delete_conversation_chunks(&self, conversation_id: &str) -> StorageResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            let deleted = tx
                .prepare_cached("DELETE FROM chunks WHERE conversation_id = ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![conversation_id])?;
            tx.prepare_cached("UPDATE conversations SET message_count = 0 WHERE id = ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![conversation_id])?;
            tx.commit().map_err(StorageError::from)?;
            Ok(deleted)
        })
        .await
    }

    // ── Pending signals ────────────────────────────────────────────────

    pub async fn insert_pending_signal(
        &self,
        agent_id: &str,
        conversation_id: &str,
        user_message: &str,
        assistant_message: Option<&str>,
    ) -> StorageResult<PendingSignal> {
        let signal = PendingSignal {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            conversation_id: conversation_id.to_string(),
            signal_type: "turn".into(),
            user_message: user_message.to_string(),
            assistant_message: assistant_message.map(|s| s.to_string()),
            status: SignalStatus::Pending,
            created_at: now_iso(),
        };
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO pending_signals (id, agent_id, conversation_id, signal_type, \
                 user_message, assistant_message, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![
                signal.id,
                signal.agent_id,
                signal.conversation_id,
                signal.signal_type,
                signal.user_message,
                signal.assistant_message,
                signal.status.as_str(),
                signal.created_at,
            ])?;
            Ok(())
        })
        .await?;
        Ok(signal)
    }

    /// Pending (unprocessed) signals for a conversation, oldest first.
    pub fn pending_signals_for(&self, conversation_id: &str) -> StorageResult<Vec<PendingSignal>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM pending_signals \
                 WHERE conversation_id = ?1 AND status = 'pending' \
                 ORDER BY created_at, id",
                SIGNAL_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let signals = stmt
            .query_map(params![conversation_id], PendingSignal::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(signals)
    }

    /// Distinct (agent_id, conversation_id) pairs that still have pending
    /// signals — the startup recovery worklist.
    pub fn conversations_with_pending_signals(&self) -> StorageResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT agent_id, conversation_id FROM pending_signals \
                 WHERE status = 'pending' ORDER BY agent_id, conversation_id",
            )
            .map_err(StorageError::Prepare)?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(pairs)
    }

    // ── Summaries ──────────────────────────────────────────────────────

    /// Insert the summary, supersede any prior active summary for the same
    /// (agent, conversation), and flip the conversation's pending signals
    /// to processed — all in one transaction.
    pub async fn insert_summary_and_mark_processed(
        &self,
        summary: &ConversationSummary,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;

            tx.prepare_cached(
                "UPDATE conversation_summaries SET status = 'superseded' \
                 WHERE agent_id = ?1 AND conversation_id = ?2 AND status = 'active'",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![summary.agent_id, summary.conversation_id])?;

            tx.prepare_cached(
                "INSERT INTO conversation_summaries (id, agent_id, conversation_id, summary, \
                 token_count, model, conversation_at, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![
                summary.id,
                summary.agent_id,
                summary.conversation_id,
                summary.summary,
                summary.token_count,
                summary.model,
                summary.conversation_at,
                summary.status.as_str(),
                summary.created_at,
            ])?;

            tx.prepare_cached(
                "UPDATE pending_signals SET status = 'processed' \
                 WHERE conversation_id = ?1 AND status = 'pending'",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![summary.conversation_id])?;

            tx.commit().map_err(StorageError::from)
        })
        .await
    }

    pub fn get_summary(&self, id: &str) -> StorageResult<Option<ConversationSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM conversation_summaries WHERE id = ?1",
                SUMMARY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let mut rows = stmt
            .query_map(params![id], ConversationSummary::from_row)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    /// Active summaries for an agent, newest conversation first.
    /// `retention_days == 0` means all time.
    pub fn summaries_for_agent(
        &self,
        agent_id: &str,
        retention_days: u32,
        limit: Option<usize>,
    ) -> StorageResult<Vec<ConversationSummary>> {
        let cutoff = if retention_days == 0 {
            String::new()
        } else {
            days_ago_iso(retention_days as i64)
        };
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM conversation_summaries \
                 WHERE agent_id = ?1 AND status = 'active' AND conversation_at >= ?2 \
                 ORDER BY conversation_at DESC LIMIT ?3",
                SUMMARY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let summaries = stmt
            .query_map(params![agent_id, cutoff, limit], ConversationSummary::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(summaries)
    }

    // ── BM25 over chunks & summaries ───────────────────────────────────

    /// BM25 search over an agent's chunks within `days_window` (0 = all).
    pub fn search_chunks_bm25(
        &self,
        query: &str,
        agent_id: &str,
        days_window: u32,
        limit: usize,
    ) -> StorageResult<Vec<(Chunk, f64)>> {
        let fts_query = fts_match_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = if days_window == 0 {
            String::new()
        } else {
            days_ago_iso(days_window as i64)
        };
        let conn = self.conn.lock();
        let columns = CHUNK_COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {}, rank FROM chunks_fts f \
                 JOIN chunks c ON c.id = f.id \
                 JOIN conversations v ON v.id = c.conversation_id \
                 WHERE chunks_fts MATCH ?1 AND v.agent_id = ?2 AND c.created_at >= ?3 \
                 ORDER BY rank LIMIT ?4",
                columns
            ))
            .map_err(StorageError::Prepare)?;
        let results = stmt
            .query_map(params![fts_query, agent_id, cutoff, limit as i64], |row| {
                let chunk = Chunk::from_row(row)?;
                let rank: f64 = row.get(7)?;
                Ok((chunk, -rank))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// BM25 search over an agent's active summaries within `days_window`.
    pub fn search_summaries_bm25(
        &self,
        query: &str,
        agent_id: &str,
        days_window: u32,
        limit: usize,
    ) -> StorageResult<Vec<(ConversationSummary, f64)>> {
        let fts_query = fts_match_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = if days_window == 0 {
            String::new()
        } else {
            days_ago_iso(days_window as i64)
        };
        let conn = self.conn.lock();
        let columns = SUMMARY_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {}, rank FROM summaries_fts f \
                 JOIN conversation_summaries s ON s.id = f.id \
                 WHERE summaries_fts MATCH ?1 AND s.agent_id = ?2 AND s.status = 'active' \
                   AND s.conversation_at >= ?3 \
                 ORDER BY rank LIMIT ?4",
                columns
            ))
            .map_err(StorageError::Prepare)?;
        let results = stmt
            .query_map(params![fts_query, agent_id, cutoff, limit as i64], |row| {
                let summary = ConversationSummary::from_row(row)?;
                let rank: f64 = row.get(9)?;
                Ok((summary, -rank))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }
}
