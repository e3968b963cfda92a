// Database schema and versioned migrations for the memory store.
// The schema version is persisted in PRAGMA user_version. On open,
// migrations from the current version up to TARGET_SCHEMA_VERSION run in
// order, each inside its own transaction that also bumps the version —
// either the DDL and the bump both land, or neither does.
// Every statement is idempotent (CREATE … IF NOT EXISTS) so a partially
// upgraded database can always be re-migrated.

use log::info;
use rusqlite::Connection;

use crate::atoms::error::{StorageError, StorageResult};

pub const TARGET_SCHEMA_VERSION: i64 = 3;

pub(crate) fn run_migrations(conn: &Connection) -> StorageResult<()> {
    let current: i64 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .map_err(StorageError::from)?;

    if current >= TARGET_SCHEMA_VERSION {
        return Ok(());
    }

    info!(
        "[store] Migrating schema v{} → v{}",
        current, TARGET_SCHEMA_VERSION
    );

    for version in (current + 1)..=TARGET_SCHEMA_VERSION {
        let ddl = match version {
            1 => SCHEMA_V1,
            2 => SCHEMA_V2,
            3 => SCHEMA_V3,
            _ => unreachable!("no migration defined for v{}", version),
        };
        let script = format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            ddl, version
        );
        conn.execute_batch(&script)
            .map_err(|e| StorageError::MigrationFailed {
                version,
                message: e.to_string(),
            })?;
        info!("[store] Applied schema v{}", version);
    }

    Ok(())
}

// ── v1: conversations, chunks, signals, entries, audit, agents ─────────────

const SCHEMA_V1: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        title TEXT,
        started_at TEXT NOT NULL,
        last_message_at TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active'
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_agent
        ON conversations(agent_id, last_message_at DESC);

    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (conversation_id, chunk_index),
        FOREIGN KEY (conversation_id) REFERENCES conversations(id)
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_conversation
        ON chunks(conversation_id, chunk_index);
    CREATE INDEX IF NOT EXISTS idx_chunks_created
        ON chunks(created_at);

    CREATE TABLE IF NOT EXISTS pending_signals (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        signal_type TEXT NOT NULL DEFAULT 'turn',
        user_message TEXT NOT NULL,
        assistant_message TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_signals_conversation
        ON pending_signals(conversation_id, status);
    CREATE INDEX IF NOT EXISTS idx_signals_status
        ON pending_signals(status, created_at);

    CREATE TABLE IF NOT EXISTS memory_entries (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        entry_type TEXT NOT NULL,
        content TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0.5,
        model TEXT NOT NULL DEFAULT '',
        source_conversation_id TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL DEFAULT 'active',
        superseded_by TEXT,
        created_at TEXT NOT NULL,
        last_accessed TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        valid_from TEXT NOT NULL,
        valid_until TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_entries_agent_status
        ON memory_entries(agent_id, status);
    CREATE INDEX IF NOT EXISTS idx_entries_accessed
        ON memory_entries(agent_id, status, last_accessed DESC);
    CREATE INDEX IF NOT EXISTS idx_entries_valid
        ON memory_entries(agent_id, valid_from, valid_until);

    CREATE TABLE IF NOT EXISTS memory_events (
        id TEXT PRIMARY KEY,
        entry_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        agent_id TEXT,
        model TEXT,
        reason TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memory_events_entry
        ON memory_events(entry_id);
    CREATE INDEX IF NOT EXISTS idx_memory_events_created
        ON memory_events(created_at);

    CREATE TABLE IF NOT EXISTS processing_log (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        model TEXT,
        status TEXT NOT NULL,
        details TEXT,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_processing_log_created
        ON processing_log(created_at);

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        default_model TEXT,
        is_built_in INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    INSERT OR IGNORE INTO agents (id, name, description, default_model, is_built_in, created_at, updated_at)
    VALUES ('default', 'Default', 'Built-in default agent', NULL, 1, datetime('now'), datetime('now'));
";

// ── v2: profile, contributions, user edits, summaries ──────────────────────

const SCHEMA_V2: &str = "
    CREATE TABLE IF NOT EXISTS user_profile (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        content TEXT NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1,
        model TEXT NOT NULL DEFAULT '',
        generated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS profile_events (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        conversation_id TEXT,
        event_type TEXT NOT NULL,
        content TEXT NOT NULL,
        model TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        incorporated_in INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_profile_events_pending
        ON profile_events(event_type, status, incorporated_in);

    CREATE TABLE IF NOT EXISTS user_edits (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    );

    CREATE TABLE IF NOT EXISTS conversation_summaries (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        summary TEXT NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        model TEXT NOT NULL DEFAULT '',
        conversation_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_summaries_agent
        ON conversation_summaries(agent_id, status, conversation_at DESC);
    CREATE INDEX IF NOT EXISTS idx_summaries_conversation
        ON conversation_summaries(conversation_id, status);
";

// ── v3: knowledge graph, embedding index, FTS5 ─────────────────────────────

const SCHEMA_V3: &str = "
    CREATE TABLE IF NOT EXISTS graph_entities (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        entity_type TEXT NOT NULL DEFAULT 'unknown',
        metadata TEXT,
        model TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (name COLLATE NOCASE, entity_type)
    );
    CREATE INDEX IF NOT EXISTS idx_entities_name
        ON graph_entities(name COLLATE NOCASE);

    CREATE TABLE IF NOT EXISTS graph_relationships (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        relation TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0.5,
        model TEXT NOT NULL DEFAULT '',
        valid_from TEXT NOT NULL,
        valid_until TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_relationships_source
        ON graph_relationships(source_id, relation, valid_until);
    CREATE INDEX IF NOT EXISTS idx_relationships_created
        ON graph_relationships(created_at DESC);

    CREATE TABLE IF NOT EXISTS embedding_index (
        source_type TEXT NOT NULL,
        source_id TEXT NOT NULL,
        embedding BLOB NOT NULL,
        model TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        PRIMARY KEY (source_type, source_id)
    );

    -- FTS5 indexes for BM25 lexical search, one per source type,
    -- kept in sync with their base tables by triggers.
    CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
        id UNINDEXED,
        content,
        content=memory_entries,
        content_rowid=rowid,
        tokenize='porter unicode61'
    );
    CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON memory_entries
    BEGIN
        INSERT INTO entries_fts(rowid, id, content)
        VALUES (NEW.rowid, NEW.id, NEW.content);
    END;
    CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON memory_entries
    BEGIN
        INSERT INTO entries_fts(entries_fts, rowid, id, content)
        VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    END;
    CREATE TRIGGER IF NOT EXISTS entries_fts_update AFTER UPDATE ON memory_entries
    BEGIN
        INSERT INTO entries_fts(entries_fts, rowid, id, content)
        VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
        INSERT INTO entries_fts(rowid, id, content)
        VALUES (NEW.rowid, NEW.id, NEW.content);
    END;

    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
        id UNINDEXED,
        content,
        content=chunks,
        content_rowid=rowid,
        tokenize='porter unicode61'
    );
    CREATE TRIGGER IF NOT EXISTS chunks_fts_insert AFTER INSERT ON chunks
    BEGIN
        INSERT INTO chunks_fts(rowid, id, content)
        VALUES (NEW.rowid, NEW.id, NEW.content);
    END;
    CREATE TRIGGER IF NOT EXISTS chunks_fts_delete AFTER DELETE ON chunks
    BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, id, content)
        VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    END;

    CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
        id UNINDEXED,
        summary,
        content=conversation_summaries,
        content_rowid=rowid,
        tokenize='porter unicode61'
    );
    CREATE TRIGGER IF NOT EXISTS summaries_fts_insert AFTER INSERT ON conversation_summaries
    BEGIN
        INSERT INTO summaries_fts(rowid, id, summary)
        VALUES (NEW.rowid, NEW.id, NEW.summary);
    END;
    CREATE TRIGGER IF NOT EXISTS summaries_fts_delete AFTER DELETE ON conversation_summaries
    BEGIN
        INSERT INTO summaries_fts(summaries_fts, rowid, id, summary)
        VALUES ('delete', OLD.rowid, OLD.id, OLD.summary);
    END;
";
