// ── Osaurus Atoms: Memory Core Types ───────────────────────────────────────
// Data-model rows for the four-layer memory store plus the knowledge graph.
// Pure data types — the store owns persistence, the service owns behavior.
//
// Conventions:
//   • Timestamps are ISO-8601 strings (`chrono::Utc::now().to_rfc3339()`).
//   • Row ids are random UUID v4 strings, except graph ids which are
//     deterministic SHA-256 truncations (16 hex chars) so dedup is stable.
//   • Soft lifecycle: rows carry a `status` instead of being hard-deleted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atoms::constants::MAX_ENTRY_CONTENT_CHARS;

// ═══════════════════════════════════════════════════════════════════════════
// Working-memory entries
// ═══════════════════════════════════════════════════════════════════════════

/// What kind of knowledge a working-memory entry captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Fact,
    Preference,
    Decision,
    Correction,
    Commitment,
    Relationship,
    Skill,
}

impl EntryType {
    pub const ALL: [EntryType; 7] = [
        EntryType::Fact,
        EntryType::Preference,
        EntryType::Decision,
        EntryType::Correction,
        EntryType::Commitment,
        EntryType::Relationship,
        EntryType::Skill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Fact => "fact",
            EntryType::Preference => "preference",
            EntryType::Decision => "decision",
            EntryType::Correction => "correction",
            EntryType::Commitment => "commitment",
            EntryType::Relationship => "relationship",
            EntryType::Skill => "skill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Fact-like types can contradict each other even across type boundaries.
    pub fn is_fact_like(&self) -> bool {
        matches!(
            self,
            EntryType::Fact | EntryType::Correction | EntryType::Commitment
        )
    }

    /// Two entries form a contradictable pair when their types are equal or
    /// both fact-like.
    pub fn contradictable_with(&self, other: EntryType) -> bool {
        *self == other || (self.is_fact_like() && other.is_fact_like())
    }
}

/// Logical lifecycle state shared by entries and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Superseded,
    Archived,
    Deleted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Superseded => "superseded",
            EntryStatus::Archived => "archived",
            EntryStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EntryStatus::Active),
            "superseded" => Some(EntryStatus::Superseded),
            "archived" => Some(EntryStatus::Archived),
            "deleted" => Some(EntryStatus::Deleted),
            _ => None,
        }
    }
}

/// A single extracted memory, scoped to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub agent_id: String,
    pub entry_type: EntryType,
    pub content: String,
    /// Confidence in [0, 1]; clamped on construction.
    pub confidence: f64,
    /// Model that produced this entry.
    pub model: String,
    pub source_conversation_id: Option<String>,
    pub tags: Vec<String>,
    pub status: EntryStatus,
    pub superseded_by: Option<String>,
    pub created_at: String,
    pub last_accessed: String,
    pub access_count: i64,
    pub valid_from: String,
    pub valid_until: Option<String>,
}

impl MemoryEntry {
    /// Build a fresh active entry. Confidence is clamped to [0, 1] and
    /// content is truncated (on a char boundary) at the size cap.
    pub fn new(
        agent_id: &str,
        entry_type: EntryType,
        content: &str,
        confidence: f64,
        model: &str,
        source_conversation_id: Option<String>,
        tags: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let content = if content.chars().count() > MAX_ENTRY_CONTENT_CHARS {
            content.chars().take(MAX_ENTRY_CONTENT_CHARS).collect()
        } else {
            content.to_string()
        };
        MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            entry_type,
            content,
            confidence: confidence.clamp(0.0, 1.0),
            model: model.to_string(),
            source_conversation_id,
            tags,
            status: EntryStatus::Active,
            superseded_by: None,
            created_at: now.clone(),
            last_accessed: now.clone(),
            access_count: 0,
            valid_from: now,
            valid_until: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// User profile
// ═══════════════════════════════════════════════════════════════════════════

/// The single global profile row. Exactly zero or one active profile exists;
/// `version` strictly increases across regenerations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub content: String,
    pub token_count: i64,
    pub version: i64,
    pub model: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileEventType {
    Contribution,
    Regeneration,
}

impl ProfileEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileEventType::Contribution => "contribution",
            ProfileEventType::Regeneration => "regeneration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contribution" => Some(ProfileEventType::Contribution),
            "regeneration" => Some(ProfileEventType::Regeneration),
            _ => None,
        }
    }
}

/// A profile fact awaiting incorporation, or a regeneration marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub id: String,
    pub agent_id: String,
    pub conversation_id: Option<String>,
    pub event_type: ProfileEventType,
    pub content: String,
    pub model: Option<String>,
    pub status: EntryStatus,
    /// Profile version that absorbed this contribution; null until then.
    pub incorporated_in: Option<i64>,
    pub created_at: String,
}

/// A manual user-authored override. Never trimmed from context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEdit {
    pub id: String,
    pub content: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Conversations, chunks, summaries, signals
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub title: Option<String>,
    pub started_at: String,
    pub last_message_at: String,
    pub message_count: i64,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRole {
    User,
    Assistant,
}

impl ChunkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::User => "user",
            ChunkRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChunkRole::User),
            "assistant" => Some(ChunkRole::Assistant),
            _ => None,
        }
    }
}

/// One stored conversation turn half (a user or assistant message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub conversation_id: String,
    pub chunk_index: i64,
    pub role: ChunkRole,
    pub content: String,
    pub token_count: i64,
    pub created_at: String,
}

/// One active summary exists per (agent, conversation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub agent_id: String,
    pub conversation_id: String,
    pub summary: String,
    pub token_count: i64,
    pub model: String,
    pub conversation_at: String,
    pub status: EntryStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Processed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Processed => "processed",
        }
    }
}

/// A durably stored raw turn awaiting summary generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSignal {
    pub id: String,
    pub agent_id: String,
    pub conversation_id: String,
    pub signal_type: String,
    pub user_message: String,
    pub assistant_message: Option<String>,
    pub status: SignalStatus,
    pub created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Knowledge graph
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Company,
    Place,
    Project,
    Tool,
    Concept,
    Event,
    Unknown,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Company => "company",
            EntityType::Place => "place",
            EntityType::Project => "project",
            EntityType::Tool => "tool",
            EntityType::Concept => "concept",
            EntityType::Event => "event",
            EntityType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "person" => Some(EntityType::Person),
            "company" => Some(EntityType::Company),
            "place" => Some(EntityType::Place),
            "project" => Some(EntityType::Project),
            "tool" => Some(EntityType::Tool),
            "concept" => Some(EntityType::Concept),
            "event" => Some(EntityType::Event),
            "unknown" => Some(EntityType::Unknown),
            _ => None,
        }
    }
}

/// Deterministic entity id: 16 hex chars of SHA-256 over `lower(name):type`.
/// Random ids here would break graph dedup across extraction runs.
pub fn entity_id(name: &str, entity_type: EntityType) -> String {
    let digest = Sha256::digest(format!("{}:{}", name.to_lowercase(), entity_type.as_str()));
    hex_prefix(&digest, 16)
}

/// Deterministic relationship id: 16 hex chars of SHA-256 over
/// `source_id:relation:target_id`.
pub fn relationship_id(source_id: &str, relation: &str, target_id: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", source_id, relation, target_id));
    hex_prefix(&digest, 16)
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub metadata: Option<String>,
    pub model: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A directed, time-versioned edge. For a (source, relation) pair at most
/// one row has `valid_until` null — the active edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
    pub model: String,
    pub valid_from: String,
    pub valid_until: Option<String>,
    pub created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Audit & operational rows
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome row for one background task (extraction, summary, regeneration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogRow {
    pub id: String,
    pub agent_id: String,
    pub task_type: String,
    pub model: Option<String>,
    pub status: String,
    pub details: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryEventType {
    Created,
    Superseded,
    Deleted,
    Verification,
}

impl MemoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventType::Created => "created",
            MemoryEventType::Superseded => "superseded",
            MemoryEventType::Deleted => "deleted",
            MemoryEventType::Verification => "verification",
        }
    }
}

/// Append-only audit trail row, written atomically with its mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEventRow {
    pub id: String,
    pub entry_id: String,
    pub event_type: MemoryEventType,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub reason: Option<String>,
    pub created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Agents & embedding index
// ═══════════════════════════════════════════════════════════════════════════

/// A configured agent persona (a memory namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub default_model: Option<String>,
    pub is_built_in: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Which table an embedding-index row points back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    Entry,
    Chunk,
    Summary,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSource::Entry => "entry",
            EmbeddingSource::Chunk => "chunk",
            EmbeddingSource::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(EmbeddingSource::Entry),
            "chunk" => Some(EmbeddingSource::Chunk),
            "summary" => Some(EmbeddingSource::Summary),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
