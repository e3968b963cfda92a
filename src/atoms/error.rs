// ── Osaurus Atoms: Error Types ─────────────────────────────────────────────
// Canonical error enums for the memory core, built with `thiserror`.
//
// Design rules:
//   • `StorageError` is the store's own taxonomy — callers can tell a
//     constraint conflict from a transient busy from a broken migration.
//   • `MemoryError` is the crate-wide enum; `#[from]` wires std/external
//     conversions automatically.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Storage errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    /// The store has not been opened (or was already closed).
    #[error("store is not open")]
    NotOpen,

    /// A schema migration failed; the process must not serve traffic.
    #[error("migration to schema v{version} failed: {message}")]
    MigrationFailed { version: i64, message: String },

    /// Primary-key or unique-constraint collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Statement preparation failed (bad SQL, missing table).
    #[error("prepare failed: {0}")]
    Prepare(rusqlite::Error),

    /// Statement execution failed.
    #[error("execute failed: {0}")]
    Execute(rusqlite::Error),

    /// Database stayed busy/locked through the retry budget.
    #[error("database busy: {0}")]
    Busy(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(inner, msg) => match inner.code {
                ErrorCode::ConstraintViolation => {
                    StorageError::Conflict(msg.clone().unwrap_or_else(|| inner.to_string()))
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    StorageError::Busy(msg.clone().unwrap_or_else(|| inner.to_string()))
                }
                _ => StorageError::Execute(e),
            },
            _ => StorageError::Execute(e),
        }
    }
}

impl StorageError {
    /// Transient faults worth retrying at the store layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

// ── Crate-wide error enum ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration file is unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// No registered service claims the requested model identifier.
    #[error("core model unavailable: {0}")]
    CoreModelUnavailable(String),

    /// A model call exceeded its deadline.
    #[error("model call timed out after {seconds}s: {model}")]
    ModelCallTimedOut { model: String, seconds: u64 },

    /// The circuit breaker is open; calls fail fast until the deadline.
    #[error("circuit breaker open, retry in {retry_in_secs}s")]
    CircuitBreakerOpen { retry_in_secs: u64 },

    /// The model service returned an API-level failure.
    #[error("model error: {model}: {message}")]
    ModelCall {
        model: String,
        message: String,
        /// HTTP status, when the failure came from a status code.
        status: Option<u16>,
    },

    /// The embedding backend is disabled or unreachable.
    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    /// Client-side request validation failure (HTTP 4xx).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Catch-all. Prefer adding a specific variant over using this.
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Whether a model-call failure should count against the retry budget
    /// (vs. breaking out immediately as permanent).
    pub fn is_retryable_model_error(&self) -> bool {
        match self {
            MemoryError::Network(_) => true,
            MemoryError::ModelCallTimedOut { .. } => true,
            MemoryError::ModelCall { status, .. } => match status {
                Some(code) => matches!(code, 429 | 500 | 502 | 503 | 504 | 529),
                None => true,
            },
            _ => false,
        }
    }
}

// ── Migration bridge: String → MemoryError ─────────────────────────────────
// Allows `?` on helpers still returning `Result<T, String>`.

impl From<String> for MemoryError {
    fn from(s: String) -> Self {
        MemoryError::Other(s)
    }
}

impl From<&str> for MemoryError {
    fn from(s: &str) -> Self {
        MemoryError::Other(s.to_string())
    }
}

// ── Convenience aliases ────────────────────────────────────────────────────

pub type StorageResult<T> = Result<T, StorageError>;
pub type MemoryResult<T> = Result<T, MemoryError>;
