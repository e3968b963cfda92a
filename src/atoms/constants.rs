// ── Osaurus Atoms: Shared Constants ────────────────────────────────────────
// Cross-component constants. Thresholds that belong to a single component
// live at the top of that component's module instead.

/// Entry content longer than this is truncated (not rejected) on construction.
pub const MAX_ENTRY_CONTENT_CHARS: usize = 50_000;

/// How many existing active entries are shown to the extraction prompt.
pub const EXTRACTION_PROMPT_ENTRY_LIMIT: usize = 30;

/// Sampling temperature for extraction / summary / profile model calls.
pub const CORE_MODEL_TEMPERATURE: f32 = 0.3;

/// Completion budget for extraction model calls.
pub const CORE_MODEL_MAX_TOKENS: u32 = 2048;

/// Jaccard overlap above which two contradictable entries supersede.
pub const CONTRADICTION_JACCARD_THRESHOLD: f64 = 0.3;

/// Jaccard overlap above which a profile contribution is a duplicate.
pub const PROFILE_DEDUP_JACCARD_THRESHOLD: f64 = 0.6;

/// Per-call deadline for core model calls.
pub const MODEL_CALL_TIMEOUT_SECS: u64 = 60;

/// Retry budget for core model calls (delays 1s, 2s, 4s).
pub const MODEL_CALL_MAX_RETRIES: u32 = 3;

/// Initial model-call retry delay in milliseconds (doubles each attempt).
pub const MODEL_CALL_RETRY_BASE_MS: u64 = 1_000;

/// Consecutive failures before the circuit breaker trips.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Cooldown while the circuit breaker is open.
pub const CIRCUIT_BREAKER_COOLDOWN_SECS: u64 = 60;

/// Character budget per estimated token in context assembly.
pub const CHARS_PER_TOKEN: usize = 4;

/// TTL for the per-agent assembled-context cache.
pub const CONTEXT_CACHE_TTL_SECS: u64 = 10;

/// Most-recent active graph relationships shown in context.
pub const GRAPH_RELATIONSHIP_LIMIT: usize = 30;
