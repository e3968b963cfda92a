// ── Memory Configuration ───────────────────────────────────────────────────
// JSON config persisted at <home>/memory/memory-config.json.
//
// Load semantics: unknown keys are ignored, missing keys take their default,
// every numeric value is clamped to its validated range, and the preset
// overlays its fixed values at the very end. Saved pretty-printed with
// sorted keys (serde_json's default map is ordered).

use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::atoms::error::{MemoryError, MemoryResult};

pub const PRESET_PRODUCTION: &str = "production";
pub const PRESET_BENCHMARK: &str = "benchmark";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Master toggle for the whole memory core.
    #[serde(default = "default_true")]
    pub enabled: bool,

    // ── Core model (extraction / summaries / profile) ────────────────
    #[serde(default = "default_core_provider")]
    pub core_model_provider: String,
    #[serde(default = "default_core_model")]
    pub core_model_name: String,
    #[serde(default = "default_local_base_url")]
    pub core_model_base_url: String,

    // ── Embedding backend ────────────────────────────────────────────
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_local_base_url")]
    pub embedding_base_url: String,

    // ── Summaries ────────────────────────────────────────────────────
    #[serde(default = "default_summary_debounce")]
    pub summary_debounce_seconds: u64,
    #[serde(default = "default_summary_retention_days")]
    pub summary_retention_days: u32,

    // ── Profile ──────────────────────────────────────────────────────
    #[serde(default = "default_profile_max_tokens")]
    pub profile_max_tokens: u32,
    #[serde(default = "default_profile_regen_threshold")]
    pub profile_regenerate_threshold: u32,

    // ── Context budgets ──────────────────────────────────────────────
    #[serde(default = "default_working_memory_budget")]
    pub working_memory_budget_tokens: u32,
    #[serde(default = "default_summary_budget")]
    pub summary_budget_tokens: u32,
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget_tokens: u32,
    #[serde(default = "default_graph_budget")]
    pub graph_budget_tokens: u32,

    // ── Retrieval ────────────────────────────────────────────────────
    #[serde(default = "default_recall_top_k")]
    pub recall_top_k: u32,
    #[serde(default = "default_half_life")]
    pub temporal_decay_half_life_days: f64,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,
    #[serde(default = "default_mmr_fetch_multiplier")]
    pub mmr_fetch_multiplier: f64,

    // ── Verification ─────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub verification_enabled: bool,
    #[serde(default = "default_semantic_dedup_threshold")]
    pub verification_semantic_dedup_threshold: f64,
    #[serde(default = "default_jaccard_dedup_threshold")]
    pub verification_jaccard_dedup_threshold: f64,

    // ── Caps & retention ─────────────────────────────────────────────
    /// Per-agent active-entry cap; 0 = unlimited.
    #[serde(default = "default_max_entries_per_agent")]
    pub max_entries_per_agent: u32,
    /// Purge window for events, processing log and processed signals.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_preset")]
    pub preset: String,
}

// ── Defaults ───────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_core_provider() -> String {
    "anthropic".into()
}
fn default_core_model() -> String {
    "claude-haiku-4-5".into()
}
fn default_local_base_url() -> String {
    "http://127.0.0.1:11434".into()
}
fn default_embedding_backend() -> String {
    "mlx".into()
}
fn default_embedding_model() -> String {
    "nomic-embed-text-v1.5".into()
}
fn default_summary_debounce() -> u64 {
    60
}
fn default_summary_retention_days() -> u32 {
    180
}
fn default_profile_max_tokens() -> u32 {
    2000
}
fn default_profile_regen_threshold() -> u32 {
    10
}
fn default_working_memory_budget() -> u32 {
    3000
}
fn default_summary_budget() -> u32 {
    2000
}
fn default_chunk_budget() -> u32 {
    4000
}
fn default_graph_budget() -> u32 {
    300
}
fn default_recall_top_k() -> u32 {
    30
}
fn default_half_life() -> f64 {
    30.0
}
fn default_mmr_lambda() -> f64 {
    0.7
}
fn default_mmr_fetch_multiplier() -> f64 {
    2.0
}
fn default_semantic_dedup_threshold() -> f64 {
    0.85
}
fn default_jaccard_dedup_threshold() -> f64 {
    0.6
}
fn default_max_entries_per_agent() -> u32 {
    500
}
fn default_retention_days() -> u32 {
    30
}
fn default_preset() -> String {
    PRESET_PRODUCTION.into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        // serde_json fills every field from its default fn.
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

// ── Validation, presets, persistence ───────────────────────────────────────

impl MemoryConfig {
    /// Clamp every numeric value to its validated range, then apply the
    /// preset overlay. Safe to call repeatedly (idempotent).
    pub fn validate(&mut self) {
        self.summary_debounce_seconds = self.summary_debounce_seconds.clamp(10, 3600);
        self.profile_max_tokens = self.profile_max_tokens.clamp(100, 50_000);
        self.profile_regenerate_threshold = self.profile_regenerate_threshold.clamp(1, 100);
        self.working_memory_budget_tokens = self.working_memory_budget_tokens.clamp(50, 10_000);
        self.summary_retention_days = self.summary_retention_days.min(3650);
        self.summary_budget_tokens = self.summary_budget_tokens.clamp(50, 10_000);
        self.chunk_budget_tokens = self.chunk_budget_tokens.clamp(50, 20_000);
        self.graph_budget_tokens = self.graph_budget_tokens.clamp(50, 5_000);
        self.recall_top_k = self.recall_top_k.clamp(1, 100);
        self.temporal_decay_half_life_days = self.temporal_decay_half_life_days.clamp(1.0, 365.0);
        self.mmr_lambda = self.mmr_lambda.clamp(0.0, 1.0);
        self.mmr_fetch_multiplier = self.mmr_fetch_multiplier.clamp(1.0, 10.0);
        self.max_entries_per_agent = self.max_entries_per_agent.min(10_000);
        self.verification_semantic_dedup_threshold =
            self.verification_semantic_dedup_threshold.clamp(0.0, 1.0);
        self.verification_jaccard_dedup_threshold =
            self.verification_jaccard_dedup_threshold.clamp(0.0, 1.0);
        self.retention_days = self.retention_days.clamp(1, 365);

        if self.preset != PRESET_PRODUCTION && self.preset != PRESET_BENCHMARK {
            warn!(
                "[config] Unknown preset '{}' — falling back to '{}'",
                self.preset, PRESET_PRODUCTION
            );
            self.preset = PRESET_PRODUCTION.into();
        }
        self.apply_preset();
    }

    /// Overlay the preset's fixed values. Runs after clamping so presets
    /// always win.
    fn apply_preset(&mut self) {
        match self.preset.as_str() {
            PRESET_BENCHMARK => {
                self.recall_top_k = 50;
                self.mmr_lambda = 0.85;
                self.mmr_fetch_multiplier = 3.0;
                self.working_memory_budget_tokens = 6000;
                self.summary_budget_tokens = 4000;
                self.chunk_budget_tokens = 8000;
                self.graph_budget_tokens = 500;
                self.summary_retention_days = 0;
            }
            _ => {
                self.recall_top_k = 30;
                self.mmr_lambda = 0.7;
                self.mmr_fetch_multiplier = 2.0;
                self.working_memory_budget_tokens = 3000;
                self.summary_budget_tokens = 2000;
                self.chunk_budget_tokens = 4000;
                self.graph_budget_tokens = 300;
                self.summary_retention_days = 180;
            }
        }
    }

    /// Load from disk; a missing file yields the validated defaults.
    /// An unreadable or malformed file is a configuration error.
    pub fn load(path: &Path) -> MemoryResult<Self> {
        let mut config: MemoryConfig = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| MemoryError::Config(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| MemoryError::Config(format!("parse {}: {}", path.display(), e)))?
        } else {
            info!(
                "[config] No config at {} — using defaults",
                path.display()
            );
            MemoryConfig::default()
        };
        config.validate();
        Ok(config)
    }

    /// Write pretty-printed with sorted keys.
    pub fn save(&self, path: &Path) -> MemoryResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Round-trip through Value: serde_json's map is ordered, so keys
        // come out sorted.
        let value = serde_json::to_value(self)?;
        let pretty = serde_json::to_string_pretty(&value)?;
        std::fs::write(path, pretty + "\n")?;
        Ok(())
    }

    /// Whether vector features are enabled at all.
    pub fn embedding_enabled(&self) -> bool {
        self.embedding_backend != "none"
    }
}
