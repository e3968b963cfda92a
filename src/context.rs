// ── Context Assembler ──────────────────────────────────────────────────────
// Builds the memory block injected into chat prompts: five sections in
// fixed priority order, each under its own token budget.
//
//   # User Overrides                  (never trimmed)
//   # User Profile                    (never trimmed)
//   # Working Memory                  (workingMemoryBudgetTokens)
//   # Recent Conversation Summaries   (summaryBudgetTokens)
//   # Key Relationships               (graphBudgetTokens)
//
// Budget math: a line is accepted only while
// used_chars + line_len ≤ budget_tokens × CHARS_PER_TOKEN; order is
// preserved, no reordering for packing. A storage failure in one section
// omits that section, never the whole block.
//
// Query-aware mode (cache bypassed) appends "Relevant Memories" and
// "Relevant Conversation Excerpts" from hybrid search, skipping entries
// already substring-contained in the base block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;

use crate::atoms::constants::{CHARS_PER_TOKEN, CONTEXT_CACHE_TTL_SECS, GRAPH_RELATIONSHIP_LIMIT};
use crate::atoms::error::MemoryResult;
use crate::config::MemoryConfig;
use crate::search::SearchService;
use crate::store::MemoryStore;

pub struct ContextAssembler {
    store: Arc<MemoryStore>,
    search: Arc<SearchService>,
    config: MemoryConfig,
    /// agent_id → (assembled block, built-at). 10-second TTL.
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl ContextAssembler {
    pub fn new(store: Arc<MemoryStore>, search: Arc<SearchService>, config: MemoryConfig) -> Self {
        ContextAssembler {
            store,
            search,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop one agent's cached block, or all of them.
    pub fn invalidate(&self, agent_id: Option<&str>) {
        let mut cache = self.cache.lock();
        match agent_id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }

    /// Assemble the memory block for an agent. Plain mode is cached for
    /// 10 seconds; passing a query always bypasses the cache.
    pub async fn assemble(&self, agent_id: &str, query: Option<&str>) -> MemoryResult<String> {
        let query = query.filter(|q| !q.trim().is_empty());

        if query.is_none() {
            let cache = self.cache.lock();
            if let Some((block, built_at)) = cache.get(agent_id) {
                if built_at.elapsed() < Duration::from_secs(CONTEXT_CACHE_TTL_SECS) {
                    return Ok(block.clone());
                }
            }
        }

        let base = self.assemble_base(agent_id).await?;
        let block = match query {
            None => {
                self.cache
                    .lock()
                    .insert(agent_id.to_string(), (base.clone(), Instant::now()));
                base
            }
            Some(q) => self.append_query_sections(agent_id, q, base).await,
        };
        Ok(block)
    }

    // ── Base sections ──────────────────────────────────────────────────

    async fn assemble_base(&self, agent_id: &str) -> MemoryResult<String> {
        let mut sections: Vec<String> = Vec::new();

        // 1. User overrides — all active edits, never trimmed.
        match self.store.active_user_edits() {
            Ok(edits) if !edits.is_empty() => {
                let lines: Vec<String> =
                    edits.iter().map(|e| format!("- {}", e.content)).collect();
                sections.push(format!("# User Overrides\n{}", lines.join("\n")));
            }
            Ok(_) => {}
            Err(e) => warn!("[context] Omitting user overrides: {}", e),
        }

        // 2. User profile — verbatim, never trimmed.
        match self.store.get_profile() {
            Ok(Some(profile)) if !profile.content.is_empty() => {
                sections.push(format!("# User Profile\n{}", profile.content));
            }
            Ok(_) => {}
            Err(e) => warn!("[context] Omitting profile: {}", e),
        }

        // 3. Working memory — newest-last-accessed first, budgeted.
        match self.store.load_active_entries(agent_id, None) {
            Ok(entries) => {
                let lines = budget_lines(
                    entries.iter().map(|e| {
                        format!(
                            "- [{}] {} (date: {})",
                            e.entry_type.as_str(),
                            e.content,
                            date_only(&e.valid_from)
                        )
                    }),
                    self.config.working_memory_budget_tokens as usize,
                );
                if !lines.is_empty() {
                    // Emitted entries get their access tracking bumped in
                    // one batch.
                    let emitted: Vec<String> = entries
                        .iter()
                        .take(lines.len())
                        .map(|e| e.id.clone())
                        .collect();
                    if let Err(e) = self.store.touch_entries(&emitted).await {
                        warn!("[context] Access-tracking update failed: {}", e);
                    }
                    sections.push(format!("# Working Memory\n{}", lines.join("\n")));
                }
            }
            Err(e) => warn!("[context] Omitting working memory: {}", e),
        }

        // 4. Recent conversation summaries — newest first, budgeted.
        match self
            .store
            .summaries_for_agent(agent_id, self.config.summary_retention_days, None)
        {
            Ok(summaries) => {
                let lines = budget_lines(
                    summaries.iter().map(|s| {
                        format!("- [date: {}] {}", date_only(&s.conversation_at), s.summary)
                    }),
                    self.config.summary_budget_tokens as usize,
                );
                if !lines.is_empty() {
                    sections.push(format!(
                        "# Recent Conversation Summaries\n{}",
                        lines.join("\n")
                    ));
                }
            }
            Err(e) => warn!("[context] Omitting summaries: {}", e),
        }

        // 5. Key relationships — most recent active edges, budgeted.
        match self
            .store
            .recent_active_relationships(GRAPH_RELATIONSHIP_LIMIT)
        {
            Ok(relationships) => {
                let lines = budget_lines(
                    relationships
                        .iter()
                        .map(|(source, relation, target)| {
                            format!("- {} -> {} -> {}", source, relation, target)
                        }),
                    self.config.graph_budget_tokens as usize,
                );
                if !lines.is_empty() {
                    sections.push(format!("# Key Relationships\n{}", lines.join("\n")));
                }
            }
            Err(e) => warn!("[context] Omitting relationships: {}", e),
        }

        Ok(sections.join("\n\n"))
    }

    // ── Query-aware sections ───────────────────────────────────────────

    async fn append_query_sections(&self, agent_id: &str, query: &str, base: String) -> String {
        let mut block = base;

        let entries = self
            .search
            .search_entries(
                query,
                agent_id,
                self.config.recall_top_k as usize,
                self.config.mmr_lambda,
                self.config.mmr_fetch_multiplier,
            )
            .await;
        match entries {
            Ok(entries) => {
                let lines = budget_lines(
                    entries
                        .iter()
                        // Skip what the base context already carries.
                        .filter(|e| !block.contains(&e.content))
                        .map(|e| format!("- [{}] {}", e.entry_type.as_str(), e.content)),
                    self.config.working_memory_budget_tokens as usize,
                );
                if !lines.is_empty() {
                    block.push_str(&format!("\n\n# Relevant Memories\n{}", lines.join("\n")));
                }
            }
            Err(e) => warn!("[context] Omitting relevant memories: {}", e),
        }

        let chunks = self
            .search
            .search_chunks(
                query,
                agent_id,
                self.config.summary_retention_days,
                self.config.recall_top_k as usize,
                self.config.mmr_lambda,
                self.config.mmr_fetch_multiplier,
            )
            .await;
        match chunks {
            Ok(chunks) => {
                let lines = budget_lines(
                    chunks.iter().map(|c| {
                        format!("- [date: {}] {}", date_only(&c.created_at), c.content)
                    }),
                    self.config.chunk_budget_tokens as usize,
                );
                if !lines.is_empty() {
                    block.push_str(&format!(
                        "\n\n# Relevant Conversation Excerpts\n{}",
                        lines.join("\n")
                    ));
                }
            }
            Err(e) => warn!("[context] Omitting conversation excerpts: {}", e),
        }

        block
    }
}

/// Append lines while they fit: used_chars + line_len ≤ budget chars.
/// The first rejected line stops the section (no reordering, no packing).
fn budget_lines(lines: impl Iterator<Item = String>, budget_tokens: usize) -> Vec<String> {
    let budget_chars = budget_tokens * CHARS_PER_TOKEN;
    let mut used = 0usize;
    let mut out = Vec::new();
    for line in lines {
        let len = line.chars().count();
        if used + len > budget_chars {
            break;
        }
        used += len;
        out.push(line);
    }
    out
}

/// YYYY-MM-DD prefix of an ISO-8601 timestamp.
fn date_only(timestamp: &str) -> &str {
    if timestamp.len() >= 10 {
        &timestamp[..10]
    } else {
        timestamp
    }
}
