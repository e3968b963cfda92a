// ── Search Service ─────────────────────────────────────────────────────────
// Hybrid lexical + vector retrieval over entries, chunks, and summaries.
//
// Pipeline per query:
//   1. BM25 candidates from the store's FTS5 tables
//   2. Cosine candidates from the per-type vector index (if embeddings on)
//   3. Fusion: fused = α·normalize(bm25) + (1−α)·normalize(cosine), both
//      components min-max normalized across the candidate set (α = 0.5)
//   4. Temporal decay: exp(−ln 2 · age_days / half_life_days)
//   5. MMR rerank over ceil(top_k · fetch_multiplier) candidates
//
// Vector-backend failures degrade to lexical-only with a one-shot warning;
// storage failures surface to the caller. This service never calls back
// into MemoryService.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::atoms::error::MemoryResult;
use crate::atoms::types::{Chunk, ConversationSummary, EmbeddingSource, MemoryEntry};
use crate::embedding::Embedder;
use crate::index::{bytes_to_f32_vec, document_id, f32_vec_to_bytes, VectorIndex};
use crate::similarity::tokenize;
use crate::store::MemoryStore;

/// Weight of the lexical component in hybrid fusion.
const FUSION_ALPHA: f64 = 0.5;

pub struct SearchService {
    store: Arc<MemoryStore>,
    embedder: Arc<Embedder>,
    /// Temporal decay half-life in days; ≤ 0 disables decay.
    half_life_days: f64,
    entries: Mutex<VectorIndex>,
    chunks: Mutex<VectorIndex>,
    summaries: Mutex<VectorIndex>,
    /// document uuid → (source type, row id)
    reverse: Mutex<HashMap<Uuid, (EmbeddingSource, String)>>,
    /// One-shot latch so vector degradation warns once, not per query.
    degraded_warned: AtomicBool,
}

impl SearchService {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<Embedder>, half_life_days: f64) -> Self {
        SearchService {
            store,
            embedder,
            half_life_days,
            entries: Mutex::new(VectorIndex::new()),
            chunks: Mutex::new(VectorIndex::new()),
            summaries: Mutex::new(VectorIndex::new()),
            reverse: Mutex::new(HashMap::new()),
            degraded_warned: AtomicBool::new(false),
        }
    }

    /// Rebuild the in-memory indexes from the store's embedding rows.
    /// The database is the durable form; this runs once at startup.
    pub fn rebuild_from_store(&self) -> MemoryResult<usize> {
        let rows = self.store.all_embeddings()?;
        let mut count = 0usize;
        let mut reverse = self.reverse.lock();
        for (source, source_id, blob) in rows {
            let vector = bytes_to_f32_vec(&blob);
            if vector.is_empty() {
                continue;
            }
            let doc = document_id(source, &source_id);
            self.index_for(source).lock().upsert(doc, vector);
            reverse.insert(doc, (source, source_id));
            count += 1;
        }
        if count > 0 {
            info!("[search] Rebuilt vector indexes: {} documents", count);
        }
        Ok(count)
    }

    fn index_for(&self, source: EmbeddingSource) -> &Mutex<VectorIndex> {
        match source {
            EmbeddingSource::Entry => &self.entries,
            EmbeddingSource::Chunk => &self.chunks,
            EmbeddingSource::Summary => &self.summaries,
        }
    }

    fn warn_degraded(&self, why: &str) {
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            warn!("[search] Vector backend degraded — lexical-only scoring: {}", why);
        }
    }

    // ── Indexing ───────────────────────────────────────────────────────

    /// Embed and index a document: durable row plus in-memory index.
    /// Embedder failures degrade silently (the document stays lexical-only).
    pub async fn index_document(
        &self,
        source: EmbeddingSource,
        source_id: &str,
        text: &str,
    ) -> MemoryResult<()> {
        if !self.embedder.is_enabled() {
            return Ok(());
        }
        let vector = match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                self.warn_degraded(&e.to_string());
                return Ok(());
            }
        };
        self.store
            .upsert_embedding(
                source,
                source_id,
                &f32_vec_to_bytes(&vector),
                self.embedder.model_name(),
            )
            .await?;
        let doc = document_id(source, source_id);
        self.index_for(source).lock().upsert(doc, vector);
        self.reverse
            .lock()
            .insert(doc, (source, source_id.to_string()));
        Ok(())
    }

    /// Drop a document from the in-memory index (the store row is removed
    /// by the transaction that retired the source row).
    pub fn remove_document(&self, source: EmbeddingSource, source_id: &str) {
        let doc = document_id(source, source_id);
        self.index_for(source).lock().remove(&doc);
        self.reverse.lock().remove(&doc);
    }

    // ── Public search operations ───────────────────────────────────────

    pub async fn search_entries(
        &self,
        query: &str,
        agent_id: &str,
        top_k: usize,
        lambda: f64,
        fetch_multiplier: f64,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let fetch_n = over_fetch(top_k, fetch_multiplier);
        let bm25 = self.store.search_entries_bm25(query, agent_id, fetch_n)?;
        let vector = self.vector_candidates(query, EmbeddingSource::Entry, fetch_n).await;

        let mut pool: HashMap<String, (MemoryEntry, Option<f64>, Option<f64>)> = HashMap::new();
        for (entry, score) in bm25 {
            pool.insert(entry.id.clone(), (entry, Some(score), None));
        }
        for (id, cosine) in vector {
            if let Some(slot) = pool.get_mut(&id) {
                slot.2 = Some(cosine);
            } else if let Some(entry) = self.store.get_entry(&id)? {
                if entry.agent_id == agent_id
                    && entry.status == crate::atoms::types::EntryStatus::Active
                {
                    pool.insert(id, (entry, None, Some(cosine)));
                }
            }
        }

        let candidates = self.fuse_and_decay(pool.into_values(), |e| &e.created_at, |e| &e.content);
        Ok(mmr_select(candidates, top_k, lambda))
    }

    pub async fn search_chunks(
        &self,
        query: &str,
        agent_id: &str,
        days_window: u32,
        top_k: usize,
        lambda: f64,
        fetch_multiplier: f64,
    ) -> MemoryResult<Vec<Chunk>> {
        let fetch_n = over_fetch(top_k, fetch_multiplier);
        let bm25 = self
            .store
            .search_chunks_bm25(query, agent_id, days_window, fetch_n)?;
        let vector = self.vector_candidates(query, EmbeddingSource::Chunk, fetch_n).await;

        let cutoff = if days_window == 0 {
            String::new()
        } else {
            (chrono::Utc::now() - chrono::Duration::days(days_window as i64)).to_rfc3339()
        };

        let mut pool: HashMap<String, (Chunk, Option<f64>, Option<f64>)> = HashMap::new();
        for (chunk, score) in bm25 {
            pool.insert(chunk.id.clone(), (chunk, Some(score), None));
        }
        for (id, cosine) in vector {
            if let Some(slot) = pool.get_mut(&id) {
                slot.2 = Some(cosine);
                continue;
            }
            let Some(chunk) = self.store.get_chunk(&id)? else {
                continue;
            };
            if chunk.created_at < cutoff {
                continue;
            }
            let owned = self
                .store
                .get_conversation(&chunk.conversation_id)?
                .map(|c| c.agent_id == agent_id)
                .unwrap_or(false);
            if owned {
                pool.insert(id, (chunk, None, Some(cosine)));
            }
        }

        let candidates = self.fuse_and_decay(pool.into_values(), |c| &c.created_at, |c| &c.content);
        Ok(mmr_select(candidates, top_k, lambda))
    }

    pub async fn search_summaries(
        &self,
        query: &str,
        agent_id: &str,
        days_window: u32,
        top_k: usize,
        lambda: f64,
        fetch_multiplier: f64,
    ) -> MemoryResult<Vec<ConversationSummary>> {
        let fetch_n = over_fetch(top_k, fetch_multiplier);
        let bm25 = self
            .store
            .search_summaries_bm25(query, agent_id, days_window, fetch_n)?;
        let vector = self
            .vector_candidates(query, EmbeddingSource::Summary, fetch_n)
            .await;

        let cutoff = if days_window == 0 {
            String::new()
        } else {
            (chrono::Utc::now() - chrono::Duration::days(days_window as i64)).to_rfc3339()
        };

        let mut pool: HashMap<String, (ConversationSummary, Option<f64>, Option<f64>)> =
            HashMap::new();
        for (summary, score) in bm25 {
            pool.insert(summary.id.clone(), (summary, Some(score), None));
        }
        for (id, cosine) in vector {
            if let Some(slot) = pool.get_mut(&id) {
                slot.2 = Some(cosine);
                continue;
            }
            if let Some(summary) = self.store.get_summary(&id)? {
                if summary.agent_id == agent_id
                    && summary.status == crate::atoms::types::EntryStatus::Active
                    && summary.conversation_at >= cutoff
                {
                    pool.insert(id, (summary, None, Some(cosine)));
                }
            }
        }

        let candidates =
            self.fuse_and_decay(pool.into_values(), |s| &s.conversation_at, |s| &s.summary);
        Ok(mmr_select(candidates, top_k, lambda))
    }

    /// Semantic-only lookup for the verification pipeline: cosine scores
    /// against the entry index, no fusion, no decay. Lexical-only mode
    /// returns no matches (the caller skips its semantic layer).
    pub async fn search_entries_with_scores(
        &self,
        query: &str,
        agent_id: &str,
        top_k: usize,
    ) -> MemoryResult<Vec<(MemoryEntry, f64)>> {
        if !self.embedder.is_enabled() {
            return Ok(Vec::new());
        }
        let query_vec = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                self.warn_degraded(&e.to_string());
                return Ok(Vec::new());
            }
        };

        // Over-fetch, then keep the agent's active entries.
        let hits = self.entries.lock().search(&query_vec, top_k * 4);
        let reverse = self.reverse.lock();
        let mut results = Vec::new();
        for (doc, score) in hits {
            let Some((_, source_id)) = reverse.get(&doc) else {
                continue;
            };
            if let Some(entry) = self.store.get_entry(source_id)? {
                if entry.agent_id == agent_id
                    && entry.status == crate::atoms::types::EntryStatus::Active
                {
                    results.push((entry, score));
                    if results.len() >= top_k {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

    // ── Internals ──────────────────────────────────────────────────────

    async fn vector_candidates(
        &self,
        query: &str,
        source: EmbeddingSource,
        fetch_n: usize,
    ) -> Vec<(String, f64)> {
        if !self.embedder.is_enabled() {
            return Vec::new();
        }
        let query_vec = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                self.warn_degraded(&e.to_string());
                return Vec::new();
            }
        };
        let hits = self.index_for(source).lock().search(&query_vec, fetch_n);
        let reverse = self.reverse.lock();
        hits.into_iter()
            .filter_map(|(doc, score)| {
                reverse
                    .get(&doc)
                    .map(|(_, source_id)| (source_id.clone(), score))
            })
            .collect()
    }

    /// Min-max normalize both score components across the candidate set,
    /// fuse at α, then apply temporal decay.
    fn fuse_and_decay<T>(
        &self,
        pool: impl Iterator<Item = (T, Option<f64>, Option<f64>)>,
        created_at: impl Fn(&T) -> &str,
        content: impl Fn(&T) -> &str,
    ) -> Vec<Candidate<T>> {
        let items: Vec<(T, Option<f64>, Option<f64>)> = pool.collect();

        let bm25_scores: Vec<f64> = items.iter().filter_map(|(_, b, _)| *b).collect();
        let cosine_scores: Vec<f64> = items.iter().filter_map(|(_, _, c)| *c).collect();
        let bm25_norm = min_max(bm25_scores.into_iter());
        let cosine_norm = min_max(cosine_scores.into_iter());

        items
            .into_iter()
            .map(|(item, bm25, cosine)| {
                let b = bm25.map(&bm25_norm).unwrap_or(0.0);
                let c = cosine.map(&cosine_norm).unwrap_or(0.0);
                let mut relevance = FUSION_ALPHA * b + (1.0 - FUSION_ALPHA) * c;
                relevance *= self.decay_weight(created_at(&item));
                let tokens = tokenize(content(&item));
                let created = created_at(&item).to_string();
                Candidate {
                    item,
                    relevance,
                    tokens,
                    created_at: created,
                }
            })
            .collect()
    }

    fn decay_weight(&self, created_at: &str) -> f64 {
        if self.half_life_days <= 0.0 {
            return 1.0;
        }
        let Ok(created) = chrono::DateTime::parse_from_rfc3339(created_at) else {
            return 1.0;
        };
        let age_days = (chrono::Utc::now() - created.with_timezone(&chrono::Utc))
            .num_seconds()
            .max(0) as f64
            / 86_400.0;
        (-(std::f64::consts::LN_2) * age_days / self.half_life_days).exp()
    }
}

fn over_fetch(top_k: usize, fetch_multiplier: f64) -> usize {
    ((top_k as f64) * fetch_multiplier.max(1.0)).ceil() as usize
}

/// Min-max normalization closure over an observed score set. A flat or
/// empty set maps everything to 1.0 (a lone candidate is a full match
/// within its own pool).
fn min_max(scores: impl Iterator<Item = f64>) -> impl Fn(f64) -> f64 {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut any = false;
    for s in scores {
        any = true;
        min = min.min(s);
        max = max.max(s);
    }
    let range = max - min;
    move |s: f64| {
        if !any || range.abs() < 1e-12 {
            1.0
        } else {
            (s - min) / range
        }
    }
}

// ── MMR rerank ─────────────────────────────────────────────────────────────

pub(crate) struct Candidate<T> {
    pub item: T,
    pub relevance: f64,
    pub tokens: HashSet<String>,
    pub created_at: String,
}

/// Iteratively select the candidate maximizing
/// λ·relevance − (1−λ)·max_jaccard_with_selected.
/// Ties break toward higher relevance, then earlier created_at.
pub(crate) fn mmr_select<T>(mut candidates: Vec<Candidate<T>>, top_k: usize, lambda: f64) -> Vec<T> {
    let mut selected: Vec<Candidate<T>> = Vec::with_capacity(top_k.min(candidates.len()));

    while selected.len() < top_k && !candidates.is_empty() {
        let mut best_idx = 0;
        let mut best_key = (f64::NEG_INFINITY, f64::NEG_INFINITY, String::new());

        for (i, candidate) in candidates.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|s| crate::similarity::jaccard_tokenized(&candidate.tokens, &s.tokens))
                .fold(0.0_f64, f64::max);
            let score = lambda * candidate.relevance - (1.0 - lambda) * max_sim;

            let better = score > best_key.0
                || (score == best_key.0
                    && (candidate.relevance > best_key.1
                        || (candidate.relevance == best_key.1
                            && (best_key.2.is_empty() || candidate.created_at < best_key.2))));
            if better {
                best_idx = i;
                best_key = (score, candidate.relevance, candidate.created_at.clone());
            }
        }

        selected.push(candidates.swap_remove(best_idx));
    }

    selected.into_iter().map(|c| c.item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ChunkRole, EntryType};

    fn make_candidate(id: &str, relevance: f64, content: &str, created_at: &str) -> Candidate<String> {
        Candidate {
            item: id.to_string(),
            relevance,
            tokens: tokenize(content),
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn mmr_top1_is_argmax_of_relevance() {
        let candidates = vec![
            make_candidate("low", 0.2, "alpha beta", "2026-01-01"),
            make_candidate("high", 0.9, "gamma delta", "2026-01-02"),
            make_candidate("mid", 0.5, "epsilon zeta", "2026-01-03"),
        ];
        let picked = mmr_select(candidates, 2, 0.7);
        assert_eq!(picked[0], "high");
    }

    #[test]
    fn mmr_output_is_bounded_subset() {
        let candidates: Vec<_> = (0..10)
            .map(|i| make_candidate(&format!("c{}", i), i as f64 / 10.0, "same words here", "2026"))
            .collect();
        let picked = mmr_select(candidates, 4, 0.7);
        assert_eq!(picked.len(), 4);

        let picked = mmr_select(vec![make_candidate("only", 0.5, "x", "2026")], 4, 0.7);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn mmr_promotes_diversity_at_low_lambda() {
        let candidates = vec![
            make_candidate("a", 0.9, "the quick brown fox jumps over the lazy dog", "2026-01-01"),
            make_candidate("b", 0.85, "the quick brown fox jumps over the lazy cat", "2026-01-01"),
            make_candidate("c", 0.6, "rust memory store with hybrid retrieval", "2026-01-01"),
        ];
        let picked = mmr_select(candidates, 3, 0.3);
        assert_eq!(picked[0], "a");
        assert_eq!(picked[1], "c", "diverse item beats the near-duplicate");
    }

    #[test]
    fn mmr_ties_break_by_relevance_then_age() {
        // Identical scores; the earlier created_at wins.
        let candidates = vec![
            make_candidate("newer", 0.5, "alpha", "2026-06-01"),
            make_candidate("older", 0.5, "beta", "2026-01-01"),
        ];
        let picked = mmr_select(candidates, 1, 1.0);
        assert_eq!(picked[0], "older");
    }

    #[test]
    fn min_max_flat_set_maps_to_one() {
        let norm = min_max([0.4, 0.4].into_iter());
        assert_eq!(norm(0.4), 1.0);
        let empty = min_max(std::iter::empty());
        assert_eq!(empty(0.9), 1.0);
    }

    #[test]
    fn over_fetch_ceils() {
        assert_eq!(over_fetch(10, 2.0), 20);
        assert_eq!(over_fetch(3, 1.5), 5);
        assert_eq!(over_fetch(3, 0.1), 3, "multiplier floors at 1.0");
    }

    fn lexical_service() -> SearchService {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        SearchService::new(store, Arc::new(Embedder::disabled()), 0.0)
    }

    #[tokio::test]
    async fn lexical_only_entry_search() {
        let service = lexical_service();
        for content in [
            "User deploys with Kubernetes on GKE",
            "User prefers tabs over spaces",
            "Kubernetes cluster autoscaling is enabled",
        ] {
            let e = MemoryEntry::new("a", EntryType::Fact, content, 0.9, "m", None, vec![]);
            service.store.insert_entry(&e).await.unwrap();
        }

        let hits = service
            .search_entries("kubernetes", "a", 5, 0.7, 2.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.content.contains("Kubernetes")));
    }

    #[tokio::test]
    async fn lexical_only_semantic_scores_are_empty() {
        let service = lexical_service();
        let hits = service
            .search_entries_with_scores("anything", "a", 1)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn chunk_search_respects_agent_scope() {
        let service = lexical_service();
        service
            .store
            .append_chunk("a", "conv-1", ChunkRole::User, "we migrated to postgres")
            .await
            .unwrap();
        service
            .store
            .append_chunk("b", "conv-2", ChunkRole::User, "postgres is slow today")
            .await
            .unwrap();

        let hits = service
            .search_chunks("postgres", "a", 0, 5, 0.7, 2.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, "conv-1");
    }

    #[test]
    fn decay_weight_halves_at_half_life() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let service = SearchService::new(store, Arc::new(Embedder::disabled()), 30.0);
        let thirty_days_ago = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        let weight = service.decay_weight(&thirty_days_ago);
        assert!((weight - 0.5).abs() < 0.01, "weight {} ≈ 0.5", weight);

        let fresh = service.decay_weight(&chrono::Utc::now().to_rfc3339());
        assert!(fresh > 0.99);

        let disabled = SearchService::new(
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            Arc::new(Embedder::disabled()),
            0.0,
        );
        assert_eq!(disabled.decay_weight(&thirty_days_ago), 1.0);
    }
}
