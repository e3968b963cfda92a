// ── Vector Index ───────────────────────────────────────────────────────────
// In-memory cosine-similarity index keyed by deterministic document UUIDs.
// The durable form of every vector is the store's embedding_index table;
// this index is rebuilt from it at startup, so upsert must be idempotent.
//
// Document ids are UUID v5 over "source_type|source_id" — re-indexing the
// same row always lands on the same id, and reverse maps stay stable.

use std::collections::HashMap;

use uuid::Uuid;

use crate::atoms::types::EmbeddingSource;

/// Deterministic document id for an indexed row.
pub fn document_id(source: EmbeddingSource, source_id: &str) -> Uuid {
    let name = format!("{}|{}", source.as_str(), source_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

#[derive(Default)]
pub struct VectorIndex {
    docs: HashMap<Uuid, Vec<f32>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a document vector.
    pub fn upsert(&mut self, id: Uuid, embedding: Vec<f32>) {
        self.docs.insert(id, embedding);
    }

    /// Remove a document. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: &Uuid) {
        self.docs.remove(id);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Cosine-similarity top-K, score-descending.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(Uuid, f64)> {
        if query.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(Uuid, f64)> = self
            .docs
            .iter()
            .map(|(id, vec)| (*id, cosine_similarity(query, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

// ── Vector math & blob helpers ─────────────────────────────────────────────

/// Convert a byte slice (SQLite BLOB) to a Vec<f32>.
pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for SQLite BLOB storage.
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine similarity between two vectors. Returns 0.0 on length mismatch
/// or zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}
