// ── Embedder ───────────────────────────────────────────────────────────────
// Produces fixed-dimension f32 vectors for text via a local embedding server.
//
// Backends:
//   "none"   — vector features disabled; every operation short-circuits.
//   "ollama" — native /api/embed endpoint, with the legacy /api/embeddings
//              endpoint as a fallback for older servers.
//   anything else ("mlx", "openai", …) — OpenAI-compatible /v1/embeddings.
//
// The first successful embed pins the vector dimension; later vectors with
// a different dimension are rejected so the index stays consistent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{info, warn};
use reqwest::Client;
use serde_json::{json, Value};

use crate::atoms::error::{MemoryError, MemoryResult};

const EMBED_TIMEOUT_SECS: u64 = 60;
const PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Disabled,
    Ollama,
    OpenAiCompatible,
}

pub struct Embedder {
    backend: Backend,
    client: Client,
    base_url: String,
    model: String,
    /// Pinned vector dimension; 0 until the first successful embed.
    dimension: AtomicUsize,
}

impl Embedder {
    /// Build from config strings. `backend == "none"` disables everything.
    pub fn new(backend: &str, base_url: &str, model: &str) -> Self {
        let backend = match backend {
            "none" => Backend::Disabled,
            "ollama" => Backend::Ollama,
            other => {
                info!(
                    "[embed] Backend '{}' uses the OpenAI-compatible embeddings endpoint",
                    other
                );
                Backend::OpenAiCompatible
            }
        };
        Embedder {
            backend,
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension: AtomicUsize::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new("none", "", "")
    }

    pub fn is_enabled(&self) -> bool {
        self.backend != Backend::Disabled
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// The pinned dimension, if any embed has succeeded yet.
    pub fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::Relaxed) {
            0 => None,
            d => Some(d),
        }
    }

    /// Embed one text. Disabled backends fail with `EmbedderUnavailable`.
    pub async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let vec = match self.backend {
            Backend::Disabled => {
                return Err(MemoryError::EmbedderUnavailable(
                    "embedding backend is 'none'".into(),
                ))
            }
            Backend::Ollama => self.embed_ollama(text).await?,
            Backend::OpenAiCompatible => self.embed_openai(text).await?,
        };

        let pinned = self.dimension.load(Ordering::Relaxed);
        if pinned == 0 {
            self.dimension.store(vec.len(), Ordering::Relaxed);
            info!(
                "[embed] Pinned dimension {} for model '{}'",
                vec.len(),
                self.model
            );
        } else if vec.len() != pinned {
            warn!(
                "[embed] Dimension mismatch: got {}, pinned {} — rejecting vector",
                vec.len(),
                pinned
            );
            return Err(MemoryError::EmbedderUnavailable(format!(
                "dimension mismatch: got {}, expected {}",
                vec.len(),
                pinned
            )));
        }
        Ok(vec)
    }

    /// Probe backend availability without side effects.
    pub async fn healthy(&self) -> bool {
        match self.backend {
            Backend::Disabled => false,
            Backend::Ollama => self.probe(&format!("{}/api/tags", self.base_url)).await,
            Backend::OpenAiCompatible => self.probe(&format!("{}/v1/models", self.base_url)).await,
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32…]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32…] }
    async fn embed_ollama(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": text });

        let result = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await;

        if let Ok(resp) = result {
            if resp.status().is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    if let Some(vec) = extract_vector(&v["embeddings"][0])
                        .or_else(|| extract_vector(&v["embedding"]))
                    {
                        return Ok(vec);
                    }
                }
            }
        }

        // Legacy endpoint for pre-0.4 Ollama servers.
        let legacy_url = format!("{}/api/embeddings", self.base_url);
        let legacy_body = json!({ "model": self.model, "prompt": text });
        let resp = self
            .client
            .post(&legacy_url)
            .json(&legacy_body)
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                MemoryError::EmbedderUnavailable(format!(
                    "Ollama not reachable at {}: {}",
                    self.base_url, e
                ))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::EmbedderUnavailable(format!(
                "Ollama embed {} — {}",
                status, text
            )));
        }

        let v: Value = resp.json().await?;
        extract_vector(&v["embedding"]).ok_or_else(|| {
            MemoryError::EmbedderUnavailable("no 'embedding' array in Ollama response".into())
        })
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input }
    async fn embed_openai(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({ "model": self.model, "input": text });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                MemoryError::EmbedderUnavailable(format!(
                    "embedding server not reachable at {}: {}",
                    self.base_url, e
                ))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::EmbedderUnavailable(format!(
                "embed {} — {}",
                status, text
            )));
        }

        let v: Value = resp.json().await?;
        extract_vector(&v["data"][0]["embedding"]).ok_or_else(|| {
            MemoryError::EmbedderUnavailable("no 'data[0].embedding' array in response".into())
        })
    }
}

fn extract_vector(v: &Value) -> Option<Vec<f32>> {
    let arr = v.as_array()?;
    let vec: Vec<f32> = arr
        .iter()
        .filter_map(|x| x.as_f64().map(|f| f as f32))
        .collect();
    if vec.is_empty() {
        None
    } else {
        Some(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_backend_is_disabled() {
        let e = Embedder::new("none", "http://127.0.0.1:11434", "nomic-embed-text-v1.5");
        assert!(!e.is_enabled());
        assert!(e.dimension().is_none());
    }

    #[tokio::test]
    async fn disabled_embed_short_circuits() {
        let e = Embedder::disabled();
        let err = e.embed("hello").await.unwrap_err();
        assert!(matches!(err, MemoryError::EmbedderUnavailable(_)));
        assert!(!e.healthy().await);
    }

    #[test]
    fn unknown_backend_maps_to_openai_compatible() {
        let e = Embedder::new("mlx", "http://127.0.0.1:9000/", "nomic-embed-text-v1.5");
        assert!(e.is_enabled());
        assert_eq!(e.base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn extract_vector_shapes() {
        let v = json!([0.1, 0.2, 0.3]);
        assert_eq!(extract_vector(&v).unwrap().len(), 3);
        assert!(extract_vector(&json!([])).is_none());
        assert!(extract_vector(&json!("nope")).is_none());
    }
}
