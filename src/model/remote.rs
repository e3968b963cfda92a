// HTTP-backed model services. Two wire formats cover the catalog:
//   • AnthropicService — api.anthropic.com /v1/messages
//   • OpenAiCompatService — /v1/chat/completions, which is also how local
//     servers (Ollama, MLX, llama.cpp) expose chat models.
//
// Both return the full text in one shot; retries, timeouts, and the
// circuit breaker live in MemoryService, not here.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde_json::{json, Value};

use super::{GenerateRequest, GenerateResponse, ModelService};
use crate::atoms::error::{MemoryError, MemoryResult};

/// Generous wire timeout; the caller races a tighter deadline around it.
const REQUEST_TIMEOUT_SECS: u64 = 120;

// ── Anthropic ──────────────────────────────────────────────────────────────

pub struct AnthropicService {
    client: Client,
    base_url: String,
    api_key: String,
    models: Vec<String>,
}

impl AnthropicService {
    pub fn new(api_key: &str, models: Vec<String>) -> Self {
        AnthropicService {
            client: Client::new(),
            base_url: "https://api.anthropic.com".into(),
            api_key: api_key.to_string(),
            models,
        }
    }

    /// Build from the ANTHROPIC_API_KEY environment variable, if present.
    pub fn from_env(models: Vec<String>) -> Option<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY").ok()?;
        if key.trim().is_empty() {
            return None;
        }
        Some(Self::new(&key, models))
    }
}

#[async_trait]
impl ModelService for AnthropicService {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn claims(&self, model: &str) -> Option<String> {
        if self.models.iter().any(|m| m == model) || model.starts_with("claude-") {
            Some(model.to_string())
        } else {
            None
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> MemoryResult<GenerateResponse> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::ModelCall {
                model: request.model.clone(),
                message: truncate_error(&text),
                status: Some(status),
            });
        }

        let v: Value = resp.json().await?;
        let text = v["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(GenerateResponse {
            text,
            input_tokens: v["usage"]["input_tokens"].as_i64().unwrap_or(0),
            output_tokens: v["usage"]["output_tokens"].as_i64().unwrap_or(0),
        })
    }
}

// ── OpenAI-compatible ──────────────────────────────────────────────────────

pub struct OpenAiCompatService {
    client: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    /// Explicit model ids this service serves; empty = serves anything
    /// (a local single-tenant server).
    models: Vec<String>,
}

impl OpenAiCompatService {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>, models: Vec<String>) -> Self {
        OpenAiCompatService {
            client: Client::new(),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models,
        }
    }
}

#[async_trait]
impl ModelService for OpenAiCompatService {
    fn name(&self) -> &str {
        &self.name
    }

    fn claims(&self, model: &str) -> Option<String> {
        if self.models.is_empty() || self.models.iter().any(|m| m == model) {
            Some(model.to_string())
        } else {
            None
        }
    }

    async fn generate(&self, request: &GenerateRequest) -> MemoryResult<GenerateResponse> {
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for (role, content) in &request.messages {
            messages.push(json!({ "role": role, "content": content }));
        }

        let body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(MemoryError::ModelCall {
                model: request.model.clone(),
                message: truncate_error(&text),
                status: Some(status),
            });
        }

        let v: Value = resp.json().await?;
        let text = v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_else(|| {
                warn!("[model] {}: response had no message content", self.name);
                ""
            })
            .to_string();

        Ok(GenerateResponse {
            text,
            input_tokens: v["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            output_tokens: v["usage"]["completion_tokens"].as_i64().unwrap_or(0),
        })
    }
}

/// Keep provider error bodies log-sized.
fn truncate_error(text: &str) -> String {
    const MAX: usize = 500;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_claims_claude_prefix() {
        let svc = AnthropicService::new("key", vec!["claude-haiku-4-5".into()]);
        assert!(svc.claims("claude-haiku-4-5").is_some());
        assert!(svc.claims("claude-opus-4").is_some());
        assert!(svc.claims("llama-3.2").is_none());
    }

    #[test]
    fn openai_compat_with_empty_catalog_claims_all() {
        let local = OpenAiCompatService::new("local", "http://127.0.0.1:11434/", None, vec![]);
        assert!(local.claims("anything-at-all").is_some());
        assert_eq!(local.base_url, "http://127.0.0.1:11434");

        let scoped = OpenAiCompatService::new(
            "openai",
            "https://api.openai.com",
            Some("k".into()),
            vec!["gpt-4o-mini".into()],
        );
        assert!(scoped.claims("gpt-4o-mini").is_some());
        assert!(scoped.claims("other").is_none());
    }

    #[test]
    fn error_bodies_are_truncated() {
        let long = "x".repeat(2000);
        assert!(truncate_error(&long).len() < 600);
        assert_eq!(truncate_error("short"), "short");
    }
}
