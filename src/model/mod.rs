// ── Model Services ─────────────────────────────────────────────────────────
// The memory core consumes chat models through one minimal interface:
// a request-scoped `generate` call returning a full text response.
// Streaming, tool calls, and vision stay with the host app.
//
// Module layout:
//   remote — Anthropic + OpenAI-compatible HTTP services
//   router — pure resolution of a requested model id to a service

pub mod remote;
pub mod router;

use async_trait::async_trait;

use crate::atoms::error::MemoryResult;

/// A single chat-completion request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: Option<String>,
    /// (role, content) pairs, roles "user" / "assistant".
    pub messages: Vec<(String, String)>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait ModelService: Send + Sync {
    /// Service name for logs ("anthropic", "local-ollama", …).
    fn name(&self) -> &str;

    /// If this service claims `model`, the effective model identifier to
    /// send on the wire (services may alias ids).
    fn claims(&self, model: &str) -> Option<String>;

    async fn generate(&self, request: &GenerateRequest) -> MemoryResult<GenerateResponse>;
}
