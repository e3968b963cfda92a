// ── HTTP Surface ───────────────────────────────────────────────────────────
// The memory-related endpoints, served on localhost:
//
//   POST /chat/completions  — transparent memory injection via the
//                             X-Osaurus-Agent-Id header, then forwards to
//                             the model resolved from the request body
//   POST /memory/ingest     — durable turn ingestion; extraction detaches
//   GET  /agents            — configured agents + active-entry counts
//   GET  /health            — liveness probe
//
// Chat keeps working when memory is degraded: injection failures are
// logged and skipped, never surfaced to the client.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::context::ContextAssembler;
use crate::model::{router as model_router, GenerateRequest};
use crate::service::MemoryService;

/// Header carrying the agent namespace for transparent injection.
pub const AGENT_HEADER: &str = "x-osaurus-agent-id";

/// Request-body cap on /memory/ingest.
const MAX_INGEST_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MemoryService>,
    pub assembler: Arc<ContextAssembler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route(
            "/memory/ingest",
            post(ingest).layer(DefaultBodyLimit::max(MAX_INGEST_BYTES)),
        )
        .route("/chat/completions", post(chat_completions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> MemoryResult<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MemoryError::Other(format!("bind {}: {}", addr, e)))?;
    info!("[server] Listening on http://{}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| MemoryError::Other(format!("serve: {}", e)))
}

fn error_json(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

// ── GET /health ────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "memory_enabled": state.service.config().enabled,
    }))
}

// ── GET /agents ────────────────────────────────────────────────────────────

async fn list_agents(State(state): State<AppState>) -> Response {
    let store = state.service.store();
    let agents = match store.list_agents() {
        Ok(agents) => agents,
        Err(e) => {
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", &e.to_string())
        }
    };

    let mut rows = Vec::with_capacity(agents.len());
    for agent in agents {
        let memory_entry_count = store.active_entry_count(&agent.id).unwrap_or(0);
        rows.push(json!({
            "id": agent.id,
            "name": agent.name,
            "description": agent.description,
            "default_model": agent.default_model,
            "is_built_in": agent.is_built_in,
            "memory_entry_count": memory_entry_count,
            "created_at": agent.created_at,
            "updated_at": agent.updated_at,
        }));
    }
    Json(json!({ "agents": rows })).into_response()
}

// ── POST /memory/ingest ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    turns: Vec<IngestTurn>,
}

#[derive(Debug, Deserialize)]
struct IngestTurn {
    user: Option<String>,
    assistant: Option<String>,
}

async fn ingest(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                return error_json(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "payload_too_large",
                    "request body exceeds 1 MiB",
                );
            }
            return error_json(StatusCode::BAD_REQUEST, "bad_request", &rejection.to_string());
        }
    };

    if request.agent_id.trim().is_empty()
        || request.conversation_id.trim().is_empty()
        || request.turns.is_empty()
    {
        return error_json(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "agent_id, conversation_id, and turns are required",
        );
    }

    let mut turns = Vec::with_capacity(request.turns.len());
    for turn in &request.turns {
        let user = match &turn.user {
            Some(user) if !user.trim().is_empty() => user.clone(),
            _ => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    "invalid_turn",
                    "each turn requires a user message",
                )
            }
        };
        turns.push((user, turn.assistant.clone()));
    }

    match state
        .service
        .ingest_turns(&request.agent_id, &request.conversation_id, &turns)
        .await
    {
        Ok(count) => Json(json!({ "status": "ok", "turns_ingested": count })).into_response(),
        Err(e) => {
            warn!("[server] Ingest failed: {}", e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", &e.to_string())
        }
    }
}

// ── POST /chat/completions ─────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    // Memory injection: best-effort, never fails the chat.
    let agent_id = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(agent_id) = agent_id {
        match state.assembler.assemble(agent_id, None).await {
            Ok(block) if !block.is_empty() => inject_memory_block(&mut body, &block),
            Ok(_) => {}
            Err(e) => warn!("[server] Memory injection skipped for '{}': {}", agent_id, e),
        }
    }

    let Some(requested_model) = body["model"].as_str().map(|s| s.to_string()) else {
        return error_json(StatusCode::BAD_REQUEST, "bad_request", "missing 'model'");
    };

    let (local, remote) = state.service.service_snapshot();
    let (service, effective_model) =
        match model_router::resolve(&requested_model, &local, &remote) {
            model_router::Route::Service {
                service,
                effective_model,
            } => (service, effective_model),
            model_router::Route::None => {
                return error_json(
                    StatusCode::NOT_FOUND,
                    "model_not_found",
                    &format!("no service claims '{}'", requested_model),
                )
            }
        };

    let request = generate_request_from_body(&body, effective_model);
    match service.generate(&request).await {
        Ok(response) => Json(json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "model": requested_model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": response.text },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": response.input_tokens,
                "completion_tokens": response.output_tokens,
                "total_tokens": response.input_tokens + response.output_tokens,
            },
        }))
        .into_response(),
        Err(e) => {
            warn!("[server] Chat completion via {} failed: {}", service.name(), e);
            error_json(StatusCode::BAD_GATEWAY, "upstream_error", &e.to_string())
        }
    }
}

/// Prepend the memory block to the first system message (separated by one
/// blank line), or synthesize a system message when none exists.
fn inject_memory_block(body: &mut Value, block: &str) {
    let Some(messages) = body["messages"].as_array_mut() else {
        return;
    };
    for message in messages.iter_mut() {
        if message["role"].as_str() == Some("system") {
            let existing = message["content"].as_str().unwrap_or_default();
            let combined = if existing.is_empty() {
                block.to_string()
            } else {
                format!("{}\n\n{}", block, existing)
            };
            message["content"] = json!(combined);
            return;
        }
    }
    messages.insert(0, json!({ "role": "system", "content": block }));
}

/// Lift the OpenAI-style body into the core `GenerateRequest`. System
/// messages fold into the system field; other roles pass through in order.
fn generate_request_from_body(body: &Value, model: String) -> GenerateRequest {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();
    if let Some(list) = body["messages"].as_array() {
        for message in list {
            let role = message["role"].as_str().unwrap_or("user");
            let content = message["content"].as_str().unwrap_or_default();
            if role == "system" {
                system = Some(match system.take() {
                    Some(prior) => format!("{}\n\n{}", prior, content),
                    None => content.to_string(),
                });
            } else {
                messages.push((role.to_string(), content.to_string()));
            }
        }
    }
    GenerateRequest {
        model,
        system,
        messages,
        temperature: body["temperature"].as_f64().unwrap_or(0.7) as f32,
        max_tokens: body["max_tokens"].as_u64().unwrap_or(1024) as u32,
    }
}
