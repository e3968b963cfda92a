// End-to-end scenarios for the memory core: the full write path (ingest →
// extraction → verification → graph), debounced summaries under a paused
// clock, session-switch flushing, context assembly, and the HTTP surface.
//
// All tests run against in-memory stores and a scripted model service that
// dispatches on the system prompt, so no network or real model is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use osaurus_memory::atoms::error::MemoryResult;
use osaurus_memory::atoms::types::{EntryStatus, EntryType, MemoryEntry};
use osaurus_memory::config::MemoryConfig;
use osaurus_memory::context::ContextAssembler;
use osaurus_memory::embedding::Embedder;
use osaurus_memory::model::{GenerateRequest, GenerateResponse, ModelService};
use osaurus_memory::search::SearchService;
use osaurus_memory::service::MemoryService;
use osaurus_memory::store::MemoryStore;

// ── Scripted model ─────────────────────────────────────────────────────────

/// Dispatches on the system prompt: extraction calls get `extraction_json`,
/// summary calls get a fixed sentence, profile calls a fixed body.
struct ScriptedModel {
    extraction_json: Mutex<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(extraction_json: &str) -> Arc<Self> {
        Arc::new(ScriptedModel {
            extraction_json: Mutex::new(extraction_json.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_extraction(&self, json: &str) {
        *self.extraction_json.lock() = json.to_string();
    }

    fn calls_of(&self, kind: &str) -> usize {
        self.calls.lock().iter().filter(|c| c == &kind).count()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }
    fn claims(&self, model: &str) -> Option<String> {
        Some(model.to_string())
    }
    async fn generate(&self, request: &GenerateRequest) -> MemoryResult<GenerateResponse> {
        let system = request.system.as_deref().unwrap_or_default();
        let (kind, text) = if system.contains("summarize") {
            ("summary", "They discussed the user's plans.".to_string())
        } else if system.contains("profile") {
            ("profile", "A Rust developer living in Irvine.".to_string())
        } else {
            ("extraction", self.extraction_json.lock().clone())
        };
        self.calls.lock().push(kind.to_string());
        Ok(GenerateResponse {
            text,
            input_tokens: 20,
            output_tokens: 10,
        })
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    service: Arc<MemoryService>,
    store: Arc<MemoryStore>,
    model: Arc<ScriptedModel>,
}

fn harness_with(mut config: MemoryConfig, extraction_json: &str) -> Harness {
    config.embedding_backend = "none".into();
    config.validate();
    let store = Arc::new(MemoryStore::open_in_memory().unwrap());
    let search = Arc::new(SearchService::new(
        store.clone(),
        Arc::new(Embedder::disabled()),
        config.temporal_decay_half_life_days,
    ));
    let service = MemoryService::new(store.clone(), search, config);
    let model = ScriptedModel::new(extraction_json);
    let as_service: Arc<dyn ModelService> = model.clone();
    service.set_remote_services(vec![as_service]);
    Harness {
        service,
        store,
        model,
    }
}

fn harness(extraction_json: &str) -> Harness {
    harness_with(MemoryConfig::default(), extraction_json)
}

/// Let spawned tasks drain without advancing the paused clock.
async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

const EMPTY_EXTRACTION: &str = "{}";

// ── Scenario: contradiction supersession ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn contradiction_supersession_end_to_end() {
    let h = harness(
        r#"{"memories": [{"type": "fact", "content": "Terence lives in Los Angeles",
            "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I live in Los Angeles", None, "a", "c1", None)
        .await
        .unwrap();

    h.model.set_extraction(
        r#"{"memories": [{"type": "fact", "content": "Terence lives in Irvine",
            "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I moved to Irvine", None, "a", "c1", None)
        .await
        .unwrap();

    let active = h.store.load_active_entries("a", None).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "Terence lives in Irvine");
    assert_eq!(active[0].status, EntryStatus::Active);

    // The superseded entry points at its replacement and is closed.
    let all = h
        .store
        .entries_as_of("a", "2000-01-01T00:00:00+00:00")
        .unwrap();
    assert!(all.is_empty(), "nothing was valid before the first turn");

    let log = h.store.recent_processing_log(50).unwrap();
    assert!(log
        .iter()
        .any(|row| row.task_type == "verification" && row.status == "supersede"));
}

// ── Scenario: near-duplicate skip ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn near_duplicate_extraction_is_skipped() {
    let h = harness(
        r#"{"memories": [{"type": "fact", "content": "User likes Swift", "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I like Swift", None, "a", "c1", None)
        .await
        .unwrap();

    h.model.set_extraction(
        r#"{"memories": [{"type": "fact", "content": "user likes swift", "confidence": 0.8}]}"#,
    );
    h.service
        .record_conversation_turn("Did I mention I like Swift?", None, "a", "c1", None)
        .await
        .unwrap();

    let active = h.store.load_active_entries("a", None).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "User likes Swift");

    let log = h.store.recent_processing_log(50).unwrap();
    assert!(log
        .iter()
        .any(|row| row.task_type == "verification" && row.status == "skip_duplicate"));
}

// ── Scenario: cross-type non-contradiction ─────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cross_type_entries_coexist() {
    let h = harness(
        r#"{"memories": [{"type": "preference", "content": "Terence lives in LA",
            "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I love LA", None, "a", "c1", None)
        .await
        .unwrap();

    h.model.set_extraction(
        r#"{"memories": [{"type": "fact", "content": "Terence lives in Irvine",
            "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("My address is in Irvine", None, "a", "c1", None)
        .await
        .unwrap();

    let active = h.store.load_active_entries("a", None).unwrap();
    assert_eq!(active.len(), 2, "preference and fact both stay active");
}

// ── Scenario: debounced summary ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn debounce_fires_once_after_idle() {
    let h = harness(EMPTY_EXTRACTION);
    let debounce = h.service.config().summary_debounce_seconds;

    h.service
        .record_conversation_turn("turn one", None, "a", "c1", None)
        .await
        .unwrap();
    drain().await;

    tokio::time::advance(Duration::from_secs(debounce / 2)).await;
    drain().await;

    h.service
        .record_conversation_turn("turn two", None, "a", "c1", None)
        .await
        .unwrap();
    drain().await;

    // Just before the (re-armed) debounce elapses: no summary yet.
    tokio::time::advance(Duration::from_secs(debounce - 1)).await;
    drain().await;
    assert!(h.store.summaries_for_agent("a", 0, None).unwrap().is_empty());
    assert_eq!(h.store.pending_signals_for("c1").unwrap().len(), 2);

    // Cross the deadline: exactly one summary, all signals processed.
    tokio::time::advance(Duration::from_secs(2)).await;
    drain().await;
    let summaries = h.store.summaries_for_agent("a", 0, None).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].conversation_id, "c1");
    assert!(h.store.pending_signals_for("c1").unwrap().is_empty());
    assert_eq!(h.model.calls_of("summary"), 1);
}

// ── Scenario: session switch flush ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn session_switch_flushes_previous_conversation() {
    let h = harness(EMPTY_EXTRACTION);

    h.service
        .record_conversation_turn("first conversation", None, "x", "c1", None)
        .await
        .unwrap();
    drain().await;

    // Switching conversations schedules C1's summary immediately.
    h.service
        .record_conversation_turn("second conversation", None, "x", "c2", None)
        .await
        .unwrap();
    drain().await;

    let summaries = h.store.summaries_for_agent("x", 0, None).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].conversation_id, "c1");
    assert!(h.store.pending_signals_for("c1").unwrap().is_empty());

    // C2's debounce is armed but has not fired.
    assert_eq!(h.store.pending_signals_for("c2").unwrap().len(), 1);

    let debounce = h.service.config().summary_debounce_seconds;
    tokio::time::advance(Duration::from_secs(debounce + 1)).await;
    drain().await;
    assert!(h.store.pending_signals_for("c2").unwrap().is_empty());
}

// ── Profile regeneration threshold ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn profile_regenerates_at_threshold() {
    let mut config = MemoryConfig::default();
    config.profile_regenerate_threshold = 2;
    let h = harness_with(
        config,
        r#"{"profile_facts": ["Works on compilers"]}"#,
    );

    // First contribution: below threshold, no regeneration.
    h.service
        .record_conversation_turn("I work on compilers", None, "a", "c1", None)
        .await
        .unwrap();
    drain().await;
    assert!(h.store.get_profile().unwrap().is_none());

    // Second (distinct) contribution reaches the threshold.
    h.model
        .set_extraction(r#"{"profile_facts": ["Lives in Irvine"]}"#);
    h.service
        .record_conversation_turn("I live in Irvine", None, "a", "c1", None)
        .await
        .unwrap();
    drain().await;

    let profile = h.store.get_profile().unwrap().unwrap();
    assert_eq!(profile.version, 1);
    assert_eq!(profile.content, "A Rust developer living in Irvine.");
    assert_eq!(h.store.unincorporated_contribution_count().unwrap(), 0);
    assert_eq!(h.model.calls_of("profile"), 1);
}

// ── Knowledge graph through extraction ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn graph_updates_close_conflicting_edges() {
    let h = harness(
        r#"{"entities": [{"name": "Terence", "type": "person"},
                         {"name": "Los Angeles", "type": "place"}],
            "relationships": [{"source": "Terence", "relation": "lives_in",
                               "target": "Los Angeles", "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I live in LA", None, "a", "c1", None)
        .await
        .unwrap();

    h.model.set_extraction(
        r#"{"entities": [{"name": "Terence", "type": "person"},
                         {"name": "Irvine", "type": "place"}],
            "relationships": [{"source": "Terence", "relation": "lives_in",
                               "target": "Irvine", "confidence": 0.9}]}"#,
    );
    h.service
        .record_conversation_turn("I moved to Irvine", None, "a", "c1", None)
        .await
        .unwrap();

    let rows = h.store.recent_active_relationships(10).unwrap();
    assert_eq!(rows.len(), 1, "only one lives_in edge stays active");
    assert_eq!(rows[0].2, "Irvine");
}

// ── Context assembly ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn assembled_context_is_ordered_and_budgeted() {
    let mut config = MemoryConfig::default();
    config.embedding_backend = "none".into();
    config.validate();
    config.working_memory_budget_tokens = 50; // 200 chars

    let store = Arc::new(MemoryStore::open_in_memory().unwrap());
    let search = Arc::new(SearchService::new(
        store.clone(),
        Arc::new(Embedder::disabled()),
        0.0,
    ));
    let assembler = ContextAssembler::new(store.clone(), search, config);

    store.add_user_edit("Prefer metric units").await.unwrap();
    store
        .replace_profile("An engineer in Irvine.", 6, "m")
        .await
        .unwrap();
    for i in 0..10 {
        let mut entry = MemoryEntry::new(
            "a",
            EntryType::Fact,
            &format!("a moderately sized fact about topic {:02}", i),
            0.9,
            "m",
            None,
            vec![],
        );
        entry.last_accessed = format!("2026-07-{:02}T00:00:00+00:00", i + 1);
        store.insert_entry(&entry).await.unwrap();
    }

    let block = assembler.assemble("a", None).await.unwrap();

    // Priority order holds and the budget trimmed the tail.
    let overrides = block.find("# User Overrides").unwrap();
    let profile = block.find("# User Profile").unwrap();
    let working = block.find("# Working Memory").unwrap();
    assert!(overrides < profile && profile < working);

    let emitted: Vec<&str> = block
        .lines()
        .filter(|l| l.starts_with("- [fact]"))
        .collect();
    assert!(!emitted.is_empty() && emitted.len() < 10);
    // Newest-last-accessed first.
    assert!(emitted[0].contains("topic 09"));
}

// ── HTTP surface end to end ────────────────────────────────────────────────

mod http {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use osaurus_memory::server::{router, AppState};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app_state(h: &Harness) -> AppState {
        let mut config = h.service.config().clone();
        config.validate();
        let assembler = Arc::new(ContextAssembler::new(
            h.store.clone(),
            h.service.search().clone(),
            config,
        ));
        AppState {
            service: h.service.clone(),
            assembler,
        }
    }

    async fn post(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_acknowledges_then_extracts() {
        let h = harness(
            r#"{"memories": [{"type": "fact", "content": "User ships on Fridays",
                "confidence": 0.9}]}"#,
        );
        let app = router(app_state(&h));

        let (status, body) = post(
            app,
            "/memory/ingest",
            json!({
                "agent_id": "a",
                "conversation_id": "c1",
                "turns": [
                    {"user": "We ship on Fridays", "assistant": "Got it"},
                    {"user": "Remember that"}
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turns_ingested"], 2);

        // Signals are durable before the response; extraction is detached.
        assert_eq!(h.store.pending_signals_for("c1").unwrap().len(), 2);

        drain().await;
        let active = h.store.load_active_entries("a", None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].content, "User ships on Fridays");
        assert_eq!(h.model.calls_of("extraction"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn agents_reflect_ingested_memories() {
        let h = harness(
            r#"{"memories": [{"type": "fact", "content": "User ships on Fridays",
                "confidence": 0.9}]}"#,
        );
        h.store
            .ensure_agent("a", "Agent A", "test persona", None)
            .await
            .unwrap();
        h.service
            .record_conversation_turn("We ship on Fridays", None, "a", "c1", None)
            .await
            .unwrap();

        let app = router(app_state(&h));
        let request = Request::builder()
            .uri("/agents")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        let agents = body["agents"].as_array().unwrap();
        assert!(agents.iter().any(|a| a["id"] == "default"));
        let agent_a = agents.iter().find(|a| a["id"] == "a").unwrap();
        assert_eq!(agent_a["memory_entry_count"], 1);
    }
}
