// Osaurus Memory Core — standalone server binary.
//
// Startup sequence: resolve home → load config → open store → rebuild
// vector indexes → register model services → recover orphaned signals →
// serve HTTP on 127.0.0.1.
//
// Exit codes: 0 clean shutdown, 1 configuration error, 2 storage error,
// 3 runtime error.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use osaurus_memory::config::MemoryConfig;
use osaurus_memory::context::ContextAssembler;
use osaurus_memory::embedding::Embedder;
use osaurus_memory::model::remote::{AnthropicService, OpenAiCompatService};
use osaurus_memory::model::ModelService;
use osaurus_memory::paths;
use osaurus_memory::search::SearchService;
use osaurus_memory::server::{self, AppState};
use osaurus_memory::service::MemoryService;
use osaurus_memory::store::MemoryStore;

const PORT_ENV: &str = "OSAURUS_PORT";
const DEFAULT_PORT: u16 = 1337;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[main] Failed to start runtime: {}", e);
            return ExitCode::from(3);
        }
    };
    runtime.block_on(run())
}

async fn run() -> ExitCode {
    // ── Home & configuration ─────────────────────────────────────────
    let home = paths::resolve_home();
    if let Err(e) = paths::ensure_layout(&home) {
        error!("[main] Cannot create {}: {}", home.display(), e);
        return ExitCode::from(1);
    }

    let config_path = paths::config_path(&home);
    let config = match MemoryConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("[main] {}", e);
            return ExitCode::from(1);
        }
    };
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("[main] Could not write default config: {}", e);
        }
    }

    // ── Store ────────────────────────────────────────────────────────
    let store = match MemoryStore::open(&paths::db_path(&home)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[main] Storage error: {}", e);
            return ExitCode::from(2);
        }
    };

    // ── Vector stack & retrieval ─────────────────────────────────────
    let embedder = Arc::new(Embedder::new(
        &config.embedding_backend,
        &config.embedding_base_url,
        &config.embedding_model,
    ));
    if embedder.is_enabled() && !embedder.healthy().await {
        warn!(
            "[main] Embedding backend '{}' not reachable at {} — lexical-only until it appears",
            config.embedding_backend, config.embedding_base_url
        );
    }
    let search = Arc::new(SearchService::new(
        store.clone(),
        embedder,
        config.temporal_decay_half_life_days,
    ));
    if let Err(e) = search.rebuild_from_store() {
        warn!("[main] Vector index rebuild failed: {}", e);
    }

    // ── Service & model catalog ──────────────────────────────────────
    let service = MemoryService::new(store.clone(), search.clone(), config.clone());

    let local: Arc<dyn ModelService> = Arc::new(OpenAiCompatService::new(
        "local",
        &config.core_model_base_url,
        None,
        Vec::new(),
    ));
    service.set_local_services(vec![local]);

    let mut remote: Vec<Arc<dyn ModelService>> = Vec::new();
    if let Some(anthropic) = AnthropicService::from_env(vec![config.core_model_name.clone()]) {
        remote.push(Arc::new(anthropic));
    } else if config.core_model_provider == "anthropic" {
        warn!("[main] ANTHROPIC_API_KEY not set — core model falls back to local services");
    }
    service.set_remote_services(remote);

    // ── Background recovery & retention ──────────────────────────────
    if config.enabled {
        match service.recover_orphaned_signals().await {
            Ok(0) => {}
            Ok(n) => info!("[main] Recovered {} orphaned conversations", n),
            Err(e) => warn!("[main] Orphan recovery failed: {}", e),
        }
    }
    service.spawn_retention_loop();

    // ── HTTP ─────────────────────────────────────────────────────────
    let assembler = Arc::new(ContextAssembler::new(store, search, config));
    let port = std::env::var(PORT_ENV)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    let state = AppState { service, assembler };
    if let Err(e) = server::serve(state, port).await {
        error!("[main] {}", e);
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}
