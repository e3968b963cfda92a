// Model routing: a pure function over a snapshot of registered services.
// Local services win over remote ones when both claim an identifier.
// The router never performs I/O — callers take the snapshot on their own
// task and pass it in.

use std::sync::Arc;

use super::ModelService;

pub enum Route {
    Service {
        service: Arc<dyn ModelService>,
        effective_model: String,
    },
    None,
}

/// Resolve `requested_model` against local services first, then remote.
pub fn resolve(
    requested_model: &str,
    local_services: &[Arc<dyn ModelService>],
    remote_services: &[Arc<dyn ModelService>],
) -> Route {
    for service in local_services.iter().chain(remote_services.iter()) {
        if let Some(effective_model) = service.claims(requested_model) {
            return Route::Service {
                service: service.clone(),
                effective_model,
            };
        }
    }
    Route::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::MemoryResult;
    use crate::model::{GenerateRequest, GenerateResponse};
    use async_trait::async_trait;

    struct StubService {
        name: String,
        models: Vec<String>,
    }

    #[async_trait]
    impl ModelService for StubService {
        fn name(&self) -> &str {
            &self.name
        }
        fn claims(&self, model: &str) -> Option<String> {
            self.models
                .iter()
                .find(|m| m.as_str() == model)
                .map(|m| m.clone())
        }
        async fn generate(&self, _request: &GenerateRequest) -> MemoryResult<GenerateResponse> {
            Ok(GenerateResponse::default())
        }
    }

    fn stub(name: &str, models: &[&str]) -> Arc<dyn ModelService> {
        Arc::new(StubService {
            name: name.into(),
            models: models.iter().map(|m| m.to_string()).collect(),
        })
    }

    #[test]
    fn resolves_to_claiming_service() {
        let local = [stub("local", &["llama-3.2"])];
        let remote = [stub("anthropic", &["claude-haiku-4-5"])];

        match resolve("claude-haiku-4-5", &local, &remote) {
            Route::Service {
                service,
                effective_model,
            } => {
                assert_eq!(service.name(), "anthropic");
                assert_eq!(effective_model, "claude-haiku-4-5");
            }
            Route::None => panic!("expected a route"),
        }
    }

    #[test]
    fn local_wins_over_remote() {
        let local = [stub("local", &["shared-model"])];
        let remote = [stub("remote", &["shared-model"])];
        match resolve("shared-model", &local, &remote) {
            Route::Service { service, .. } => assert_eq!(service.name(), "local"),
            Route::None => panic!("expected a route"),
        }
    }

    #[test]
    fn unclaimed_model_is_none() {
        let local = [stub("local", &["llama-3.2"])];
        assert!(matches!(resolve("gpt-nonexistent", &local, &[]), Route::None));
        assert!(matches!(resolve("anything", &[], &[]), Route::None));
    }
}
