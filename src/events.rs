// ── Memory Events Sink ─────────────────────────────────────────────────────
// Narrow trait the host app calls to signal external changes without
// holding references into its UI layer. Fire-and-forget: each notification
// detaches a task over the store, never blocks the caller, and never calls
// back into the host. Must be invoked from within the tokio runtime.

use log::{debug, info, warn};

use crate::service::MemoryService;

pub trait MemoryEvents: Send + Sync {
    /// A new agent was configured in the host.
    fn on_agent_created(&self, agent_id: &str);

    /// An agent was removed from the host's configuration. Its memories
    /// are retained (namespaced data is never destroyed by a UI action).
    fn on_agent_deleted(&self, agent_id: &str);

    /// The local or remote model catalog changed. Service snapshots are
    /// taken per call, so there is nothing to rebuild eagerly.
    fn on_models_changed(&self);
}

impl MemoryEvents for MemoryService {
    fn on_agent_created(&self, agent_id: &str) {
        let store = self.store().clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            match store.ensure_agent(&agent_id, &agent_id, "", None).await {
                Ok(_) => info!("[memory] Agent '{}' registered", agent_id),
                Err(e) => warn!("[memory] Failed to register agent '{}': {}", agent_id, e),
            }
        });
    }

    fn on_agent_deleted(&self, agent_id: &str) {
        let store = self.store().clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            match store.remove_agent(&agent_id).await {
                Ok(()) => info!("[memory] Agent '{}' removed (memories retained)", agent_id),
                Err(e) => warn!("[memory] Failed to remove agent '{}': {}", agent_id, e),
            }
        });
    }

    fn on_models_changed(&self) {
        let (local, remote) = self.service_snapshot();
        debug!(
            "[memory] Model catalog changed ({} local, {} remote services)",
            local.len(),
            remote.len()
        );
    }
}
