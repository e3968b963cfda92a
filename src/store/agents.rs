// Configured agent rows. The built-in 'default' agent is seeded by the v1
// migration; host-created agents arrive through the MemoryEvents sink.

use rusqlite::{params, OptionalExtension};

use super::{now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::Agent;

impl Agent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let is_built_in: i64 = row.get(4)?;
        Ok(Agent {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            default_model: row.get(3)?,
            is_built_in: is_built_in != 0,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

const AGENT_COLUMNS: &str =
    "id, name, description, default_model, is_built_in, created_at, updated_at";

impl MemoryStore {
    /// Insert the agent if missing; refresh name/description if present.
    pub async fn ensure_agent(
        &self,
        id: &str,
        name: &str,
        description: &str,
        default_model: Option<&str>,
    ) -> StorageResult<Agent> {
        self.with_conn(|conn| {
            let now = now_iso();
            conn.prepare_cached(&format!(
                "INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5) \
                 ON CONFLICT(id) DO UPDATE SET name = ?2, description = ?3, \
                     default_model = ?4, updated_at = ?5",
                AGENT_COLUMNS
            ))
            .map_err(StorageError::Prepare)?
            .execute(params![id, name, description, default_model, now])?;

            conn.prepare_cached(&format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS))
                .map_err(StorageError::Prepare)?
                .query_row(params![id], Agent::from_row)
                .map_err(StorageError::from)
        })
        .await
    }

    pub fn get_agent(&self, id: &str) -> StorageResult<Option<Agent>> {
        let conn = self.conn.lock();
        let result = conn.prepare_cached(&format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS))
            .map_err(StorageError::Prepare)?
            .query_row(params![id], Agent::from_row)
            .optional()
            .map_err(StorageError::from);
        result
    }

    /// All configured agents, built-ins first, then by name.
    pub fn list_agents(&self) -> StorageResult<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM agents ORDER BY is_built_in DESC, name, id",
                AGENT_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let agents = stmt
            .query_map([], Agent::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(agents)
    }

    /// Remove a host-created agent row. Built-ins stay.
    pub async fn remove_agent(&self, id: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM agents WHERE id = ?1 AND is_built_in = 0")
                .map_err(StorageError::Prepare)?
                .execute(params![id])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    #[test]
    fn default_agent_exists() {
        let store = store();
        let agents = store.list_agents().unwrap();
        assert!(agents.iter().any(|a| a.id == "default" && a.is_built_in));
    }

    #[tokio::test]
    async fn ensure_agent_upserts() {
        let store = store();
        store
            .ensure_agent("research", "Research", "Deep-dive persona", None)
            .await
            .unwrap();
        let updated = store
            .ensure_agent("research", "Research v2", "Deep-dive persona", Some("gpt-osaurus"))
            .await
            .unwrap();
        assert_eq!(updated.name, "Research v2");
        assert_eq!(updated.default_model.as_deref(), Some("gpt-osaurus"));
        assert_eq!(store.list_agents().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn built_in_agent_cannot_be_removed() {
        let store = store();
        store.remove_agent("default").await.unwrap();
        assert!(store.get_agent("default").unwrap().is_some());

        store.ensure_agent("temp", "Temp", "", None).await.unwrap();
        store.remove_agent("temp").await.unwrap();
        assert!(store.get_agent("temp").unwrap().is_none());
    }
}
