// Knowledge graph: entities and time-versioned relationships.
// Entity resolution is deterministic — ids derive from (lower(name), type) —
// so repeated extraction of the same entity always lands on the same row.
// Relationships keep history: a conflicting edge closes the prior one by
// setting valid_until instead of overwriting it.

use rusqlite::{params, OptionalExtension};

use super::{now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::{entity_id, relationship_id, EntityType, GraphEntity, GraphRelationship};

const ENTITY_COLUMNS: &str = "id, name, entity_type, metadata, model, created_at, updated_at";
const RELATIONSHIP_COLUMNS: &str =
    "id, source_id, target_id, relation, confidence, model, valid_from, valid_until, created_at";

impl GraphEntity {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let entity_type: String = row.get(2)?;
        Ok(GraphEntity {
            id: row.get(0)?,
            name: row.get(1)?,
            entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Unknown),
            metadata: row.get(3)?,
            model: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

impl GraphRelationship {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(GraphRelationship {
            id: row.get(0)?,
            source_id: row.get(1)?,
            target_id: row.get(2)?,
            relation: row.get(3)?,
            confidence: row.get(4)?,
            model: row.get(5)?,
            valid_from: row.get(6)?,
            valid_until: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

impl MemoryStore {
    /// Resolve an entity by case-folded name and type.
    ///   • exact (name, type) match → that row;
    ///   • requested type is `unknown` → any existing same-name row;
    ///   • otherwise insert a new row with the deterministic id. A same-name
    ///     `unknown` placeholder is absorbed into the newly typed entity.
    pub async fn resolve_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        model: &str,
    ) -> StorageResult<GraphEntity> {
        self.with_conn(|conn| {
            let now = now_iso();

            let exact: Option<GraphEntity> = conn
                .prepare_cached(&format!(
                    "SELECT {} FROM graph_entities \
                     WHERE name = ?1 COLLATE NOCASE AND entity_type = ?2",
                    ENTITY_COLUMNS
                ))
                .map_err(StorageError::Prepare)?
                .query_row(params![name, entity_type.as_str()], GraphEntity::from_row)
                .optional()?;
            if let Some(entity) = exact {
                return Ok(entity);
            }

            if entity_type == EntityType::Unknown {
                let by_name: Option<GraphEntity> = conn
                    .prepare_cached(&format!(
                        "SELECT {} FROM graph_entities \
                         WHERE name = ?1 COLLATE NOCASE ORDER BY created_at LIMIT 1",
                        ENTITY_COLUMNS
                    ))
                    .map_err(StorageError::Prepare)?
                    .query_row(params![name], GraphEntity::from_row)
                    .optional()?;
                if let Some(entity) = by_name {
                    return Ok(entity);
                }
            } else {
                // Absorb an untyped placeholder with the same name, keeping
                // its edges by rewriting them onto the typed id.
                let placeholder: Option<String> = conn
                    .prepare_cached(
                        "SELECT id FROM graph_entities \
                         WHERE name = ?1 COLLATE NOCASE AND entity_type = 'unknown'",
                    )
                    .map_err(StorageError::Prepare)?
                    .query_row(params![name], |r| r.get(0))
                    .optional()?;
                if let Some(old_id) = placeholder {
                    let entity = GraphEntity {
                        id: entity_id(name, entity_type),
                        name: name.to_string(),
                        entity_type,
                        metadata: None,
                        model: model.to_string(),
                        created_at: now.clone(),
                        updated_at: now.clone(),
                    };
                    let tx = conn.transaction().map_err(StorageError::from)?;
                    tx.prepare_cached(&format!(
                        "INSERT OR IGNORE INTO graph_entities ({}) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5)",
                        ENTITY_COLUMNS
                    ))
                    .map_err(StorageError::Prepare)?
                    .execute(params![entity.id, entity.name, entity.entity_type.as_str(), entity.model, now])?;
                    tx.prepare_cached(
                        "UPDATE graph_relationships SET source_id = ?2 WHERE source_id = ?1",
                    )
                    .map_err(StorageError::Prepare)?
                    .execute(params![old_id, entity.id])?;
                    tx.prepare_cached(
                        "UPDATE graph_relationships SET target_id = ?2 WHERE target_id = ?1",
                    )
                    .map_err(StorageError::Prepare)?
                    .execute(params![old_id, entity.id])?;
                    tx.prepare_cached("DELETE FROM graph_entities WHERE id = ?1")
                        .map_err(StorageError::Prepare)?
                        .execute(params![old_id])?;
                    tx.commit().map_err(StorageError::from)?;
                    return Ok(entity);
                }
            }

            let entity = GraphEntity {
                id: entity_id(name, entity_type),
                name: name.to_string(),
                entity_type,
                metadata: None,
                model: model.to_string(),
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            conn.prepare_cached(&format!(
                "INSERT INTO graph_entities ({}) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5)",
                ENTITY_COLUMNS
            ))
            .map_err(StorageError::Prepare)?
            .execute(params![
                entity.id,
                entity.name,
                entity.entity_type.as_str(),
                entity.model,
                now
            ])?;
            Ok(entity)
        })
        .await
    }

    /// Insert an edge with the deterministic id. If a different target is
    /// currently active for (source, relation), close it first. Re-inserting
    /// the exact same (source, relation, target) is a no-op.
    pub async fn insert_relationship(
        &self,
        source_id: &str,
        target_id: &str,
        relation: &str,
        confidence: f64,
        model: &str,
    ) -> StorageResult<GraphRelationship> {
        self.with_conn(|conn| {
            let now = now_iso();
            let id = relationship_id(source_id, relation, target_id);
            let tx = conn.transaction().map_err(StorageError::from)?;

            tx.prepare_cached(
                "UPDATE graph_relationships SET valid_until = ?4 \
                 WHERE source_id = ?1 AND relation = ?2 AND target_id != ?3 \
                   AND valid_until IS NULL",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![source_id, relation, target_id, now])?;

            tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO graph_relationships ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?7)",
                RELATIONSHIP_COLUMNS
            ))
            .map_err(StorageError::Prepare)?
            .execute(params![id, source_id, target_id, relation, confidence.clamp(0.0, 1.0), model, now])?;

            // A re-asserted edge that was previously closed becomes active again.
            tx.prepare_cached(
                "UPDATE graph_relationships SET valid_until = NULL, confidence = ?2 WHERE id = ?1",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![id, confidence.clamp(0.0, 1.0)])?;

            let row = tx
                .prepare_cached(&format!(
                    "SELECT {} FROM graph_relationships WHERE id = ?1",
                    RELATIONSHIP_COLUMNS
                ))
                .map_err(StorageError::Prepare)?
                .query_row(params![id], GraphRelationship::from_row)?;

            tx.commit().map_err(StorageError::from)?;
            Ok(row)
        })
        .await
    }

    /// Most recently created active edges with their endpoint names,
    /// newest first. Feeds the "Key Relationships" context section.
    pub fn recent_active_relationships(
        &self,
        limit: usize,
    ) -> StorageResult<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT s.name, r.relation, t.name \
                 FROM graph_relationships r \
                 JOIN graph_entities s ON s.id = r.source_id \
                 JOIN graph_entities t ON t.id = r.target_id \
                 WHERE r.valid_until IS NULL \
                 ORDER BY r.created_at DESC LIMIT ?1",
            )
            .map_err(StorageError::Prepare)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All edges for a source, active and closed. Test/debug surface.
    pub fn relationships_from(&self, source_id: &str) -> StorageResult<Vec<GraphRelationship>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM graph_relationships WHERE source_id = ?1 ORDER BY created_at",
                RELATIONSHIP_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let rows = stmt
            .query_map(params![source_id], GraphRelationship::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}
