// User profile (single global row), profile events, and user edits.
// Profile regeneration is the one place version monotonicity matters:
// the version bump, the contribution flips, and the regeneration event all
// commit together, guarded by a WHERE on the expected current version.

use rusqlite::{params, OptionalExtension};

use super::{now_iso, MemoryStore};
use crate::atoms::error::{StorageError, StorageResult};
use crate::atoms::types::{EntryStatus, ProfileEvent, ProfileEventType, UserEdit, UserProfile};

const PROFILE_EVENT_COLUMNS: &str = "id, agent_id, conversation_id, event_type, content, model, \
     status, incorporated_in, created_at";

impl ProfileEvent {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let event_type: String = row.get(3)?;
        let status: String = row.get(6)?;
        Ok(ProfileEvent {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            conversation_id: row.get(2)?,
            event_type: ProfileEventType::parse(&event_type)
                .unwrap_or(ProfileEventType::Contribution),
            content: row.get(4)?,
            model: row.get(5)?,
            status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Active),
            incorporated_in: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

impl MemoryStore {
    pub fn get_profile(&self) -> StorageResult<Option<UserProfile>> {
        let conn = self.conn.lock();
        let result = conn.prepare_cached(
            "SELECT content, token_count, version, model, generated_at FROM user_profile WHERE id = 1",
        )
        .map_err(StorageError::Prepare)?
        .query_row([], |row| {
            Ok(UserProfile {
                content: row.get(0)?,
                token_count: row.get(1)?,
                version: row.get(2)?,
                model: row.get(3)?,
                generated_at: row.get(4)?,
            })
        })
        .optional()
        .map_err(StorageError::from);
        result
    }

    /// Replace the profile with `version = current + 1`, flip all active
    /// unincorporated contributions to the new version, and write the
    /// regeneration event — one transaction. A concurrent regeneration
    /// that already bumped the version makes this a `Conflict`.
    pub async fn replace_profile(
        &self,
        content: &str,
        token_count: i64,
        model: &str,
    ) -> StorageResult<i64> {
        self.with_conn(|conn| {
            let now = now_iso();
            let tx = conn.transaction().map_err(StorageError::from)?;

            let current: Option<i64> = tx
                .prepare_cached("SELECT version FROM user_profile WHERE id = 1")
                .map_err(StorageError::Prepare)?
                .query_row([], |r| r.get(0))
                .optional()?;

            let new_version = match current {
                None => {
                    tx.prepare_cached(
                        "INSERT INTO user_profile (id, content, token_count, version, model, generated_at) \
                         VALUES (1, ?1, ?2, 1, ?3, ?4)",
                    )
                    .map_err(StorageError::Prepare)?
                    .execute(params![content, token_count, model, now])?;
                    1
                }
                Some(version) => {
                    let changed = tx
                        .prepare_cached(
                            "UPDATE user_profile \
                             SET content = ?1, token_count = ?2, version = version + 1, \
                                 model = ?3, generated_at = ?4 \
                             WHERE id = 1 AND version = ?5",
                        )
                        .map_err(StorageError::Prepare)?
                        .execute(params![content, token_count, model, now, version])?;
                    if changed == 0 {
                        return Err(StorageError::Conflict(
                            "profile version moved under us".into(),
                        ));
                    }
                    version + 1
                }
            };

            tx.prepare_cached(
                "UPDATE profile_events SET incorporated_in = ?1 \
                 WHERE event_type = 'contribution' AND status = 'active' \
                   AND incorporated_in IS NULL",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![new_version])?;

            tx.prepare_cached(&format!(
                "INSERT INTO profile_events ({}) VALUES (?1, ?2, NULL, 'regeneration', ?3, ?4, 'active', ?5, ?6)",
                PROFILE_EVENT_COLUMNS
            ))
            .map_err(StorageError::Prepare)?
            .execute(params![
                uuid::Uuid::new_v4().to_string(),
                "",
                format!("profile v{}", new_version),
                model,
                new_version,
                now,
            ])?;

            tx.commit().map_err(StorageError::from)?;
            Ok(new_version)
        })
        .await
    }

    pub async fn insert_profile_contribution(
        &self,
        agent_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        model: &str,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(&format!(
                "INSERT INTO profile_events ({}) VALUES (?1, ?2, ?3, 'contribution', ?4, ?5, 'active', NULL, ?6)",
                PROFILE_EVENT_COLUMNS
            ))
            .map_err(StorageError::Prepare)?
            .execute(params![
                uuid::Uuid::new_v4().to_string(),
                agent_id,
                conversation_id,
                content,
                model,
                now_iso(),
            ])?;
            Ok(())
        })
        .await
    }

    /// Contributions not yet absorbed into any profile version, oldest first.
    pub fn unincorporated_contributions(&self) -> StorageResult<Vec<ProfileEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM profile_events \
                 WHERE event_type = 'contribution' AND status = 'active' \
                   AND incorporated_in IS NULL \
                 ORDER BY created_at, id",
                PROFILE_EVENT_COLUMNS
            ))
            .map_err(StorageError::Prepare)?;
        let events = stmt
            .query_map([], ProfileEvent::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    pub fn unincorporated_contribution_count(&self) -> StorageResult<i64> {
        let conn = self.conn.lock();
        let result = conn.prepare_cached(
            "SELECT COUNT(*) FROM profile_events \
             WHERE event_type = 'contribution' AND status = 'active' \
               AND incorporated_in IS NULL",
        )
        .map_err(StorageError::Prepare)?
        .query_row([], |r| r.get(0))
        .map_err(StorageError::from);
        result
    }

    // ── User edits ─────────────────────────────────────────────────────

    pub async fn add_user_edit(&self, content: &str) -> StorageResult<UserEdit> {
        let edit = UserEdit {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            created_at: now_iso(),
            deleted_at: None,
        };
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO user_edits (id, content, created_at, deleted_at) VALUES (?1, ?2, ?3, NULL)",
            )
            .map_err(StorageError::Prepare)?
            .execute(params![edit.id, edit.content, edit.created_at])?;
            Ok(())
        })
        .await?;
        Ok(edit)
    }

    /// Logical delete — the edit stops appearing in context but stays on disk.
    pub async fn delete_user_edit(&self, id: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE user_edits SET deleted_at = ?2 WHERE id = ?1")
                .map_err(StorageError::Prepare)?
                .execute(params![id, now_iso()])?;
            Ok(())
        })
        .await
    }

    pub fn active_user_edits(&self) -> StorageResult<Vec<UserEdit>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, content, created_at, deleted_at FROM user_edits \
                 WHERE deleted_at IS NULL ORDER BY created_at, id",
            )
            .map_err(StorageError::Prepare)?;
        let edits = stmt
            .query_map([], |row| {
                Ok(UserEdit {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    deleted_at: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(edits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn profile_version_strictly_increases() {
        let store = store();
        assert!(store.get_profile().unwrap().is_none());

        let v1 = store.replace_profile("first profile", 3, "m").await.unwrap();
        assert_eq!(v1, 1);
        let v2 = store.replace_profile("second profile", 3, "m").await.unwrap();
        assert_eq!(v2, 2);

        let profile = store.get_profile().unwrap().unwrap();
        assert_eq!(profile.version, 2);
        assert_eq!(profile.content, "second profile");
    }

    #[tokio::test]
    async fn regeneration_absorbs_contributions_atomically() {
        let store = store();
        store
            .insert_profile_contribution("a", Some("conv-1"), "Works at Acme", "m")
            .await
            .unwrap();
        store
            .insert_profile_contribution("a", None, "Prefers terse answers", "m")
            .await
            .unwrap();
        assert_eq!(store.unincorporated_contribution_count().unwrap(), 2);

        let version = store.replace_profile("profile body", 3, "m").await.unwrap();
        assert_eq!(store.unincorporated_contribution_count().unwrap(), 0);

        // New contributions start unincorporated again.
        store
            .insert_profile_contribution("a", None, "Lives in Irvine", "m")
            .await
            .unwrap();
        let open = store.unincorporated_contributions().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].content, "Lives in Irvine");
        assert!(version >= 1);
    }

    #[tokio::test]
    async fn deleted_edits_leave_context() {
        let store = store();
        let kept = store.add_user_edit("Always answer in French").await.unwrap();
        let dropped = store.add_user_edit("Temporary note").await.unwrap();
        store.delete_user_edit(&dropped.id).await.unwrap();

        let active = store.active_user_edits().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, kept.id);
    }
}
