//! Grant and group storage
//!
//! A grant is unique per `(node, principal)`; writing a second one replaces
//! the first. Deleting a group removes its members and every grant made to it.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row, ToSql};
use tracing::debug;

use super::models::{GroupMember, Permission, PermissionGroup, Principal, PrincipalKind};
use super::LearningDb;
use crate::error::{is_constraint_violation, sql_error, StorageError};

const GRANT_COLUMNS: &str = "id, content_node_id, principal_kind, principal_id, level, granted_by,
    expires_at, created_at, updated_at";

fn grant_from_row(row: &Row) -> rusqlite::Result<Permission> {
    let kind: PrincipalKind = row.get(2)?;
    Ok(Permission {
        id: row.get(0)?,
        content_node_id: row.get(1)?,
        principal: Principal::from_parts(kind, row.get(3)?),
        level: row.get(4)?,
        granted_by: row.get(5)?,
        expires_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn group_from_row(row: &Row) -> rusqlite::Result<PermissionGroup> {
    Ok(PermissionGroup {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        is_public: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn member_from_row(row: &Row) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        group_id: row.get(0)?,
        user_id: row.get(1)?,
        role: row.get(2)?,
        joined_at: row.get(3)?,
    })
}

/// Storage for explicit grants, groups and group membership
#[derive(Clone)]
pub struct PermissionStore {
    db: Arc<LearningDb>,
}

impl PermissionStore {
    pub fn new(db: Arc<LearningDb>) -> Self {
        Self { db }
    }

    fn query_grants(
        &self,
        where_clause: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Permission>, StorageError> {
        let sql = format!(
            "SELECT {} FROM permissions WHERE {} ORDER BY rowid",
            GRANT_COLUMNS, where_clause
        );

        self.db.retry_transient("query_grants", || {
            self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(|e| sql_error("Failed to prepare query", e))?;
                let rows = stmt
                    .query_map(params, grant_from_row)
                    .map_err(|e| sql_error("Failed to query grants", e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| sql_error("Failed to read grant row", e))
            })
        })
    }

    // =========================================================================
    // Grants
    // =========================================================================

    /// Insert a grant, replacing any existing one for the same node and
    /// principal. Returns the stored row.
    pub fn upsert_grant(&self, grant: &Permission) -> Result<Permission, StorageError> {
        self.db.retry_transient("upsert_grant", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO permissions (id, content_node_id, principal_kind, principal_id,
                     level, granted_by, expires_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (content_node_id, principal_kind, principal_id) DO UPDATE SET
                        level = excluded.level,
                        granted_by = excluded.granted_by,
                        expires_at = excluded.expires_at,
                        updated_at = excluded.updated_at",
                    params![
                        grant.id,
                        grant.content_node_id,
                        grant.principal.kind(),
                        grant.principal.id(),
                        grant.level,
                        grant.granted_by,
                        grant.expires_at,
                        grant.created_at,
                        grant.updated_at,
                    ],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        StorageError::NotFound(format!("content node {}", grant.content_node_id))
                    } else {
                        sql_error("Failed to upsert grant", e)
                    }
                })
            })
        })?;

        debug!(
            node_id = %grant.content_node_id,
            principal = %grant.principal,
            level = %grant.level,
            "Stored grant"
        );

        self.get_grant_for(&grant.content_node_id, &grant.principal)?
            .ok_or_else(|| StorageError::Internal("Grant vanished after upsert".into()))
    }

    pub fn get_grant(&self, id: &str) -> Result<Option<Permission>, StorageError> {
        Ok(self.query_grants("id = ?1", params![id])?.into_iter().next())
    }

    /// The grant held by `principal` on a node, if any
    pub fn get_grant_for(
        &self,
        node_id: &str,
        principal: &Principal,
    ) -> Result<Option<Permission>, StorageError> {
        let grants = self.query_grants(
            "content_node_id = ?1 AND principal_kind = ?2 AND principal_id = ?3",
            params![node_id, principal.kind(), principal.id()],
        )?;
        Ok(grants.into_iter().next())
    }

    /// Overwrite level, grantor and expiry of an existing grant
    pub fn update_grant(&self, grant: &Permission) -> Result<(), StorageError> {
        let updated = self.db.retry_transient("update_grant", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE permissions SET level = ?1, granted_by = ?2, expires_at = ?3,
                     updated_at = ?4 WHERE id = ?5",
                    params![
                        grant.level,
                        grant.granted_by,
                        grant.expires_at,
                        grant.updated_at,
                        grant.id,
                    ],
                )
                .map_err(|e| sql_error("Failed to update grant", e))
            })
        })?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!("permission {}", grant.id)));
        }
        Ok(())
    }

    /// Delete the grants of `principal` on a node. Returns the number removed.
    pub fn delete_grants(&self, node_id: &str, principal: &Principal) -> Result<usize, StorageError> {
        self.db.retry_transient("delete_grants", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM permissions
                     WHERE content_node_id = ?1 AND principal_kind = ?2 AND principal_id = ?3",
                    params![node_id, principal.kind(), principal.id()],
                )
                .map_err(|e| sql_error("Failed to delete grants", e))
            })
        })
    }

    /// All grants on a node, expired ones included
    pub fn grants_on_node(&self, node_id: &str) -> Result<Vec<Permission>, StorageError> {
        self.query_grants("content_node_id = ?1", params![node_id])
    }

    /// Grants on a node held by `user_id` directly or by any of `group_ids`
    pub fn grants_for(
        &self,
        node_id: &str,
        user_id: &str,
        group_ids: &[String],
    ) -> Result<Vec<Permission>, StorageError> {
        let mut where_clause = String::from(
            "content_node_id = ? AND ((principal_kind = 'USER' AND principal_id = ?)",
        );
        if !group_ids.is_empty() {
            let placeholders = vec!["?"; group_ids.len()].join(", ");
            where_clause.push_str(&format!(
                " OR (principal_kind = 'GROUP' AND principal_id IN ({}))",
                placeholders
            ));
        }
        where_clause.push(')');

        let mut bind: Vec<&dyn ToSql> = vec![&node_id, &user_id];
        bind.extend(group_ids.iter().map(|id| id as &dyn ToSql));

        self.query_grants(&where_clause, &bind)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn create_group(&self, group: &PermissionGroup) -> Result<(), StorageError> {
        self.db.retry_transient("create_group", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO permission_groups (id, name, description, owner_id, is_public,
                     created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        group.id,
                        group.name,
                        group.description,
                        group.owner_id,
                        group.is_public,
                        group.created_at,
                        group.updated_at,
                    ],
                )
                .map_err(|e| sql_error("Failed to create group", e))
            })
        })?;
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> Result<Option<PermissionGroup>, StorageError> {
        self.db.retry_transient("get_group", || {
            self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, name, description, owner_id, is_public, created_at, updated_at
                     FROM permission_groups WHERE id = ?1",
                    params![id],
                    group_from_row,
                )
                .optional()
                .map_err(|e| sql_error("Failed to get group", e))
            })
        })
    }

    /// Delete a group together with its memberships and grants
    pub fn delete_group(&self, id: &str) -> Result<bool, StorageError> {
        self.db.retry_transient("delete_group", || {
            self.db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| sql_error("Failed to start transaction", e))?;

                tx.execute(
                    "DELETE FROM permissions WHERE principal_kind = 'GROUP' AND principal_id = ?1",
                    params![id],
                )
                .map_err(|e| sql_error("Failed to delete group grants", e))?;
                tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![id])
                    .map_err(|e| sql_error("Failed to delete group members", e))?;
                let deleted = tx
                    .execute("DELETE FROM permission_groups WHERE id = ?1", params![id])
                    .map_err(|e| sql_error("Failed to delete group", e))?;

                tx.commit()
                    .map_err(|e| sql_error("Failed to commit group delete", e))?;
                Ok(deleted > 0)
            })
        })
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add a member; an existing membership is a `Conflict`
    pub fn add_member(&self, member: &GroupMember) -> Result<(), StorageError> {
        self.db.retry_transient("add_member", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO group_members (group_id, user_id, role, joined_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![member.group_id, member.user_id, member.role, member.joined_at],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        StorageError::Conflict(format!(
                            "user {} is already a member of group {}",
                            member.user_id, member.group_id
                        ))
                    } else {
                        sql_error("Failed to add member", e)
                    }
                })
            })
        })?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, user_id: &str) -> Result<bool, StorageError> {
        let removed = self.db.retry_transient("remove_member", || {
            self.db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                )
                .map_err(|e| sql_error("Failed to remove member", e))
            })
        })?;
        Ok(removed > 0)
    }

    pub fn get_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<GroupMember>, StorageError> {
        self.db.retry_transient("get_member", || {
            self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT group_id, user_id, role, joined_at FROM group_members
                     WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                    member_from_row,
                )
                .optional()
                .map_err(|e| sql_error("Failed to get member", e))
            })
        })
    }

    /// Ids of the groups `user_id` belongs to
    pub fn groups_of_user(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        self.db.retry_transient("groups_of_user", || {
            self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id")
                    .map_err(|e| sql_error("Failed to prepare query", e))?;
                let rows = stmt
                    .query_map(params![user_id], |row| row.get(0))
                    .map_err(|e| sql_error("Failed to query groups", e))?;
                rows.collect::<Result<Vec<String>, _>>()
                    .map_err(|e| sql_error("Failed to read group row", e))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ModuleBody;
    use crate::db::content_store::ContentStore;
    use crate::db::models::{ContentNode, GroupRole, Metadata, PermissionLevel};
    use chrono::Utc;

    fn setup() -> (PermissionStore, String) {
        let db = Arc::new(LearningDb::open_in_memory().unwrap());
        let node = ContentNode::new(
            ModuleBody {
                title: "Algorithms".into(),
                ..Default::default()
            }
            .into(),
            Metadata::new(),
            "owner",
        );
        ContentStore::new(db.clone()).insert_root(&node).unwrap();
        (PermissionStore::new(db), node.id)
    }

    fn grant(node_id: &str, principal: Principal, level: PermissionLevel) -> Permission {
        let now = Utc::now();
        Permission {
            id: uuid::Uuid::new_v4().to_string(),
            content_node_id: node_id.to_string(),
            principal,
            level,
            granted_by: Some("owner".into()),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn group(id: &str) -> PermissionGroup {
        let now = Utc::now();
        PermissionGroup {
            id: id.into(),
            name: id.into(),
            description: None,
            owner_id: "owner".into(),
            is_public: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_upsert_replaces_existing_grant() {
        let (store, node_id) = setup();
        let alice = Principal::User("alice".into());

        let first = store
            .upsert_grant(&grant(&node_id, alice.clone(), PermissionLevel::View))
            .unwrap();
        let second = store
            .upsert_grant(&grant(&node_id, alice.clone(), PermissionLevel::Edit))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.level, PermissionLevel::Edit);
        assert_eq!(store.grants_on_node(&node_id).unwrap().len(), 1);
    }

    #[test]
    fn test_grant_on_missing_node() {
        let (store, _) = setup();
        let err = store
            .upsert_grant(&grant("missing", Principal::User("a".into()), PermissionLevel::View))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_grants_for_user_and_groups() {
        let (store, node_id) = setup();
        store.create_group(&group("g1")).unwrap();
        store
            .upsert_grant(&grant(&node_id, Principal::User("alice".into()), PermissionLevel::View))
            .unwrap();
        store
            .upsert_grant(&grant(&node_id, Principal::Group("g1".into()), PermissionLevel::Edit))
            .unwrap();
        store
            .upsert_grant(&grant(&node_id, Principal::User("bob".into()), PermissionLevel::Admin))
            .unwrap();

        let grants = store.grants_for(&node_id, "alice", &["g1".into()]).unwrap();
        assert_eq!(grants.len(), 2);

        let grants = store.grants_for(&node_id, "alice", &[]).unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].level, PermissionLevel::View);
    }

    #[test]
    fn test_delete_group_removes_grants_and_members() {
        let (store, node_id) = setup();
        store.create_group(&group("g1")).unwrap();
        store
            .add_member(&GroupMember {
                group_id: "g1".into(),
                user_id: "alice".into(),
                role: GroupRole::Member,
                joined_at: Utc::now(),
            })
            .unwrap();
        store
            .upsert_grant(&grant(&node_id, Principal::Group("g1".into()), PermissionLevel::Edit))
            .unwrap();

        assert!(store.delete_group("g1").unwrap());
        assert!(store.get_group("g1").unwrap().is_none());
        assert!(store.groups_of_user("alice").unwrap().is_empty());
        assert!(store.grants_on_node(&node_id).unwrap().is_empty());
        assert!(!store.delete_group("g1").unwrap());
    }

    #[test]
    fn test_duplicate_member_is_conflict() {
        let (store, _) = setup();
        store.create_group(&group("g1")).unwrap();
        let member = GroupMember {
            group_id: "g1".into(),
            user_id: "alice".into(),
            role: GroupRole::Member,
            joined_at: Utc::now(),
        };

        store.add_member(&member).unwrap();
        assert_eq!(store.add_member(&member).unwrap_err().code(), "conflict");
        assert_eq!(store.groups_of_user("alice").unwrap(), vec!["g1".to_string()]);

        assert!(store.remove_member("g1", "alice").unwrap());
        assert!(store.get_member("g1", "alice").unwrap().is_none());
    }
}
