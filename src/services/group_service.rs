//! Group management
//!
//! Groups let one grant cover many users. Membership rules:
//! - private groups: only the owner or a group ADMIN adds members
//! - public groups: anyone may add a plain MEMBER
//! - members may remove themselves; owner and group admins may remove anyone
//! - only the owner deletes a group

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::db::models::{GroupMember, GroupRole, PermissionGroup, PermissionLevel};
use crate::db::PermissionStore;
use crate::error::StorageError;

use super::events::{EventBus, StorageEvent};

pub struct GroupService {
    permissions: PermissionStore,
    events: Arc<EventBus>,
}

impl GroupService {
    pub fn new(permissions: PermissionStore, events: Arc<EventBus>) -> Self {
        Self {
            permissions,
            events,
        }
    }

    pub fn create_group(
        &self,
        name: &str,
        description: Option<String>,
        is_public: bool,
        owner_id: &str,
    ) -> Result<PermissionGroup, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::BadRequest("group name is required".into()));
        }

        let now = Utc::now();
        let group = PermissionGroup {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            owner_id: owner_id.to_string(),
            is_public,
            created_at: now,
            updated_at: now,
        };
        self.permissions.create_group(&group)?;

        info!(group_id = %group.id, owner = owner_id, "Created group");
        self.events.emit(StorageEvent::GroupCreated {
            id: group.id.clone(),
            owner_id: owner_id.to_string(),
        });
        Ok(group)
    }

    /// Visible to its owner, its members, and anyone when public
    pub fn get_group(&self, id: &str, requester: &str) -> Result<PermissionGroup, StorageError> {
        let group = self.load(id)?;
        if group.is_public
            || group.owner_id == requester
            || self.permissions.get_member(id, requester)?.is_some()
        {
            return Ok(group);
        }
        Err(denied(requester, id, PermissionLevel::View))
    }

    pub fn add_member(
        &self,
        group_id: &str,
        user_id: &str,
        role: GroupRole,
        added_by: &str,
    ) -> Result<GroupMember, StorageError> {
        let group = self.load(group_id)?;

        let self_service = group.is_public && role == GroupRole::Member;
        if !self_service && !self.is_manager(&group, added_by)? {
            return Err(denied(added_by, group_id, PermissionLevel::Admin));
        }

        let member = GroupMember {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            role,
            joined_at: Utc::now(),
        };
        self.permissions.add_member(&member)?;

        self.events.emit(StorageEvent::MemberAdded {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(member)
    }

    pub fn remove_member(
        &self,
        group_id: &str,
        user_id: &str,
        removed_by: &str,
    ) -> Result<(), StorageError> {
        let group = self.load(group_id)?;
        if removed_by != user_id && !self.is_manager(&group, removed_by)? {
            return Err(denied(removed_by, group_id, PermissionLevel::Admin));
        }

        if !self.permissions.remove_member(group_id, user_id)? {
            return Err(StorageError::NotFound(format!(
                "user {} is not a member of group {}",
                user_id, group_id
            )));
        }

        self.events.emit(StorageEvent::MemberRemoved {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Delete a group and every grant made to it
    pub fn delete_group(&self, group_id: &str, deleted_by: &str) -> Result<(), StorageError> {
        let group = self.load(group_id)?;
        if group.owner_id != deleted_by {
            return Err(denied(deleted_by, group_id, PermissionLevel::Admin));
        }

        self.permissions.delete_group(group_id)?;

        info!(group_id, "Deleted group");
        self.events.emit(StorageEvent::GroupDeleted {
            id: group_id.to_string(),
        });
        Ok(())
    }

    fn load(&self, id: &str) -> Result<PermissionGroup, StorageError> {
        self.permissions
            .get_group(id)?
            .ok_or_else(|| StorageError::NotFound(format!("group {}", id)))
    }

    fn is_manager(&self, group: &PermissionGroup, user_id: &str) -> Result<bool, StorageError> {
        if group.owner_id == user_id {
            return Ok(true);
        }
        Ok(self
            .permissions
            .get_member(&group.id, user_id)?
            .map_or(false, |member| member.role == GroupRole::Admin))
    }
}

/// Viewing a group needs VIEW, managing it needs ADMIN
fn denied(user_id: &str, group_id: &str, required: PermissionLevel) -> StorageError {
    StorageError::forbidden(user_id, group_id, required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LearningDb;

    fn service() -> GroupService {
        let db = Arc::new(LearningDb::open_in_memory().unwrap());
        GroupService::new(PermissionStore::new(db), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_private_group_membership() {
        let groups = service();
        let group = groups.create_group("editors", None, false, "owner").unwrap();

        assert!(groups.get_group(&group.id, "alice").is_err());
        assert!(groups
            .add_member(&group.id, "alice", GroupRole::Member, "alice")
            .is_err());

        groups
            .add_member(&group.id, "alice", GroupRole::Admin, "owner")
            .unwrap();
        groups
            .add_member(&group.id, "bob", GroupRole::Member, "alice")
            .unwrap();
        assert_eq!(groups.get_group(&group.id, "bob").unwrap().name, "editors");

        let err = groups
            .add_member(&group.id, "bob", GroupRole::Member, "owner")
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn test_public_group_self_join() {
        let groups = service();
        let group = groups.create_group("readers", None, true, "owner").unwrap();

        groups
            .add_member(&group.id, "alice", GroupRole::Member, "alice")
            .unwrap();
        assert!(groups
            .add_member(&group.id, "mallory", GroupRole::Admin, "mallory")
            .is_err());
        assert!(groups.get_group(&group.id, "stranger").is_ok());
    }

    #[test]
    fn test_remove_and_delete() {
        let groups = service();
        let group = groups.create_group("readers", None, true, "owner").unwrap();
        groups
            .add_member(&group.id, "alice", GroupRole::Member, "alice")
            .unwrap();
        groups
            .add_member(&group.id, "bob", GroupRole::Member, "bob")
            .unwrap();

        assert!(groups.remove_member(&group.id, "bob", "alice").is_err());
        groups.remove_member(&group.id, "alice", "alice").unwrap();
        groups.remove_member(&group.id, "bob", "owner").unwrap();
        assert_eq!(
            groups.remove_member(&group.id, "bob", "owner").unwrap_err().code(),
            "not_found"
        );

        assert!(groups.delete_group(&group.id, "alice").is_err());
        groups.delete_group(&group.id, "owner").unwrap();
        assert_eq!(
            groups.get_group(&group.id, "owner").unwrap_err().code(),
            "not_found"
        );
    }

    #[test]
    fn test_group_name_required() {
        let groups = service();
        assert_eq!(
            groups.create_group(" ", None, false, "owner").unwrap_err().code(),
            "bad_request"
        );
    }
}
