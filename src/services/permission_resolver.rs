//! Permission resolution
//!
//! The effective level of a user on a node is found by walking DEPENDENCY
//! links upward from the node, breadth first. At each node the user's level
//! is, in order of precedence:
//!
//! 1. ADMIN if the user owns the node
//! 2. the level of a direct, unexpired user grant
//! 3. the strongest unexpired grant of any group the user belongs to
//!
//! The nearest depth that yields a level wins; nodes at the same depth
//! contribute their strongest level. When nothing is found the node's own
//! public default applies, else that of the nearest public ancestor.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::models::{ContentNode, LinkType, Permission, PermissionLevel, Principal};
use crate::db::{ContentStore, PermissionStore};
use crate::error::StorageError;

use super::events::{EventBus, StorageEvent};

pub struct PermissionResolver {
    content: ContentStore,
    permissions: PermissionStore,
    events: Arc<EventBus>,
    max_depth: u32,
}

impl PermissionResolver {
    pub fn new(
        content: ContentStore,
        permissions: PermissionStore,
        events: Arc<EventBus>,
        max_depth: u32,
    ) -> Self {
        Self {
            content,
            permissions,
            events,
            max_depth,
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Whether `user_id` holds at least `required` on the node
    pub fn check(
        &self,
        user_id: &str,
        node_id: &str,
        required: PermissionLevel,
    ) -> Result<bool, StorageError> {
        Ok(self
            .effective_level(user_id, node_id)?
            .map_or(false, |level| level >= required))
    }

    /// Resolved level of `user_id` on the node, `None` when denied outright
    pub fn effective_level(
        &self,
        user_id: &str,
        node_id: &str,
    ) -> Result<Option<PermissionLevel>, StorageError> {
        let node = self.load(node_id)?;
        self.resolve(user_id, &node)
    }

    /// Load a node and fail with `Forbidden` unless `user_id` holds `required`
    pub fn require(
        &self,
        user_id: &str,
        node_id: &str,
        required: PermissionLevel,
    ) -> Result<ContentNode, StorageError> {
        let node = self.load(node_id)?;
        self.require_on(user_id, &node, required)?;
        Ok(node)
    }

    pub fn require_on(
        &self,
        user_id: &str,
        node: &ContentNode,
        required: PermissionLevel,
    ) -> Result<PermissionLevel, StorageError> {
        match self.resolve(user_id, node)? {
            Some(level) if level >= required => Ok(level),
            _ => {
                debug!(user_id, node_id = %node.id, %required, "Permission denied");
                Err(StorageError::forbidden(user_id, &node.id, required))
            }
        }
    }

    /// Resolve against an already loaded node
    pub fn resolve(
        &self,
        user_id: &str,
        node: &ContentNode,
    ) -> Result<Option<PermissionLevel>, StorageError> {
        let groups = self.permissions.groups_of_user(user_id)?;
        let now = Utc::now();

        let mut visited: HashSet<String> = HashSet::from([node.id.clone()]);
        let mut frontier = vec![node.clone()];
        let mut public_default = None;
        let mut depth = 0;

        while !frontier.is_empty() {
            let mut best: Option<PermissionLevel> = None;
            let mut next = Vec::new();

            for current in &frontier {
                // Nearest public node on the walk supplies the fallback
                if public_default.is_none() && current.is_public {
                    public_default =
                        Some(current.default_permission.unwrap_or(PermissionLevel::View));
                }

                best = best.max(self.level_at(current, user_id, &groups, now)?);

                if depth < self.max_depth {
                    for link in self.content.links_to(&current.id)? {
                        if link.link_type != LinkType::Dependency
                            || !visited.insert(link.from_id.clone())
                        {
                            continue;
                        }
                        if let Some(parent) = self.content.get_node(&link.from_id)? {
                            next.push(parent);
                        }
                    }
                }
            }

            if best.is_some() {
                return Ok(best);
            }

            frontier = next;
            depth += 1;
        }

        Ok(public_default)
    }

    /// Level held on exactly this node, ignoring inheritance
    fn level_at(
        &self,
        node: &ContentNode,
        user_id: &str,
        groups: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionLevel>, StorageError> {
        if node.owner_id == user_id {
            return Ok(Some(PermissionLevel::Admin));
        }

        let grants: Vec<Permission> = self
            .permissions
            .grants_for(&node.id, user_id, groups)?
            .into_iter()
            .filter(|grant| grant.is_active_at(now))
            .collect();

        let direct = grants
            .iter()
            .filter(|grant| matches!(grant.principal, Principal::User(_)))
            .map(|grant| grant.level)
            .max();
        if direct.is_some() {
            return Ok(direct);
        }

        Ok(grants
            .iter()
            .filter(|grant| matches!(grant.principal, Principal::Group(_)))
            .map(|grant| grant.level)
            .max())
    }

    fn load(&self, node_id: &str) -> Result<ContentNode, StorageError> {
        self.content
            .get_node(node_id)?
            .ok_or_else(|| StorageError::NotFound(format!("content node {}", node_id)))
    }

    // =========================================================================
    // Grant management
    // =========================================================================

    /// Grant `level` on a node. Replaces any grant the principal already holds.
    pub fn grant(
        &self,
        node_id: &str,
        principal: Principal,
        level: PermissionLevel,
        granted_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Permission, StorageError> {
        self.require(granted_by, node_id, PermissionLevel::Admin)?;

        let now = Utc::now();
        validate_expiry(expires_at, now)?;
        if let Principal::Group(group_id) = &principal {
            if self.permissions.get_group(group_id)?.is_none() {
                return Err(StorageError::NotFound(format!("group {}", group_id)));
            }
        }

        let stored = self.permissions.upsert_grant(&Permission {
            id: uuid::Uuid::new_v4().to_string(),
            content_node_id: node_id.to_string(),
            principal: principal.clone(),
            level,
            granted_by: Some(granted_by.to_string()),
            expires_at,
            created_at: now,
            updated_at: now,
        })?;

        info!(node_id, principal = %principal, %level, granted_by, "Granted permission");
        self.events.emit(StorageEvent::PermissionGranted {
            node_id: node_id.to_string(),
            principal,
            level,
        });

        Ok(stored)
    }

    /// Remove the grant `principal` holds on a node
    pub fn revoke(
        &self,
        node_id: &str,
        principal: &Principal,
        revoked_by: &str,
    ) -> Result<(), StorageError> {
        self.require(revoked_by, node_id, PermissionLevel::Admin)?;

        if self.permissions.delete_grants(node_id, principal)? == 0 {
            return Err(StorageError::NotFound(format!(
                "no grant for {} on {}",
                principal, node_id
            )));
        }

        info!(node_id, principal = %principal, revoked_by, "Revoked permission");
        self.events.emit(StorageEvent::PermissionRevoked {
            node_id: node_id.to_string(),
            principal: principal.clone(),
        });
        Ok(())
    }

    /// Change level and expiry of an existing grant
    pub fn update(
        &self,
        permission_id: &str,
        level: PermissionLevel,
        expires_at: Option<DateTime<Utc>>,
        updated_by: &str,
    ) -> Result<Permission, StorageError> {
        let mut grant = self
            .permissions
            .get_grant(permission_id)?
            .ok_or_else(|| StorageError::NotFound(format!("permission {}", permission_id)))?;

        self.require(updated_by, &grant.content_node_id, PermissionLevel::Admin)?;

        let now = Utc::now();
        validate_expiry(expires_at, now)?;

        grant.level = level;
        grant.expires_at = expires_at;
        grant.granted_by = Some(updated_by.to_string());
        grant.updated_at = now;
        self.permissions.update_grant(&grant)?;

        self.events.emit(StorageEvent::PermissionUpdated {
            id: grant.id.clone(),
            level,
        });
        Ok(grant)
    }

    /// Every grant on a node, for its administrators
    pub fn list_grants(
        &self,
        node_id: &str,
        requested_by: &str,
    ) -> Result<Vec<Permission>, StorageError> {
        self.require(requested_by, node_id, PermissionLevel::Admin)?;
        self.permissions.grants_on_node(node_id)
    }

    /// Set the public fallback of a node
    pub fn set_sharing(
        &self,
        node_id: &str,
        is_public: bool,
        default_permission: Option<PermissionLevel>,
        changed_by: &str,
    ) -> Result<ContentNode, StorageError> {
        self.require(changed_by, node_id, PermissionLevel::Admin)?;

        let node = self.content.modify_node(node_id, |node| {
            node.is_public = is_public;
            node.default_permission = default_permission;
            node.updated_at = Utc::now();
            Ok(())
        })?;

        self.events.emit(StorageEvent::SharingChanged {
            node_id: node.id.clone(),
            is_public,
            default_permission,
        });
        Ok(node)
    }
}

fn validate_expiry(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    match expires_at {
        Some(expires) if expires <= now => Err(StorageError::BadRequest(format!(
            "expiry {} is not in the future",
            expires.to_rfc3339()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{ExerciseBody, LessonBody, ModuleBody};
    use crate::db::models::{
        ContentLink, GroupMember, GroupRole, Metadata, NodeStatus, PermissionGroup,
    };
    use crate::db::LearningDb;

    struct Fixture {
        db: Arc<LearningDb>,
        resolver: PermissionResolver,
        content: ContentStore,
        permissions: PermissionStore,
        module: ContentNode,
        lesson: ContentNode,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(LearningDb::open_in_memory().unwrap());
        let content = ContentStore::new(db.clone());
        let permissions = PermissionStore::new(db.clone());

        let module = ContentNode::new(
            ModuleBody {
                title: "Algorithms".into(),
                ..Default::default()
            }
            .into(),
            Metadata::new(),
            "owner",
        );
        content.insert_root(&module).unwrap();

        let lesson = ContentNode::new(
            LessonBody {
                title: "BFS".into(),
                ..Default::default()
            }
            .into(),
            Metadata::new(),
            "owner",
        );
        content
            .insert_with_links(
                &lesson,
                &[ContentLink::new(&module, &lesson.id, LinkType::Dependency)],
            )
            .unwrap();

        let resolver = PermissionResolver::new(
            content.clone(),
            permissions.clone(),
            Arc::new(EventBus::new()),
            16,
        );

        Fixture {
            db,
            resolver,
            content,
            permissions,
            module,
            lesson,
        }
    }

    fn add_group(f: &Fixture, group_id: &str, user_id: &str) {
        let now = Utc::now();
        f.permissions
            .create_group(&PermissionGroup {
                id: group_id.into(),
                name: group_id.into(),
                description: None,
                owner_id: "owner".into(),
                is_public: false,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        f.permissions
            .add_member(&GroupMember {
                group_id: group_id.into(),
                user_id: user_id.into(),
                role: GroupRole::Member,
                joined_at: now,
            })
            .unwrap();
    }

    #[test]
    fn test_owner_is_admin_without_grant() {
        let f = fixture();
        assert_eq!(
            f.resolver.effective_level("owner", &f.lesson.id).unwrap(),
            Some(PermissionLevel::Admin)
        );
        assert_eq!(f.resolver.effective_level("stranger", &f.lesson.id).unwrap(), None);
    }

    #[test]
    fn test_lesson_inherits_module_grant() {
        let f = fixture();
        f.resolver
            .grant(&f.module.id, Principal::User("alice".into()), PermissionLevel::Edit, "owner", None)
            .unwrap();

        assert!(f.resolver.check("alice", &f.lesson.id, PermissionLevel::Edit).unwrap());
        assert!(!f.resolver.check("alice", &f.lesson.id, PermissionLevel::Admin).unwrap());
    }

    #[test]
    fn test_nearest_grant_wins() {
        let f = fixture();
        let alice = Principal::User("alice".into());
        f.resolver
            .grant(&f.module.id, alice.clone(), PermissionLevel::Edit, "owner", None)
            .unwrap();
        f.resolver
            .grant(&f.lesson.id, alice, PermissionLevel::View, "owner", None)
            .unwrap();

        assert_eq!(
            f.resolver.effective_level("alice", &f.lesson.id).unwrap(),
            Some(PermissionLevel::View)
        );
    }

    #[test]
    fn test_direct_grant_takes_precedence_over_group() {
        let f = fixture();
        add_group(&f, "editors", "alice");
        f.resolver
            .grant(&f.module.id, Principal::Group("editors".into()), PermissionLevel::Edit, "owner", None)
            .unwrap();
        assert_eq!(
            f.resolver.effective_level("alice", &f.module.id).unwrap(),
            Some(PermissionLevel::Edit)
        );

        f.resolver
            .grant(&f.module.id, Principal::User("alice".into()), PermissionLevel::View, "owner", None)
            .unwrap();
        assert_eq!(
            f.resolver.effective_level("alice", &f.module.id).unwrap(),
            Some(PermissionLevel::View)
        );
    }

    #[test]
    fn test_expired_grant_is_ignored() {
        let f = fixture();
        let past = Utc::now() - chrono::Duration::hours(1);
        f.permissions
            .upsert_grant(&Permission {
                id: "expired".into(),
                content_node_id: f.module.id.clone(),
                principal: Principal::User("alice".into()),
                level: PermissionLevel::Admin,
                granted_by: Some("owner".into()),
                expires_at: Some(past),
                created_at: past,
                updated_at: past,
            })
            .unwrap();

        assert_eq!(f.resolver.effective_level("alice", &f.lesson.id).unwrap(), None);
    }

    #[test]
    fn test_public_default_applies_last() {
        let f = fixture();
        f.resolver
            .set_sharing(&f.module.id, true, Some(PermissionLevel::Interact), "owner")
            .unwrap();

        assert_eq!(
            f.resolver.effective_level("stranger", &f.lesson.id).unwrap(),
            Some(PermissionLevel::Interact)
        );

        f.resolver
            .set_sharing(&f.lesson.id, true, None, "owner")
            .unwrap();
        assert_eq!(
            f.resolver.effective_level("stranger", &f.lesson.id).unwrap(),
            Some(PermissionLevel::View)
        );
    }

    #[test]
    fn test_nearest_public_ancestor_sets_default() {
        let f = fixture();
        let exercise = ContentNode::new(ExerciseBody::default().into(), Metadata::new(), "owner");
        f.content
            .insert_with_links(
                &exercise,
                &[ContentLink::new(&f.lesson, &exercise.id, LinkType::Dependency)],
            )
            .unwrap();

        // A private node under a public module inherits the module's default
        f.resolver
            .set_sharing(&f.module.id, true, Some(PermissionLevel::Interact), "owner")
            .unwrap();
        assert_eq!(
            f.resolver.effective_level("stranger", &exercise.id).unwrap(),
            Some(PermissionLevel::Interact)
        );

        // The closer public lesson wins over the module, even when weaker
        f.resolver
            .set_sharing(&f.lesson.id, true, Some(PermissionLevel::View), "owner")
            .unwrap();
        assert_eq!(
            f.resolver.effective_level("stranger", &exercise.id).unwrap(),
            Some(PermissionLevel::View)
        );
        assert_eq!(
            f.resolver.effective_level("stranger", &f.module.id).unwrap(),
            Some(PermissionLevel::Interact)
        );
    }

    #[test]
    fn test_any_grant_outranks_public_default() {
        let f = fixture();
        f.resolver
            .set_sharing(&f.module.id, true, Some(PermissionLevel::Edit), "owner")
            .unwrap();
        f.resolver
            .grant(&f.module.id, Principal::User("alice".into()), PermissionLevel::View, "owner", None)
            .unwrap();

        assert_eq!(
            f.resolver.effective_level("alice", &f.lesson.id).unwrap(),
            Some(PermissionLevel::View)
        );
        assert_eq!(
            f.resolver.effective_level("bob", &f.lesson.id).unwrap(),
            Some(PermissionLevel::Edit)
        );
    }

    #[test]
    fn test_set_sharing_keeps_concurrent_status() {
        let f = fixture();
        f.content
            .set_status_cascade(&f.module.id, NodeStatus::Created, Utc::now(), |_| Ok(()))
            .unwrap();

        // f.module is the DRAFT snapshot taken before the cascade
        let shared = f
            .resolver
            .set_sharing(&f.module.id, true, None, "owner")
            .unwrap();
        assert_eq!(f.module.status, NodeStatus::Draft);
        assert_eq!(shared.status, NodeStatus::Created);
        assert!(shared.is_public);
    }

    #[test]
    fn test_grant_requires_admin() {
        let f = fixture();
        let err = f
            .resolver
            .grant(&f.module.id, Principal::User("bob".into()), PermissionLevel::View, "alice", None)
            .unwrap_err();
        assert_eq!(err, StorageError::forbidden("alice", &f.module.id, PermissionLevel::Admin));
    }

    #[test]
    fn test_grant_validation() {
        let f = fixture();
        let past = Utc::now() - chrono::Duration::minutes(1);

        let err = f
            .resolver
            .grant(&f.module.id, Principal::User("bob".into()), PermissionLevel::View, "owner", Some(past))
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");

        let err = f
            .resolver
            .grant(&f.module.id, Principal::Group("nope".into()), PermissionLevel::View, "owner", None)
            .unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = f
            .resolver
            .grant("missing", Principal::User("bob".into()), PermissionLevel::View, "owner", None)
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_revoke_and_update() {
        let f = fixture();
        let bob = Principal::User("bob".into());
        let grant = f
            .resolver
            .grant(&f.module.id, bob.clone(), PermissionLevel::View, "owner", None)
            .unwrap();

        let updated = f
            .resolver
            .update(&grant.id, PermissionLevel::Edit, None, "owner")
            .unwrap();
        assert_eq!(updated.level, PermissionLevel::Edit);
        assert!(f.resolver.check("bob", &f.module.id, PermissionLevel::Edit).unwrap());

        f.resolver.revoke(&f.module.id, &bob, "owner").unwrap();
        assert!(!f.resolver.check("bob", &f.module.id, PermissionLevel::View).unwrap());

        let err = f.resolver.revoke(&f.module.id, &bob, "owner").unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(f.resolver.list_grants(&f.module.id, "owner").unwrap().len(), 0);
    }

    #[test]
    fn test_walk_depth_is_bounded() {
        let f = fixture();
        let exercise = ContentNode::new(ExerciseBody::default().into(), Metadata::new(), "owner");
        f.content
            .insert_with_links(
                &exercise,
                &[ContentLink::new(&f.lesson, &exercise.id, LinkType::Dependency)],
            )
            .unwrap();
        f.resolver
            .grant(&f.module.id, Principal::User("alice".into()), PermissionLevel::Edit, "owner", None)
            .unwrap();

        assert_eq!(
            f.resolver.effective_level("alice", &exercise.id).unwrap(),
            Some(PermissionLevel::Edit)
        );

        let shallow = PermissionResolver::new(
            f.content.clone(),
            f.permissions.clone(),
            Arc::new(EventBus::new()),
            1,
        );
        assert_eq!(shallow.effective_level("alice", &exercise.id).unwrap(), None);
    }

    #[test]
    fn test_walk_survives_cycles() {
        let f = fixture();
        // lesson -> module closes a DEPENDENCY cycle
        f.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO content_links (id, from_id, to_id, link_type, source_type, created_at)
                 VALUES ('back', ?1, ?2, 'DEPENDENCY', 'LESSON', ?3)",
                rusqlite::params![f.lesson.id, f.module.id, Utc::now()],
            )
            .map_err(|e| StorageError::Internal(e.to_string()))
        })
        .unwrap();

        assert_eq!(f.resolver.effective_level("stranger", &f.lesson.id).unwrap(), None);
        assert_eq!(
            f.resolver.effective_level("owner", &f.lesson.id).unwrap(),
            Some(PermissionLevel::Admin)
        );
    }
}
