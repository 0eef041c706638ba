//! Content graph service - node lifecycle and link invariants
//!
//! Every LESSON and EXERCISE is created together with its owning DEPENDENCY
//! link from a MODULE (and, for exercises, optionally from a LESSON) in a
//! single transaction. Links are never retargeted afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::body::{ExerciseBody, LessonBody, ModuleBody, NodeBody};
use crate::db::models::{
    ContentLink, ContentNode, LinkType, Metadata, NodeStatus, NodeType, PermissionLevel,
};
use crate::db::{ContentStore, PermissionStore};
use crate::error::StorageError;

use super::events::{EventBus, StorageEvent};
use super::permission_resolver::PermissionResolver;

// =============================================================================
// Inputs and views
// =============================================================================

/// Partial update for `edit_node`. Body and metadata are merged shallowly,
/// status is replaced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default)]
    pub body: Option<Map<String, Value>>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

/// A lesson with the exercises it owns
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonView {
    pub lesson: ContentNode,
    pub exercises: Vec<ContentNode>,
}

/// Read-only assembly of a module
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleView {
    pub module: ContentNode,
    pub lessons: Vec<LessonView>,
    /// Exercises owned by the module but by none of its lessons
    pub exercises: Vec<ContentNode>,
    /// Level the requesting user holds on the module
    pub permission: PermissionLevel,
}

/// A node together with its owners
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node: ContentNode,
    pub module_id: Option<String>,
    pub lesson_id: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct ContentGraphService {
    content: ContentStore,
    permissions: PermissionStore,
    resolver: Arc<PermissionResolver>,
    events: Arc<EventBus>,
}

impl ContentGraphService {
    pub fn new(
        content: ContentStore,
        permissions: PermissionStore,
        resolver: Arc<PermissionResolver>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            content,
            permissions,
            resolver,
            events,
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create a root MODULE in DRAFT
    pub fn create_module(
        &self,
        body: ModuleBody,
        owner_id: &str,
    ) -> Result<ContentNode, StorageError> {
        let node = new_node(body.into(), owner_id)?;
        self.content.insert_root(&node)?;
        self.created(&node);
        Ok(node)
    }

    /// Create a LESSON owned by `module_id`
    pub fn create_lesson(
        &self,
        module_id: &str,
        body: LessonBody,
        owner_id: &str,
    ) -> Result<ContentNode, StorageError> {
        let module = self.module_for_edit(module_id, owner_id)?;
        let node = new_node(body.into(), owner_id)?;

        let link = ContentLink::new(&module, &node.id, LinkType::Dependency);
        self.content.insert_with_links(&node, &[link])?;
        self.created(&node);
        Ok(node)
    }

    /// Create an EXERCISE owned by `module_id` and, optionally, by one of
    /// that module's lessons
    pub fn create_exercise(
        &self,
        module_id: &str,
        lesson_id: Option<&str>,
        body: ExerciseBody,
        owner_id: &str,
    ) -> Result<ContentNode, StorageError> {
        let module = self.module_for_edit(module_id, owner_id)?;
        let node = new_node(body.into(), owner_id)?;

        let mut links = vec![ContentLink::new(&module, &node.id, LinkType::Dependency)];
        if let Some(lesson_id) = lesson_id {
            let lesson = self.owned_lesson(&module, lesson_id)?;
            links.push(ContentLink::new(&lesson, &node.id, LinkType::Dependency));
        }

        self.content.insert_with_links(&node, &links)?;
        self.created(&node);
        Ok(node)
    }

    fn module_for_edit(&self, module_id: &str, user_id: &str) -> Result<ContentNode, StorageError> {
        let module = self.resolver.require(user_id, module_id, PermissionLevel::Edit)?;
        expect_type(&module, NodeType::Module)?;
        Ok(module)
    }

    /// The lesson, provided `module` is its owning module
    fn owned_lesson(&self, module: &ContentNode, lesson_id: &str) -> Result<ContentNode, StorageError> {
        let lesson = self
            .content
            .get_node(lesson_id)?
            .ok_or_else(|| StorageError::NotFound(format!("lesson {}", lesson_id)))?;
        expect_type(&lesson, NodeType::Lesson)?;

        let owned = self
            .content
            .links_to(lesson_id)?
            .iter()
            .any(|link| link.is_module_owner() && link.from_id == module.id);
        if !owned {
            return Err(StorageError::BadRequest(format!(
                "lesson {} does not belong to module {}",
                lesson_id, module.id
            )));
        }
        Ok(lesson)
    }

    fn created(&self, node: &ContentNode) {
        info!(node_id = %node.id, node_type = %node.node_type, owner = %node.owner_id, "Created node");
        self.events.emit(StorageEvent::NodeCreated {
            id: node.id.clone(),
            node_type: node.node_type,
            owner_id: node.owner_id.clone(),
        });
    }

    // =========================================================================
    // Edit and publish
    // =========================================================================

    /// Merge `patch` into a node. Links are left untouched.
    pub fn edit_node(
        &self,
        id: &str,
        patch: NodePatch,
        user_id: &str,
    ) -> Result<ContentNode, StorageError> {
        self.resolver.require(user_id, id, PermissionLevel::Edit)?;

        let node = self.content.modify_node(id, |node| {
            if let Some(body_patch) = &patch.body {
                node.body = node.body.merge_patch(body_patch)?;
            }
            if let Some(metadata) = &patch.metadata {
                node.metadata.extend(metadata.clone());
            }
            if let Some(status) = patch.status {
                node.status = status;
            }
            node.updated_at = Utc::now();
            Ok(())
        })?;

        debug!(node_id = %node.id, status = %node.status, "Edited node");
        self.events.emit(StorageEvent::NodeUpdated {
            id: node.id.clone(),
            status: node.status,
        });
        Ok(node)
    }

    /// Mark a module and every DRAFT node reachable from it over DEPENDENCY
    /// links as CREATED, in one transaction. ARCHIVED descendants stay archived.
    pub fn publish(&self, module_id: &str, user_id: &str) -> Result<ContentNode, StorageError> {
        self.module_for_edit(module_id, user_id)?;

        let published =
            self.content
                .set_status_cascade(module_id, NodeStatus::Created, Utc::now(), |module| {
                    if module.status == NodeStatus::Archived {
                        return Err(StorageError::BadRequest(format!(
                            "module {} is archived",
                            module.id
                        )));
                    }
                    Ok(())
                })?;

        info!(module_id, nodes = published.len(), "Published module");
        self.events.emit(StorageEvent::ModulePublished {
            id: module_id.to_string(),
            node_count: published.len(),
        });

        self.node(module_id)
    }

    /// Archive the module's current lessons and create `lessons` in their
    /// place, all or nothing
    pub fn replace_lessons(
        &self,
        module_id: &str,
        lessons: Vec<LessonBody>,
        user_id: &str,
    ) -> Result<Vec<ContentNode>, StorageError> {
        let module = self.module_for_edit(module_id, user_id)?;

        let mut rows = Vec::with_capacity(lessons.len());
        for body in lessons {
            let node = new_node(body.into(), user_id)?;
            let link = ContentLink::new(&module, &node.id, LinkType::Dependency);
            rows.push((node, link));
        }

        let archived = self.content.replace_lessons(&module.id, &rows, Utc::now())?;
        let created: Vec<ContentNode> = rows.into_iter().map(|(node, _)| node).collect();

        self.events.emit(StorageEvent::LessonsReplaced {
            module_id: module.id,
            archived,
            created: created.iter().map(|node| node.id.clone()).collect(),
        });
        Ok(created)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Assemble a module with its live lessons and exercises
    pub fn get_module(&self, id: &str, user_id: &str) -> Result<ModuleView, StorageError> {
        let module = self.node(id)?;
        let permission = self.resolver.require_on(user_id, &module, PermissionLevel::View)?;
        expect_type(&module, NodeType::Module)?;

        let mut lessons = Vec::new();
        let mut lesson_owned = HashSet::new();
        for lesson in live(self.content.children(&module.id, NodeType::Lesson)?) {
            let exercises = live(self.content.children(&lesson.id, NodeType::Exercise)?);
            lesson_owned.extend(exercises.iter().map(|exercise| exercise.id.clone()));
            lessons.push(LessonView { lesson, exercises });
        }

        let exercises = live(self.content.children(&module.id, NodeType::Exercise)?)
            .into_iter()
            .filter(|exercise| !lesson_owned.contains(&exercise.id))
            .collect();

        Ok(ModuleView {
            module,
            lessons,
            exercises,
            permission,
        })
    }

    /// A single node with its owning module and lesson
    pub fn get_node(&self, id: &str, user_id: &str) -> Result<NodeView, StorageError> {
        let node = self.resolver.require(user_id, id, PermissionLevel::View)?;

        let mut module_id = None;
        let mut lesson_id = None;
        for link in self.content.links_to(id)? {
            if link.is_module_owner() {
                module_id = Some(link.from_id);
            } else if link.is_lesson_owner() {
                lesson_id = Some(link.from_id);
            }
        }

        Ok(NodeView {
            node,
            module_id,
            lesson_id,
        })
    }

    /// Modules the user can at least view
    pub fn list_modules(&self, user_id: &str) -> Result<Vec<ContentNode>, StorageError> {
        let groups = self.permissions.groups_of_user(user_id)?;
        let mut visible = Vec::new();
        for module in self.content.candidate_modules(user_id, &groups)? {
            if self.resolver.resolve(user_id, &module)?.is_some() {
                visible.push(module);
            }
        }
        Ok(visible)
    }

    /// Current state of a node, without permission checks
    pub fn node(&self, id: &str) -> Result<ContentNode, StorageError> {
        self.content
            .get_node(id)?
            .ok_or_else(|| StorageError::NotFound(format!("content node {}", id)))
    }
}

fn new_node(body: NodeBody, owner_id: &str) -> Result<ContentNode, StorageError> {
    body.validate()?;
    Ok(ContentNode::new(body, Metadata::new(), owner_id))
}

fn expect_type(node: &ContentNode, expected: NodeType) -> Result<(), StorageError> {
    if node.node_type != expected {
        return Err(StorageError::BadRequest(format!(
            "node {} is a {}, expected {}",
            node.id, node.node_type, expected
        )));
    }
    Ok(())
}

fn live(nodes: Vec<ContentNode>) -> Vec<ContentNode> {
    nodes
        .into_iter()
        .filter(|node| node.status != NodeStatus::Archived)
        .collect()
}
