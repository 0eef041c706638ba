//! Interaction service - validated appends to per (node, user) logs
//!
//! `record` runs the same sequence for every event:
//!
//! 1. load the node (`NotFound`)
//! 2. require INTERACT (`Forbidden`)
//! 3. parse the payload (`BadRequest`)
//! 4. dispatch on (node type, event type) to a handler (`BadRequest` when none)
//! 5. the handler validates against the node's current body (`BadRequest`)
//! 6. append through the store's atomic primitive
//!
//! Validation always reads the live body, so removing an item from a lesson
//! blocks new interactions with it while earlier events stay in the log.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::body::ContentItem;
use crate::db::models::{
    ContentNode, EventType, InteractionEvent, InteractionLog, NodeType, PermissionLevel,
};
use crate::db::InteractionStore;
use crate::error::StorageError;

use super::content_graph::ContentGraphService;
use super::events::{EventBus, StorageEvent};
use super::interaction_payload::{EventInput, EventPayload};
use super::permission_resolver::PermissionResolver;

/// Validates an event against the node it targets
pub trait InteractionHandler: Send + Sync {
    fn validate(&self, node: &ContentNode, payload: &EventPayload) -> Result<(), StorageError>;
}

/// Quiz answers and question submissions on a lesson. The target item must
/// exist in one of the lesson's chunks.
pub struct LessonItemHandler;

impl InteractionHandler for LessonItemHandler {
    fn validate(&self, node: &ContentNode, payload: &EventPayload) -> Result<(), StorageError> {
        let lesson = node.body.as_lesson().ok_or_else(|| {
            StorageError::BadRequest(format!("node {} has no lesson body", node.id))
        })?;

        let item_id = payload.target_item_id();
        let item = lesson.find_item(item_id).ok_or_else(|| {
            StorageError::BadRequest(format!(
                "invalid interaction: item {} not found for event type {}",
                item_id,
                payload.event_type()
            ))
        })?;

        if let (EventPayload::QuizAnswer(answer), ContentItem::Quiz(quiz)) = (payload, item) {
            if answer.selected_option_index >= quiz.options.len() {
                return Err(StorageError::BadRequest(format!(
                    "invalid interaction: quiz {} has {} options, got index {}",
                    quiz.id,
                    quiz.options.len(),
                    answer.selected_option_index
                )));
            }
        }
        Ok(())
    }
}

/// A lesson with the user's interaction history on it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
    pub lesson: ContentNode,
    pub log: Option<InteractionLog>,
}

pub struct InteractionService {
    store: InteractionStore,
    graph: Arc<ContentGraphService>,
    resolver: Arc<PermissionResolver>,
    events: Arc<EventBus>,
    handlers: HashMap<(NodeType, EventType), Arc<dyn InteractionHandler>>,
}

impl InteractionService {
    pub fn new(
        store: InteractionStore,
        graph: Arc<ContentGraphService>,
        resolver: Arc<PermissionResolver>,
        events: Arc<EventBus>,
    ) -> Self {
        let mut handlers: HashMap<(NodeType, EventType), Arc<dyn InteractionHandler>> =
            HashMap::new();
        let lesson: Arc<dyn InteractionHandler> = Arc::new(LessonItemHandler);
        handlers.insert((NodeType::Lesson, EventType::QuizAnswer), lesson.clone());
        handlers.insert((NodeType::Lesson, EventType::QuestionSubmit), lesson);

        Self {
            store,
            graph,
            resolver,
            events,
            handlers,
        }
    }

    /// Validate `input` against the node and append it to the user's log
    pub fn record(
        &self,
        node_id: &str,
        user_id: &str,
        input: &EventInput,
    ) -> Result<InteractionLog, StorageError> {
        let node = self.graph.node(node_id)?;
        self.resolver
            .require_on(user_id, &node, PermissionLevel::Interact)?;

        let payload = EventPayload::parse(input)?;
        let event_type = payload.event_type();

        let handler = self.handlers.get(&(node.node_type, event_type)).ok_or_else(|| {
            StorageError::BadRequest(format!(
                "unsupported interaction type {} for content type {}",
                event_type, node.node_type
            ))
        })?;
        handler.validate(&node, &payload)?;

        let event = InteractionEvent::new(event_type, payload.to_value()?);
        let log = self.store.append(node_id, user_id, &event)?;

        info!(
            node_id,
            user_id,
            event_type = %event_type,
            item = payload.target_item_id(),
            events = log.len(),
            "Recorded interaction"
        );
        self.events.emit(StorageEvent::InteractionRecorded {
            node_id: node_id.to_string(),
            user_id: user_id.to_string(),
            event_type,
            log_len: log.len(),
        });

        Ok(log)
    }

    /// The user's log on a node. `NotFound` until the first event is recorded.
    pub fn get(&self, node_id: &str, user_id: &str) -> Result<InteractionLog, StorageError> {
        let node = self.graph.node(node_id)?;
        self.resolver.require_on(user_id, &node, PermissionLevel::View)?;

        self.store.get(node_id, user_id)?.ok_or_else(|| {
            StorageError::NotFound(format!(
                "no interactions for user {} on node {}",
                user_id, node_id
            ))
        })
    }

    /// A lesson with the user's log on it, if any
    pub fn lesson_progress(
        &self,
        lesson_id: &str,
        user_id: &str,
    ) -> Result<LessonProgress, StorageError> {
        let lesson = self.graph.node(lesson_id)?;
        self.resolver.require_on(user_id, &lesson, PermissionLevel::View)?;
        if lesson.node_type != NodeType::Lesson {
            return Err(StorageError::BadRequest(format!(
                "node {} is a {}, expected {}",
                lesson.id,
                lesson.node_type,
                NodeType::Lesson
            )));
        }

        let log = self.store.get(lesson_id, user_id)?;
        debug!(lesson_id, user_id, events = log.as_ref().map_or(0, |l| l.len()), "Loaded lesson progress");
        Ok(LessonProgress { lesson, log })
    }
}
