//! Service layer for lamad-store
//!
//! Services hold the business rules between callers and the stores:
//! - permission checks before every read and mutation
//! - structural invariants of the content graph
//! - validation of interaction events against live content
//! - event emission for audit
//!
//! ## Architecture
//!
//! ```text
//! Callers (HTTP layer, content generation, CLI)
//!     ↓
//! ContentGraphService / InteractionService / GroupService
//!     ↓
//! PermissionResolver
//!     ↓
//! ContentStore / PermissionStore / InteractionStore (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod permission_resolver;
pub mod content_graph;
pub mod interaction_payload;
pub mod interaction_service;
pub mod group_service;

// Re-exports
pub use content_graph::{ContentGraphService, LessonView, ModuleView, NodePatch, NodeView};
pub use events::{EventBus, EventListener, StorageEvent};
pub use group_service::GroupService;
pub use interaction_payload::{EventInput, EventPayload};
pub use interaction_service::{InteractionHandler, InteractionService, LessonProgress};
pub use permission_resolver::PermissionResolver;

use std::sync::Arc;

use crate::config::Config;
use crate::db::{ContentStore, InteractionStore, LearningDb, PermissionStore};

/// Service container
///
/// Stores are built once over the shared database and injected into each
/// service through its constructor.
pub struct Services {
    pub permissions: Arc<PermissionResolver>,
    pub graph: Arc<ContentGraphService>,
    pub interactions: Arc<InteractionService>,
    pub groups: Arc<GroupService>,
    pub events: Arc<EventBus>,
}

impl Services {
    pub fn new(db: Arc<LearningDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_bus_capacity));

        let content = ContentStore::new(db.clone());
        let permission_store = PermissionStore::new(db.clone());
        let interaction_store = InteractionStore::new(db, config.append_conflict_retries);

        let permissions = Arc::new(PermissionResolver::new(
            content.clone(),
            permission_store.clone(),
            events.clone(),
            config.max_inheritance_depth,
        ));
        let graph = Arc::new(ContentGraphService::new(
            content,
            permission_store.clone(),
            permissions.clone(),
            events.clone(),
        ));
        let interactions = Arc::new(InteractionService::new(
            interaction_store,
            graph.clone(),
            permissions.clone(),
            events.clone(),
        ));
        let groups = Arc::new(GroupService::new(permission_store, events.clone()));

        Self {
            permissions,
            graph,
            interactions,
            groups,
            events,
        }
    }
}
